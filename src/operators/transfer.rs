//! Data-transfer operator: stage a column into a local copy.
//!
//! The destination column is pre-registered by the compute-unit front-end
//! when the query group arrives, so dependent operators can already
//! resolve it in the catalog and block on its watermark. The copy runs in
//! 4 MiB chunks, advancing the watermark after each one; consumers start
//! reading while the tail is still in flight. String-encoded columns share
//! the source's dictionary.

use super::{publish, require_column, run_guarded, Operator, CHUNK_BYTES};
use crate::catalog::Catalog;
use crate::column::{Column, DataType};
use crate::plan::{OperatorPayload, WorkItem, WorkResponse};
use std::sync::Arc;

pub fn build(catalog: Arc<Catalog>, item: WorkItem) -> Box<dyn Operator> {
    Box::new(TransferOperator { catalog, item })
}

struct TransferOperator {
    catalog: Arc<Catalog>,
    item: WorkItem,
}

impl Operator for TransferOperator {
    fn run(&mut self) -> WorkResponse {
        let catalog = Arc::clone(&self.catalog);
        let item = self.item.clone();
        run_guarded(&self.item, move || {
            let OperatorPayload::Transfer(payload) = &item.payload else {
                anyhow::bail!("work item does not carry transfer data");
            };
            let source = require_column(&catalog, &payload.source)?;

            // Normally pre-registered on group reception; direct work
            // requests create it here.
            let destination = match catalog.get(&payload.destination.table, &payload.destination.column)
            {
                Some(col) => col,
                None => {
                    let col = Arc::new(Column::new(
                        source.dtype(),
                        source.elements(),
                        false,
                        None,
                    ));
                    publish(&catalog, &payload.destination, col)
                }
            };

            if source.dtype() == DataType::StringEnc {
                destination.init_dictionary(source.dictionary());
            }
            destination.allocate();

            let bytes = source.raw();
            let mut offset = 0usize;
            while offset < bytes.len() {
                let len = CHUNK_BYTES.min(bytes.len() - offset);
                destination.append_chunk(offset, &bytes[offset..offset + len]);
                destination.advance(len);
                offset += len;
            }
            destination.mark_complete();
            Ok(source.elements() as u64)
        })
    }
}
