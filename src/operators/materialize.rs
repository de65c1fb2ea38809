//! Materialize operator: gather source values by position list.
//!
//! The position list is consumed chunk by chunk and the output watermark
//! advances after every gathered chunk, so downstream readers follow along
//! while materialization is still running. A string-encoded output shares
//! the source column's dictionary instead of copying it.

use super::{
    chunk_elements, publish, require_column, run_guarded, with_scalar_type, Operator,
};
use crate::catalog::Catalog;
use crate::column::{Column, DataType};
use crate::plan::{MaterializePayload, OperatorPayload, WorkItem, WorkResponse};
use std::sync::Arc;

pub fn build(catalog: Arc<Catalog>, item: WorkItem) -> Box<dyn Operator> {
    Box::new(MaterializeOperator { catalog, item })
}

struct MaterializeOperator {
    catalog: Arc<Catalog>,
    item: WorkItem,
}

impl Operator for MaterializeOperator {
    fn run(&mut self) -> WorkResponse {
        let catalog = Arc::clone(&self.catalog);
        let item = self.item.clone();
        run_guarded(&self.item, move || {
            let OperatorPayload::Materialize(payload) = &item.payload else {
                anyhow::bail!("work item does not carry materialize data");
            };
            let positions = require_column(&catalog, &payload.positions)?;
            let source = require_column(&catalog, &payload.source)?;
            let dtype = source.dtype();
            if matches!(dtype, DataType::Bitmask | DataType::Unknown) {
                anyhow::bail!("unsupported datatype {dtype:?}");
            }
            with_scalar_type!(dtype, T, {
                materialize::<T>(&catalog, payload, &positions, &source)
            })
        })
    }
}

fn materialize<T: Copy>(
    catalog: &Catalog,
    payload: &MaterializePayload,
    positions: &Arc<Column>,
    source: &Arc<Column>,
) -> anyhow::Result<u64> {
    let values = source.as_slice::<T>();

    let output = Arc::new(Column::new(source.dtype(), positions.elements(), false, None));
    if source.dtype() == DataType::StringEnc {
        output.init_dictionary(source.dictionary());
    }
    output.allocate();
    publish(catalog, &payload.output, Arc::clone(&output));

    let width = std::mem::size_of::<T>();
    let mut cursor = positions.chunks::<u64>(chunk_elements::<u64>());
    let mut written = 0usize;
    let mut gathered: Vec<T> = Vec::new();
    while let Some(chunk) = cursor.next() {
        gathered.clear();
        gathered.reserve(chunk.len());
        for &pos in chunk {
            let pos = pos as usize;
            if pos >= values.len() {
                anyhow::bail!("position {pos} out of bounds for {} elements", values.len());
            }
            gathered.push(values[pos]);
        }
        output.write_slice(written, &gathered);
        output.advance(gathered.len() * width);
        written += gathered.len();
    }
    output.mark_complete();
    Ok(written as u64)
}
