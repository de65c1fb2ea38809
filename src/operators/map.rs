//! Map operator: element-wise arithmetic with a constant or a partner
//! column.

use super::{
    chunk_elements, publish_slice, require_column, run_guarded, with_scalar_type, Operator, Scalar,
};
use crate::catalog::Catalog;
use crate::column::{Column, DataType};
use crate::plan::{MapPayload, OperatorPayload, WorkItem, WorkResponse};
use std::sync::Arc;

pub fn build(catalog: Arc<Catalog>, item: WorkItem) -> Box<dyn Operator> {
    Box::new(MapOperator { catalog, item })
}

struct MapOperator {
    catalog: Arc<Catalog>,
    item: WorkItem,
}

impl Operator for MapOperator {
    fn run(&mut self) -> WorkResponse {
        let catalog = Arc::clone(&self.catalog);
        let item = self.item.clone();
        run_guarded(&self.item, move || {
            let OperatorPayload::Map(payload) = &item.payload else {
                anyhow::bail!("work item does not carry map data");
            };
            let column = require_column(&catalog, &payload.input)?;
            let dtype = column.dtype();
            if matches!(
                dtype,
                DataType::StringEnc | DataType::Bitmask | DataType::Unknown
            ) {
                anyhow::bail!("unsupported datatype {dtype:?}");
            }
            with_scalar_type!(dtype, T, {
                map_column::<T>(&catalog, payload, &column)
            })
        })
    }
}

fn map_column<T: Scalar>(
    catalog: &Catalog,
    payload: &MapPayload,
    column: &Arc<Column>,
) -> anyhow::Result<u64> {
    let mut out: Vec<T> = Vec::with_capacity(column.elements());

    match &payload.partner {
        Some(partner_ref) => {
            let partner = require_column(catalog, partner_ref)?;
            if partner.elements() != column.elements() {
                anyhow::bail!(
                    "element mismatch between {} ({}) and {} ({})",
                    payload.input.ident(),
                    column.elements(),
                    partner_ref.ident(),
                    partner.elements()
                );
            }
            let rhs = partner.as_slice::<T>();
            let mut cursor = column.chunks::<T>(chunk_elements::<T>());
            let mut base = 0usize;
            while let Some(chunk) = cursor.next() {
                for (i, &x) in chunk.iter().enumerate() {
                    out.push(x.arith(rhs[base + i], payload.op));
                }
                base += chunk.len();
            }
        }
        None => {
            let constant = payload
                .constant
                .as_ref()
                .and_then(T::from_literal)
                .ok_or_else(|| anyhow::anyhow!("map constant does not match the column type"))?;
            let mut cursor = column.chunks::<T>(chunk_elements::<T>());
            while let Some(chunk) = cursor.next() {
                for &x in chunk {
                    out.push(x.arith(constant, payload.op));
                }
            }
        }
    }

    let rows = out.len() as u64;
    publish_slice(catalog, &payload.output, column.dtype(), &out);
    Ok(rows)
}
