//! Sort operator: argsort of one column into a position list.

use super::{publish_u64, require_column, run_guarded, with_scalar_type, Operator, Scalar};
use crate::catalog::Catalog;
use crate::column::{Column, DataType};
use crate::plan::{OperatorPayload, SortPayload, WorkItem, WorkResponse};
use std::sync::Arc;

pub fn build(catalog: Arc<Catalog>, item: WorkItem) -> Box<dyn Operator> {
    Box::new(SortOperator { catalog, item })
}

struct SortOperator {
    catalog: Arc<Catalog>,
    item: WorkItem,
}

impl Operator for SortOperator {
    fn run(&mut self) -> WorkResponse {
        let catalog = Arc::clone(&self.catalog);
        let item = self.item.clone();
        run_guarded(&self.item, move || {
            let OperatorPayload::Sort(payload) = &item.payload else {
                anyhow::bail!("work item does not carry sort data");
            };
            let column = require_column(&catalog, &payload.input)?;
            let dtype = column.dtype();
            if matches!(dtype, DataType::Bitmask | DataType::Unknown) {
                anyhow::bail!("unsupported datatype {dtype:?}");
            }
            with_scalar_type!(dtype, T, {
                argsort::<T>(&catalog, payload, &column)
            })
        })
    }
}

fn argsort<T: Scalar>(
    catalog: &Catalog,
    payload: &SortPayload,
    column: &Arc<Column>,
) -> anyhow::Result<u64> {
    let values = column.as_slice::<T>();
    let mut order: Vec<u64> = (0..values.len() as u64).collect();
    // Stable sort keeps equal keys in input order, which makes the output
    // deterministic across runs.
    order.sort_by(|&a, &b| {
        let cmp = values[a as usize]
            .partial_cmp(&values[b as usize])
            .unwrap_or(std::cmp::Ordering::Equal);
        if payload.descending {
            cmp.reverse()
        } else {
            cmp
        }
    });

    let rows = order.len() as u64;
    publish_u64(catalog, &payload.output, DataType::PositionList, &order);
    Ok(rows)
}
