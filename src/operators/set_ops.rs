//! Set operators over position lists: union and intersection.
//!
//! Both sides must be position lists (the outputs of filters). The result
//! is sorted and duplicate-free, so chained set operations stay canonical.

use super::{publish_u64, require_column, run_guarded, Operator};
use crate::catalog::Catalog;
use crate::column::DataType;
use crate::plan::{OperatorPayload, SetOpKind, WorkItem, WorkResponse};
use std::collections::HashSet;
use std::sync::Arc;

pub fn build(catalog: Arc<Catalog>, item: WorkItem) -> Box<dyn Operator> {
    Box::new(SetOperator { catalog, item })
}

struct SetOperator {
    catalog: Arc<Catalog>,
    item: WorkItem,
}

impl Operator for SetOperator {
    fn run(&mut self) -> WorkResponse {
        let catalog = Arc::clone(&self.catalog);
        let item = self.item.clone();
        run_guarded(&self.item, move || {
            let OperatorPayload::Set(payload) = &item.payload else {
                anyhow::bail!("work item does not carry set-operation data");
            };
            let inner = require_column(&catalog, &payload.inner)?;
            let outer = require_column(&catalog, &payload.outer)?;
            for (side, col) in [("inner", &inner), ("outer", &outer)] {
                if col.dtype() != DataType::PositionList {
                    anyhow::bail!("{side} column of a set operation must be a position list");
                }
            }

            let lhs = inner.as_slice::<u64>();
            let rhs = outer.as_slice::<u64>();
            let mut result: Vec<u64> = match payload.kind {
                SetOpKind::Union => {
                    let mut all: HashSet<u64> = lhs.iter().copied().collect();
                    all.extend(rhs.iter().copied());
                    all.into_iter().collect()
                }
                SetOpKind::Intersect => {
                    let left: HashSet<u64> = lhs.iter().copied().collect();
                    rhs.iter()
                        .copied()
                        .filter(|pos| left.contains(pos))
                        .collect::<HashSet<u64>>()
                        .into_iter()
                        .collect()
                }
            };
            result.sort_unstable();

            let rows = result.len() as u64;
            publish_u64(&catalog, &payload.output, DataType::PositionList, &result);
            Ok(rows)
        })
    }
}
