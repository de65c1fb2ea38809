//! Aggregate operator: sum / count / min / max / avg over one column.
//!
//! Consumes the input through the blocking chunk cursor, so aggregation
//! overlaps with a producer that is still publishing. The output is a
//! single-element column: the input's type for sum/min/max, `u64` for
//! count, `f64` for avg.

use super::{
    chunk_elements, publish_slice, publish_u64, require_column, run_guarded, with_scalar_type,
    Operator, Scalar,
};
use crate::catalog::Catalog;
use crate::column::{Column, DataType};
use crate::plan::{AggregateKind, AggregatePayload, OperatorPayload, WorkItem, WorkResponse};
use std::sync::Arc;

pub fn build(catalog: Arc<Catalog>, item: WorkItem) -> Box<dyn Operator> {
    Box::new(AggregateOperator { catalog, item })
}

struct AggregateOperator {
    catalog: Arc<Catalog>,
    item: WorkItem,
}

impl Operator for AggregateOperator {
    fn run(&mut self) -> WorkResponse {
        let catalog = Arc::clone(&self.catalog);
        let item = self.item.clone();
        run_guarded(&self.item, move || {
            let OperatorPayload::Aggregate(payload) = &item.payload else {
                anyhow::bail!("work item does not carry aggregate data");
            };
            let column = require_column(&catalog, &payload.input)?;
            let dtype = column.dtype();
            if matches!(dtype, DataType::StringEnc | DataType::Bitmask | DataType::Unknown) {
                anyhow::bail!("unsupported datatype {dtype:?}");
            }
            with_scalar_type!(dtype, T, {
                aggregate::<T>(&catalog, payload, &column)
            })
        })
    }
}

fn aggregate<T: Scalar>(
    catalog: &Catalog,
    payload: &AggregatePayload,
    column: &Arc<Column>,
) -> anyhow::Result<u64> {
    let mut cursor = column.chunks::<T>(chunk_elements::<T>());
    let mut count = 0u64;
    let mut sum = 0.0f64;
    let mut min: Option<T> = None;
    let mut max: Option<T> = None;
    let mut typed_sum: Option<T> = None;

    while let Some(chunk) = cursor.next() {
        count += chunk.len() as u64;
        for &x in chunk {
            sum += x.to_f64();
            typed_sum = Some(match typed_sum {
                Some(acc) => acc.arith(x, crate::plan::ArithOp::Add),
                None => x,
            });
            min = Some(match min {
                Some(m) if m < x => m,
                _ => x,
            });
            max = Some(match max {
                Some(m) if m > x => m,
                _ => x,
            });
        }
    }

    if count == 0 && !matches!(payload.kind, AggregateKind::Count) {
        anyhow::bail!("cannot aggregate an empty column");
    }

    match payload.kind {
        AggregateKind::Count => {
            publish_u64(catalog, &payload.output, DataType::UInt64, &[count]);
        }
        AggregateKind::Avg => {
            publish_slice(
                catalog,
                &payload.output,
                DataType::Float64,
                &[sum / count as f64],
            );
        }
        AggregateKind::Sum => {
            let value = typed_sum.expect("non-empty input");
            publish_slice(catalog, &payload.output, column.dtype(), &[value]);
        }
        AggregateKind::Min => {
            let value = min.expect("non-empty input");
            publish_slice(catalog, &payload.output, column.dtype(), &[value]);
        }
        AggregateKind::Max => {
            let value = max.expect("non-empty input");
            publish_slice(catalog, &payload.output, column.dtype(), &[value]);
        }
    }
    Ok(1)
}
