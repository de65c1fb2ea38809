//! Group operator: group-by over one key column with a per-group
//! aggregate.
//!
//! Emits two aligned columns: the distinct keys (sorted by key value for a
//! deterministic layout) and one aggregate value per group. Without an
//! aggregate column the operator counts group members.

use super::{
    chunk_elements, publish_slice, publish_u64, require_column, run_guarded, value_as_f64,
    with_scalar_type, Operator, Scalar,
};
use crate::catalog::Catalog;
use crate::column::{Column, DataType};
use crate::plan::{AggregateKind, GroupPayload, OperatorPayload, WorkItem, WorkResponse};
use std::collections::HashMap;
use std::sync::Arc;

pub fn build(catalog: Arc<Catalog>, item: WorkItem) -> Box<dyn Operator> {
    Box::new(GroupOperator { catalog, item })
}

struct GroupOperator {
    catalog: Arc<Catalog>,
    item: WorkItem,
}

impl Operator for GroupOperator {
    fn run(&mut self) -> WorkResponse {
        let catalog = Arc::clone(&self.catalog);
        let item = self.item.clone();
        run_guarded(&self.item, move || {
            let OperatorPayload::Group(payload) = &item.payload else {
                anyhow::bail!("work item does not carry group data");
            };
            let keys = require_column(&catalog, &payload.key)?;
            let dtype = keys.dtype();
            if matches!(
                dtype,
                DataType::Float32 | DataType::Float64 | DataType::Bitmask | DataType::Unknown
            ) {
                anyhow::bail!("unsupported datatype {dtype:?} for group keys");
            }
            with_scalar_type!(dtype, T, {
                group_by::<T>(&catalog, payload, &keys)
            })
        })
    }
}

struct GroupAccumulator {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl GroupAccumulator {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn feed(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn finish(&self, kind: AggregateKind) -> f64 {
        match kind {
            AggregateKind::Sum => self.sum,
            AggregateKind::Count => self.count as f64,
            AggregateKind::Min => self.min,
            AggregateKind::Max => self.max,
            AggregateKind::Avg => self.sum / self.count.max(1) as f64,
        }
    }
}

fn group_by<T: Scalar>(
    catalog: &Catalog,
    payload: &GroupPayload,
    keys: &Arc<Column>,
) -> anyhow::Result<u64> {
    let aggregate = payload
        .aggregate
        .as_ref()
        .map(|r| require_column(catalog, r))
        .transpose()?;
    if let Some(agg) = &aggregate {
        if agg.elements() != keys.elements() {
            anyhow::bail!(
                "element mismatch between key column ({}) and aggregate column ({})",
                keys.elements(),
                agg.elements()
            );
        }
    }

    // key bits -> (representative key, accumulator)
    let mut groups: HashMap<u64, (T, GroupAccumulator)> = HashMap::new();
    let mut cursor = keys.chunks::<T>(chunk_elements::<T>());
    let mut row = 0usize;
    while let Some(chunk) = cursor.next() {
        for &key in chunk {
            let bits = key
                .key_bits()
                .ok_or_else(|| anyhow::anyhow!("unsupported datatype for group keys"))?;
            let entry = groups
                .entry(bits)
                .or_insert_with(|| (key, GroupAccumulator::new()));
            let value = match &aggregate {
                Some(agg) => value_as_f64(agg, row)?,
                None => 1.0,
            };
            entry.1.feed(value);
            row += 1;
        }
    }

    let mut ordered: Vec<(u64, (T, GroupAccumulator))> = groups.into_iter().collect();
    ordered.sort_by_key(|&(bits, _)| bits);

    let key_values: Vec<T> = ordered.iter().map(|(_, (key, _))| *key).collect();
    publish_slice(catalog, &payload.key_output, keys.dtype(), &key_values);

    let group_count = ordered.len() as u64;
    if payload.kind == AggregateKind::Count {
        let counts: Vec<u64> = ordered.iter().map(|(_, (_, acc))| acc.count).collect();
        publish_u64(catalog, &payload.agg_output, DataType::UInt64, &counts);
    } else {
        let values: Vec<f64> = ordered
            .iter()
            .map(|(_, (_, acc))| acc.finish(payload.kind))
            .collect();
        publish_slice(catalog, &payload.agg_output, DataType::Float64, &values);
    }
    Ok(group_count)
}
