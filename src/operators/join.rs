//! Hash join on two key columns.
//!
//! Builds a hash table over the inner (smaller, by convention) column and
//! probes it with the outer column, emitting a pair of position lists - one
//! per side - that downstream materialize items turn into payload columns.
//! Keys must have a stable bit pattern, so float columns are rejected;
//! only equality predicates are supported.

use super::{
    chunk_elements, publish_u64, require_column, run_guarded, with_scalar_type, Operator, Scalar,
};
use crate::catalog::Catalog;
use crate::column::{Column, DataType};
use crate::plan::{CompareOp, JoinPayload, OperatorPayload, WorkItem, WorkResponse};
use std::collections::HashMap;
use std::sync::Arc;

pub fn build(catalog: Arc<Catalog>, item: WorkItem) -> Box<dyn Operator> {
    Box::new(JoinOperator { catalog, item })
}

struct JoinOperator {
    catalog: Arc<Catalog>,
    item: WorkItem,
}

impl Operator for JoinOperator {
    fn run(&mut self) -> WorkResponse {
        let catalog = Arc::clone(&self.catalog);
        let item = self.item.clone();
        run_guarded(&self.item, move || {
            let OperatorPayload::Join(payload) = &item.payload else {
                anyhow::bail!("work item does not carry join data");
            };
            if payload.predicate != CompareOp::Eq {
                anyhow::bail!("only equality joins are supported");
            }
            let inner = require_column(&catalog, &payload.inner)?;
            let outer = require_column(&catalog, &payload.outer)?;
            if inner.dtype() != outer.dtype() {
                anyhow::bail!(
                    "join key type mismatch: {:?} vs {:?}",
                    inner.dtype(),
                    outer.dtype()
                );
            }
            let dtype = inner.dtype();
            with_scalar_type!(dtype, T, {
                hash_join::<T>(&catalog, payload, &inner, &outer)
            })
        })
    }
}

fn hash_join<T: Scalar>(
    catalog: &Catalog,
    payload: &JoinPayload,
    inner: &Arc<Column>,
    outer: &Arc<Column>,
) -> anyhow::Result<u64> {
    // Build side: key bits -> inner positions.
    let mut table: HashMap<u64, Vec<u64>> = HashMap::new();
    let mut cursor = inner.chunks::<T>(chunk_elements::<T>());
    let mut base = 0u64;
    while let Some(chunk) = cursor.next() {
        for (i, &x) in chunk.iter().enumerate() {
            let key = x
                .key_bits()
                .ok_or_else(|| anyhow::anyhow!("unsupported datatype for join keys"))?;
            table.entry(key).or_default().push(base + i as u64);
        }
        base += chunk.len() as u64;
    }

    // Probe side.
    let mut inner_positions: Vec<u64> = Vec::new();
    let mut outer_positions: Vec<u64> = Vec::new();
    let mut cursor = outer.chunks::<T>(chunk_elements::<T>());
    let mut base = 0u64;
    while let Some(chunk) = cursor.next() {
        for (i, &x) in chunk.iter().enumerate() {
            let key = x
                .key_bits()
                .ok_or_else(|| anyhow::anyhow!("unsupported datatype for join keys"))?;
            if let Some(matches) = table.get(&key) {
                for &inner_pos in matches {
                    inner_positions.push(inner_pos);
                    outer_positions.push(base + i as u64);
                }
            }
        }
        base += chunk.len() as u64;
    }

    let rows = inner_positions.len() as u64;
    publish_u64(
        catalog,
        &payload.inner_output,
        DataType::PositionList,
        &inner_positions,
    );
    publish_u64(
        catalog,
        &payload.outer_output,
        DataType::PositionList,
        &outer_positions,
    );
    Ok(rows)
}
