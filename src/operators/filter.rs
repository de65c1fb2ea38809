//! Filter operator: predicate evaluation producing a position list.
//!
//! Numeric columns are scanned chunk by chunk through a blocking cursor,
//! so a filter can run while its input is still being staged. String
//! columns first resolve the predicate against the dictionary (waiting for
//! it to become ready), reducing every variant - equality, range, IN,
//! LIKE - to a membership test over codes.

use super::{
    chunk_elements, publish_u64, require_column, run_guarded, with_scalar_type, Operator, Scalar,
};
use crate::catalog::Catalog;
use crate::column::{Column, DataType};
use crate::plan::{CompareOp, FilterPayload, Literal, OperatorPayload, WorkItem, WorkResponse};
use std::collections::HashSet;
use std::sync::Arc;

pub fn build(catalog: Arc<Catalog>, item: WorkItem) -> Box<dyn Operator> {
    Box::new(FilterOperator { catalog, item })
}

struct FilterOperator {
    catalog: Arc<Catalog>,
    item: WorkItem,
}

impl Operator for FilterOperator {
    fn run(&mut self) -> WorkResponse {
        let catalog = Arc::clone(&self.catalog);
        let item = self.item.clone();
        run_guarded(&self.item, move || {
            let OperatorPayload::Filter(payload) = &item.payload else {
                anyhow::bail!("work item does not carry filter data");
            };
            let column = require_column(&catalog, &payload.input)?;
            match column.dtype() {
                DataType::StringEnc => filter_string(&catalog, payload, &column),
                DataType::Unknown | DataType::Bitmask => {
                    anyhow::bail!("unsupported datatype {:?}", column.dtype())
                }
                dtype => with_scalar_type!(dtype, T, {
                    filter_numeric::<T>(&catalog, payload, &column)
                }),
            }
        })
    }
}

fn literal<T: Scalar>(payload: &FilterPayload, idx: usize) -> anyhow::Result<T> {
    payload
        .values
        .get(idx)
        .and_then(T::from_literal)
        .ok_or_else(|| anyhow::anyhow!("filter literal does not match the column type"))
}

fn filter_numeric<T: Scalar>(
    catalog: &Catalog,
    payload: &FilterPayload,
    column: &Arc<Column>,
) -> anyhow::Result<u64> {
    let predicate: Box<dyn Fn(T) -> bool> = match payload.op {
        CompareOp::Eq => {
            let v: T = literal(payload, 0)?;
            Box::new(move |x| x == v)
        }
        CompareOp::Ne => {
            let v: T = literal(payload, 0)?;
            Box::new(move |x| x != v)
        }
        CompareOp::Lt => {
            let v: T = literal(payload, 0)?;
            Box::new(move |x| x < v)
        }
        CompareOp::Le => {
            let v: T = literal(payload, 0)?;
            Box::new(move |x| x <= v)
        }
        CompareOp::Gt => {
            let v: T = literal(payload, 0)?;
            Box::new(move |x| x > v)
        }
        CompareOp::Ge => {
            let v: T = literal(payload, 0)?;
            Box::new(move |x| x >= v)
        }
        CompareOp::Between => {
            let lo: T = literal(payload, 0)?;
            let hi: T = literal(payload, 1)?;
            Box::new(move |x| x >= lo && x <= hi)
        }
        CompareOp::In => {
            let values: Vec<T> = payload
                .values
                .iter()
                .map(|l| T::from_literal(l))
                .collect::<Option<Vec<T>>>()
                .ok_or_else(|| anyhow::anyhow!("filter literal does not match the column type"))?;
            Box::new(move |x| values.iter().any(|v| *v == x))
        }
        CompareOp::Like => {
            anyhow::bail!("LIKE is only defined on string-encoded columns")
        }
    };

    let mut cursor = column.chunks::<T>(chunk_elements::<T>());
    let mut positions: Vec<u64> = Vec::new();
    let mut base = 0u64;
    while let Some(chunk) = cursor.next() {
        for (i, &x) in chunk.iter().enumerate() {
            if predicate(x) {
                positions.push(base + i as u64);
            }
        }
        base += chunk.len() as u64;
    }

    let rows = positions.len() as u64;
    publish_u64(catalog, &payload.output, DataType::PositionList, &positions);
    Ok(rows)
}

fn string_literal(payload: &FilterPayload, idx: usize) -> anyhow::Result<&str> {
    match payload.values.get(idx) {
        Some(Literal::Str(s)) => Ok(s),
        _ => anyhow::bail!("filter on a string column needs string literals"),
    }
}

fn filter_string(
    catalog: &Catalog,
    payload: &FilterPayload,
    column: &Arc<Column>,
) -> anyhow::Result<u64> {
    let dictionary = column.wait_dictionary();
    dictionary.wait_ready();

    // Reduce every predicate to a code-membership test; `Ne` keeps the
    // complement semantics by inverting the test.
    let mut invert = false;
    let codes: HashSet<u64> = match payload.op {
        CompareOp::Eq => dictionary
            .code_for(string_literal(payload, 0)?)
            .into_iter()
            .collect(),
        CompareOp::Ne => {
            invert = true;
            dictionary
                .code_for(string_literal(payload, 0)?)
                .into_iter()
                .collect()
        }
        CompareOp::Lt => {
            let v = string_literal(payload, 0)?.to_string();
            dictionary.codes_where(|s| s < v.as_str())
        }
        CompareOp::Le => {
            let v = string_literal(payload, 0)?.to_string();
            dictionary.codes_where(|s| s <= v.as_str())
        }
        CompareOp::Gt => {
            let v = string_literal(payload, 0)?.to_string();
            dictionary.codes_where(|s| s > v.as_str())
        }
        CompareOp::Ge => {
            let v = string_literal(payload, 0)?.to_string();
            dictionary.codes_where(|s| s >= v.as_str())
        }
        CompareOp::Between => {
            dictionary.codes_in_range(string_literal(payload, 0)?, string_literal(payload, 1)?)
        }
        CompareOp::In => {
            let mut codes = HashSet::new();
            for value in &payload.values {
                let Literal::Str(s) = value else {
                    anyhow::bail!("filter on a string column needs string literals");
                };
                if let Some(code) = dictionary.code_for(s) {
                    codes.insert(code);
                }
            }
            codes
        }
        CompareOp::Like => dictionary.matching_codes(string_literal(payload, 0)?),
    };

    let mut cursor = column.chunks::<u64>(chunk_elements::<u64>());
    let mut positions: Vec<u64> = Vec::new();
    let mut base = 0u64;
    while let Some(chunk) = cursor.next() {
        for (i, &code) in chunk.iter().enumerate() {
            if codes.contains(&code) != invert {
                positions.push(base + i as u64);
            }
        }
        base += chunk.len() as u64;
    }

    let rows = positions.len() as u64;
    publish_u64(catalog, &payload.output, DataType::PositionList, &positions);
    Ok(rows)
}
