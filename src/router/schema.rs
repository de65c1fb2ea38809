//! Static base-column size table used by the transfer cost model.
//!
//! The router never holds column data, but the cost model needs byte sizes
//! for every base column the plans reference. Sizes come either from a
//! `schema.txt` (same format the compute units ingest from) plus a row
//! count per table, or are registered programmatically.

use crate::column::DataType;
use crate::ingest::{parse_schema, SchemaColumn};
use std::collections::HashMap;
use std::path::Path;

/// `table.column -> size in bytes`.
#[derive(Clone, Debug, Default)]
pub struct ColumnSizes {
    sizes: HashMap<String, u64>,
}

impl ColumnSizes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ident: impl Into<String>, size_bytes: u64) {
        self.sizes.insert(ident.into(), size_bytes);
    }

    pub fn get(&self, ident: &str) -> Option<u64> {
        self.sizes.get(ident).copied()
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Load a schema file and derive per-column sizes from per-table row
    /// counts. Tables without a row count are skipped.
    pub fn from_schema_file(
        path: &Path,
        row_counts: &HashMap<String, u64>,
    ) -> anyhow::Result<Self> {
        let schema = parse_schema(path)?;
        let mut sizes = Self::new();
        for (table, columns) in schema {
            let Some(&rows) = row_counts.get(&table) else {
                continue;
            };
            for SchemaColumn { name, dtype } in columns {
                let width = dtype.width().unwrap_or(0) as u64;
                sizes.insert(format!("{table}.{name}"), rows * width);
            }
        }
        Ok(sizes)
    }

    /// Uniform-width helper used when only row counts are known; assumes
    /// 8-byte values, which matches the dominant `u64`-shaped columns.
    pub fn from_row_counts(row_counts: &HashMap<String, HashMap<String, u64>>) -> Self {
        let mut sizes = Self::new();
        for (table, columns) in row_counts {
            for (column, rows) in columns {
                let width = DataType::UInt64.width().unwrap_or(8) as u64;
                sizes.insert(format!("{table}.{column}"), rows * width);
            }
        }
        sizes
    }
}
