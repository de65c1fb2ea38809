//! Process-wide registry of columns, keyed by `(table, column)`.
//!
//! The catalog is the single place operators look up their inputs and
//! register their outputs. It holds shared ownership of every column, so a
//! reader that already obtained a handle keeps a consistent snapshot even
//! if the column is dropped from the catalog concurrently; the backing
//! buffer lives until the last holder releases it.
//!
//! The catalog is an owned value, not a singleton: the compute unit creates
//! one at startup and hands an `Arc<Catalog>` to every subsystem.

use crate::column::Column;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

type TableMap = HashMap<String, HashMap<String, Arc<Column>>>;

/// `(table, column) -> Column` registry under a reader/writer lock.
pub struct Catalog {
    tables: RwLock<TableMap>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a column. Returns a shared handle or `None`.
    pub fn get(&self, table: &str, column: &str) -> Option<Arc<Column>> {
        let tables = self.tables.read();
        tables.get(table)?.get(column).cloned()
    }

    /// Register a column. Fails (returns `None`) if the ident already
    /// exists; callers racing on an output typically take the existing
    /// column instead.
    pub fn add(&self, table: &str, column: &str, col: Arc<Column>) -> Option<Arc<Column>> {
        let mut tables = self.tables.write();
        let entry = tables.entry(table.to_string()).or_default();
        if entry.contains_key(column) {
            warn!(table, column, "column ident already exists, not adding");
            return None;
        }
        entry.insert(column.to_string(), Arc::clone(&col));
        debug!(table, column, "added column");
        Some(col)
    }

    /// Remove one column. Returns the number of erased entries (0 or 1).
    /// Handles already held elsewhere stay valid.
    pub fn remove(&self, table: &str, column: &str) -> usize {
        let mut tables = self.tables.write();
        let Some(cols) = tables.get_mut(table) else {
            warn!(table, column, "cannot remove column, table does not exist");
            return 0;
        };
        let erased = usize::from(cols.remove(column).is_some());
        if cols.is_empty() {
            tables.remove(table);
        }
        if erased == 0 {
            warn!(table, column, "cannot remove column, ident does not exist");
        }
        erased
    }

    /// Drop a whole table. Returns the number of erased columns.
    pub fn drop_table(&self, table: &str) -> usize {
        let mut tables = self.tables.write();
        match tables.remove(table) {
            Some(cols) => cols.len(),
            None => {
                warn!(table, "cannot drop table, it does not exist");
                0
            }
        }
    }

    /// Purge everything. The registry itself stays usable.
    pub fn clear(&self) {
        self.tables.write().clear();
    }

    pub fn column_count(&self) -> usize {
        self.tables.read().values().map(HashMap::len).sum()
    }

    /// Total in-memory size of all columns, dictionary content included.
    pub fn total_size(&self) -> usize {
        let tables = self.tables.read();
        tables
            .values()
            .flat_map(HashMap::values)
            .map(|col| {
                let dict = col.dictionary().map(|d| d.approx_size()).unwrap_or(0);
                col.size_bytes() + dict
            })
            .sum()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
