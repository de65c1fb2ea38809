//! Result operator: the terminal item of every plan.
//!
//! Gathers the named result columns, checks that they are equally long,
//! renders them as tab-separated text (translating string codes through
//! the dictionary), and optionally persists the table under `./results/`.

use super::{require_column, run_guarded, Operator, Scalar};
use crate::catalog::Catalog;
use crate::column::{Column, DataType};
use crate::operators::with_scalar_type;
use crate::plan::{OperatorPayload, ResultPayload, WorkItem, WorkResponse};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const RESULT_DIRECTORY: &str = "./results";

pub fn build(catalog: Arc<Catalog>, item: WorkItem) -> Box<dyn Operator> {
    Box::new(ResultOperator { catalog, item })
}

struct ResultOperator {
    catalog: Arc<Catalog>,
    item: WorkItem,
}

impl Operator for ResultOperator {
    fn run(&mut self) -> WorkResponse {
        let catalog = Arc::clone(&self.catalog);
        let item = self.item.clone();
        run_guarded(&self.item, move || {
            let OperatorPayload::Result(payload) = &item.payload else {
                anyhow::bail!("work item does not carry result data");
            };
            render_result(&catalog, payload)
        })
    }
}

fn render_value(column: &Arc<Column>, idx: usize, out: &mut String) -> anyhow::Result<()> {
    if column.dtype() == DataType::StringEnc {
        let code = column.as_slice::<u64>()[idx];
        let dictionary = column.wait_dictionary();
        dictionary.wait_ready();
        let value = dictionary
            .value_for(code)
            .ok_or_else(|| anyhow::anyhow!("dictionary has no entry for code {code}"))?;
        out.push_str(&value);
        return Ok(());
    }
    let dtype = column.dtype();
    with_scalar_type!(dtype, T, {
        let value = column.as_slice::<T>()[idx];
        let _ = write!(out, "{}", value.to_f64());
        Ok(())
    })
}

fn render_result(catalog: &Catalog, payload: &ResultPayload) -> anyhow::Result<u64> {
    let mut columns = Vec::with_capacity(payload.columns.len());
    for col in &payload.columns {
        columns.push(require_column(catalog, col)?);
    }
    if columns.is_empty() {
        anyhow::bail!("result item without result columns");
    }

    let elements = columns[0].elements();
    for (idx, col) in columns.iter().enumerate().skip(1) {
        if col.elements() != elements {
            anyhow::bail!(
                "element mismatch between {} ({elements}) and {} ({})",
                payload.columns[0].ident(),
                payload.columns[idx].ident(),
                col.elements()
            );
        }
    }

    let mut table = String::new();
    let labels: Vec<String> = if payload.header.is_empty() {
        payload.columns.iter().map(|c| c.column.clone()).collect()
    } else {
        payload.header.clone()
    };
    table.push_str(&labels.join("\t"));
    table.push('\n');

    let index = payload
        .index
        .as_ref()
        .map(|r| require_column(catalog, r))
        .transpose()?;

    for row in 0..elements {
        let row = match &index {
            Some(index_col) => index_col.as_slice::<u64>()[row] as usize,
            None => row,
        };
        for (col_idx, column) in columns.iter().enumerate() {
            render_value(column, row, &mut table)?;
            table.push(if col_idx + 1 == columns.len() { '\n' } else { '\t' });
        }
    }

    if let Some(file_name) = &payload.file_name {
        let dir = Path::new(RESULT_DIRECTORY);
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{file_name}.tsv"));
        std::fs::write(&path, &table)?;
        debug!(path = %path.display(), rows = elements, "persisted result file");
    }

    Ok(elements as u64)
}
