//! Base-data ingestion: schema parsing plus `bin` and `csv` table loaders.
//!
//! The ingest root contains a `schema.txt` describing every table:
//!
//! ```text
//! tablename: colname(type), colname(type), ...
//! ```
//!
//! Two payload layouts are supported:
//!
//! - **bin**: one raw little-endian file per column at
//!   `<root>/<table>/<col>.bin`. String columns store `u64` codes and
//!   additionally ship `<col>_dict.tsv` with one `<string>\t<code>` line
//!   per entry, codes matching the encoding order.
//! - **csv**: one `<root>/<table>.tbl` file with `|`-separated fields in
//!   schema column order; strings are dictionary-encoded on the fly.
//!
//! Ingested columns are registered complete in the catalog and tagged with
//! the configured CXL NUMA node.

use crate::catalog::Catalog;
use crate::column::{Column, DataType};
use crate::dictionary::Dictionary;
use anyhow::Context;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// One column declaration in `schema.txt`.
#[derive(Clone, Debug)]
pub struct SchemaColumn {
    pub name: String,
    pub dtype: DataType,
}

/// Which on-disk layout to ingest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BaseDataFormat {
    Bin,
    Csv,
}

impl FromStr for BaseDataFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bin" => Ok(BaseDataFormat::Bin),
            "csv" => Ok(BaseDataFormat::Csv),
            other => anyhow::bail!("unknown base data format {other:?} (expected bin or csv)"),
        }
    }
}

impl fmt::Display for BaseDataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BaseDataFormat::Bin => "bin",
            BaseDataFormat::Csv => "csv",
        })
    }
}

fn parse_type(token: &str) -> anyhow::Result<DataType> {
    Ok(match token {
        "i8" => DataType::Int8,
        "u8" => DataType::UInt8,
        "i16" => DataType::Int16,
        "u16" => DataType::UInt16,
        "i32" => DataType::Int32,
        "u32" => DataType::UInt32,
        "i64" => DataType::Int64,
        "u64" => DataType::UInt64,
        "f32" => DataType::Float32,
        "f64" => DataType::Float64,
        "timestamp" => DataType::Timestamp,
        "string" => DataType::StringEnc,
        other => anyhow::bail!("unknown column type {other:?} in schema"),
    })
}

/// Parse `<root>/schema.txt` (or a direct path to a schema file).
pub fn parse_schema(path: &Path) -> anyhow::Result<Vec<(String, Vec<SchemaColumn>)>> {
    let schema_path = if path.is_dir() {
        path.join("schema.txt")
    } else {
        path.to_path_buf()
    };
    let text = std::fs::read_to_string(&schema_path)
        .with_context(|| format!("reading schema file {}", schema_path.display()))?;

    let mut tables = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (table, columns) = line
            .split_once(':')
            .with_context(|| format!("malformed schema line {line:?}"))?;
        let mut parsed = Vec::new();
        for decl in columns.split(',') {
            let decl = decl.trim();
            if decl.is_empty() {
                continue;
            }
            let (name, rest) = decl
                .split_once('(')
                .with_context(|| format!("malformed column declaration {decl:?}"))?;
            let dtype = parse_type(rest.trim_end_matches(')').trim())?;
            parsed.push(SchemaColumn {
                name: name.trim().to_string(),
                dtype,
            });
        }
        tables.push((table.trim().to_string(), parsed));
    }
    Ok(tables)
}

/// Ingest every table of the schema into the catalog.
pub fn ingest(
    root: &Path,
    format: BaseDataFormat,
    catalog: &Catalog,
    numa_node: Option<usize>,
) -> anyhow::Result<()> {
    let schema = parse_schema(root)?;
    for (table, columns) in &schema {
        match format {
            BaseDataFormat::Bin => ingest_bin_table(root, table, columns, catalog, numa_node)?,
            BaseDataFormat::Csv => ingest_csv_table(root, table, columns, catalog, numa_node)?,
        }
        info!(table, columns = columns.len(), "ingested table");
    }
    Ok(())
}

fn register(
    catalog: &Catalog,
    table: &str,
    name: &str,
    dtype: DataType,
    bytes: &[u8],
    dictionary: Option<Arc<Dictionary>>,
    numa_node: Option<usize>,
) -> anyhow::Result<()> {
    let width = dtype
        .width()
        .with_context(|| format!("type {dtype:?} has no fixed width"))?;
    anyhow::ensure!(
        bytes.len() % width == 0,
        "column file size {} is not a multiple of the element width {width}",
        bytes.len()
    );
    let column = Arc::new(Column::new(dtype, bytes.len() / width, true, numa_node));
    if let Some(dictionary) = dictionary {
        column.init_dictionary(Some(dictionary));
    }
    column.allocate();
    column.append_chunk(0, bytes);
    anyhow::ensure!(
        catalog.add(table, name, column).is_some(),
        "base column {table}.{name} already exists"
    );
    Ok(())
}

fn load_dictionary(path: &Path) -> anyhow::Result<Arc<Dictionary>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading dictionary file {}", path.display()))?;
    let dictionary = Dictionary::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let (value, code) = line
            .split_once('\t')
            .with_context(|| format!("malformed dictionary line {line:?}"))?;
        dictionary.insert(code.trim().parse()?, value);
    }
    dictionary.set_ready();
    Ok(Arc::new(dictionary))
}

fn ingest_bin_table(
    root: &Path,
    table: &str,
    columns: &[SchemaColumn],
    catalog: &Catalog,
    numa_node: Option<usize>,
) -> anyhow::Result<()> {
    let table_dir = root.join(table);
    for col in columns {
        let data_path = table_dir.join(format!("{}.bin", col.name));
        let bytes = std::fs::read(&data_path)
            .with_context(|| format!("reading column file {}", data_path.display()))?;
        let dictionary = if col.dtype == DataType::StringEnc {
            Some(load_dictionary(
                &table_dir.join(format!("{}_dict.tsv", col.name)),
            )?)
        } else {
            None
        };
        debug!(table, column = col.name, bytes = bytes.len(), "loaded binary column");
        register(catalog, table, &col.name, col.dtype, &bytes, dictionary, numa_node)?;
    }
    Ok(())
}

fn push_value(
    dtype: DataType,
    text: &str,
    out: &mut Vec<u8>,
    dictionary: Option<&Dictionary>,
) -> anyhow::Result<()> {
    let mut buf = [0u8; 8];
    match dtype {
        DataType::Int8 => out.push(text.parse::<i8>()? as u8),
        DataType::UInt8 => out.push(text.parse::<u8>()?),
        DataType::Int16 => {
            LittleEndian::write_i16(&mut buf, text.parse()?);
            out.extend_from_slice(&buf[..2]);
        }
        DataType::UInt16 => {
            LittleEndian::write_u16(&mut buf, text.parse()?);
            out.extend_from_slice(&buf[..2]);
        }
        DataType::Int32 => {
            LittleEndian::write_i32(&mut buf, text.parse()?);
            out.extend_from_slice(&buf[..4]);
        }
        DataType::UInt32 => {
            LittleEndian::write_u32(&mut buf, text.parse()?);
            out.extend_from_slice(&buf[..4]);
        }
        DataType::Int64 => {
            LittleEndian::write_i64(&mut buf, text.parse()?);
            out.extend_from_slice(&buf);
        }
        DataType::UInt64 | DataType::Timestamp => {
            LittleEndian::write_u64(&mut buf, text.parse()?);
            out.extend_from_slice(&buf);
        }
        DataType::Float32 => {
            LittleEndian::write_f32(&mut buf, text.parse()?);
            out.extend_from_slice(&buf[..4]);
        }
        DataType::Float64 => {
            LittleEndian::write_f64(&mut buf, text.parse()?);
            out.extend_from_slice(&buf);
        }
        DataType::StringEnc => {
            let dictionary =
                dictionary.context("string column without a dictionary during ingest")?;
            LittleEndian::write_u64(&mut buf, dictionary.encode(text));
            out.extend_from_slice(&buf);
        }
        DataType::PositionList | DataType::Bitmask | DataType::Unknown => {
            anyhow::bail!("type {dtype:?} cannot appear in base data")
        }
    }
    Ok(())
}

fn ingest_csv_table(
    root: &Path,
    table: &str,
    columns: &[SchemaColumn],
    catalog: &Catalog,
    numa_node: Option<usize>,
) -> anyhow::Result<()> {
    let path = root.join(format!("{table}.tbl"));
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'|')
        .has_headers(false)
        .flexible(true)
        .from_path(&path)
        .with_context(|| format!("opening table file {}", path.display()))?;

    let mut buffers: Vec<Vec<u8>> = vec![Vec::new(); columns.len()];
    let dictionaries: Vec<Option<Arc<Dictionary>>> = columns
        .iter()
        .map(|col| (col.dtype == DataType::StringEnc).then(|| Arc::new(Dictionary::new())))
        .collect();

    for record in reader.records() {
        let record = record?;
        for (idx, col) in columns.iter().enumerate() {
            let field = record
                .get(idx)
                .with_context(|| format!("row in {table} is missing field {}", col.name))?;
            push_value(
                col.dtype,
                field.trim(),
                &mut buffers[idx],
                dictionaries[idx].as_deref(),
            )?;
        }
    }

    for (idx, col) in columns.iter().enumerate() {
        if let Some(dictionary) = &dictionaries[idx] {
            dictionary.set_ready();
        }
        register(
            catalog,
            table,
            &col.name,
            col.dtype,
            &buffers[idx],
            dictionaries[idx].clone(),
            numa_node,
        )?;
    }
    Ok(())
}
