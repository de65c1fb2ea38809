//! Physical operators executed by the worker pool.
//!
//! Every operator is built from a work item by its `build` function
//! (registered in the [`dispatch`](crate::dispatch) factory table), reads
//! its inputs from the catalog, and registers its outputs there. Internal
//! faults never propagate as panics: the shared [`run_guarded`] harness
//! folds any error into a `success = false` response with a readable
//! `info`, which the orchestrator turns into an item failure.
//!
//! Operators consume columns through blocking [`ChunkCursor`]s
//! (`crate::column`), so they can start on a producer's output before it
//! is finished; outputs that are themselves produced incrementally
//! (materialize, transfer) advance their column's watermark per chunk.

pub mod aggregate;
pub mod filter;
pub mod group;
pub mod join;
pub mod map;
pub mod materialize;
pub mod result;
pub mod set_ops;
pub mod sort;
pub mod transfer;

use crate::catalog::Catalog;
use crate::column::{Column, DataType};
use crate::plan::{ArithOp, ColumnRef, ExtendedResult, Literal, WorkItem, WorkResponse};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;

/// Bytes per chunk consumed or produced in one step.
pub const CHUNK_BYTES: usize = 4 * 1024 * 1024;

/// A runnable operator instance. Owned by exactly one pool worker.
pub trait Operator: Send {
    fn run(&mut self) -> WorkResponse;
}

pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Run an operator body, translating errors into a failure response and
/// attaching timing when the item asked for an extended result.
pub(crate) fn run_guarded(
    item: &WorkItem,
    body: impl FnOnce() -> anyhow::Result<u64>,
) -> WorkResponse {
    let start_ns = now_ns();
    match body() {
        Ok(row_count) => {
            let mut response = WorkResponse::success(item.plan_id, item.item_id);
            if item.extended_result {
                response.extended = Some(ExtendedResult {
                    item_id: item.item_id,
                    start_ns,
                    end_ns: now_ns(),
                    row_count,
                });
            }
            response
        }
        Err(err) => {
            error!(
                plan = item.plan_id,
                item = item.item_id,
                operator = item.payload.name(),
                %err,
                "operator failed"
            );
            WorkResponse::failure(
                item.plan_id,
                item.item_id,
                format!("[{}] {err}", item.payload.name()),
            )
        }
    }
}

/// Look up an input column or fail the item with a descriptive message.
pub(crate) fn require_column(catalog: &Catalog, col: &ColumnRef) -> anyhow::Result<Arc<Column>> {
    catalog
        .get(&col.table, &col.column)
        .ok_or_else(|| anyhow::anyhow!("could not find column {}", col.ident()))
}

/// Register an output column. An ident collision means another operator
/// produced the same output concurrently; the existing column wins.
pub(crate) fn publish(catalog: &Catalog, col: &ColumnRef, column: Arc<Column>) -> Arc<Column> {
    match catalog.add(&col.table, &col.column, Arc::clone(&column)) {
        Some(added) => added,
        None => catalog
            .get(&col.table, &col.column)
            .unwrap_or(column),
    }
}

/// Build and register a completed `u64`-shaped output column (position
/// lists, counts).
pub(crate) fn publish_u64(
    catalog: &Catalog,
    col: &ColumnRef,
    dtype: DataType,
    values: &[u64],
) -> Arc<Column> {
    let column = Arc::new(Column::new(dtype, values.len(), true, None));
    column.allocate();
    column.write_slice(0, values);
    publish(catalog, col, column)
}

/// Build and register a completed column from a typed slice.
pub(crate) fn publish_slice<T: Copy>(
    catalog: &Catalog,
    col: &ColumnRef,
    dtype: DataType,
    values: &[T],
) -> Arc<Column> {
    let column = Arc::new(Column::new(dtype, values.len(), true, None));
    column.allocate();
    column.write_slice(0, values);
    publish(catalog, col, column)
}

/// Value-level behavior shared by all fixed-width element types.
pub(crate) trait Scalar: Copy + PartialOrd + Send + Sync + 'static {
    fn from_literal(literal: &Literal) -> Option<Self>;
    fn to_f64(self) -> f64;
    /// Stable bit pattern for hashing; `None` for floats, which cannot be
    /// join or group keys.
    fn key_bits(self) -> Option<u64>;
    fn arith(self, other: Self, op: ArithOp) -> Self;
}

macro_rules! impl_scalar_int {
    ($($t:ty),*) => {$(
        impl Scalar for $t {
            fn from_literal(literal: &Literal) -> Option<Self> {
                match literal {
                    Literal::Int(v) => Some(*v as $t),
                    Literal::UInt(v) => Some(*v as $t),
                    Literal::Float(_) | Literal::Str(_) => None,
                }
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn key_bits(self) -> Option<u64> {
                Some(self as u64)
            }
            fn arith(self, other: Self, op: ArithOp) -> Self {
                match op {
                    ArithOp::Add => self.wrapping_add(other),
                    ArithOp::Sub => self.wrapping_sub(other),
                    ArithOp::Mul => self.wrapping_mul(other),
                    ArithOp::Div => {
                        if other == 0 {
                            0
                        } else {
                            self.wrapping_div(other)
                        }
                    }
                }
            }
        }
    )*};
}

impl_scalar_int!(i8, u8, i16, u16, i32, u32, i64, u64);

macro_rules! impl_scalar_float {
    ($($t:ty),*) => {$(
        impl Scalar for $t {
            fn from_literal(literal: &Literal) -> Option<Self> {
                match literal {
                    Literal::Int(v) => Some(*v as $t),
                    Literal::UInt(v) => Some(*v as $t),
                    Literal::Float(v) => Some(*v as $t),
                    Literal::Str(_) => None,
                }
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn key_bits(self) -> Option<u64> {
                None
            }
            fn arith(self, other: Self, op: ArithOp) -> Self {
                match op {
                    ArithOp::Add => self + other,
                    ArithOp::Sub => self - other,
                    ArithOp::Mul => self * other,
                    ArithOp::Div => self / other,
                }
            }
        }
    )*};
}

impl_scalar_float!(f32, f64);

/// Expand `$body` with `$t` bound to the Rust type of a numeric data type.
/// String-encoded columns dispatch as `u64` codes; callers that need
/// dictionary semantics handle `StringEnc` before reaching for this.
macro_rules! with_scalar_type {
    ($dtype:expr, $t:ident, $body:block) => {
        match $dtype {
            $crate::column::DataType::Int8 => {
                type $t = i8;
                $body
            }
            $crate::column::DataType::UInt8 => {
                type $t = u8;
                $body
            }
            $crate::column::DataType::Int16 => {
                type $t = i16;
                $body
            }
            $crate::column::DataType::UInt16 => {
                type $t = u16;
                $body
            }
            $crate::column::DataType::Int32 => {
                type $t = i32;
                $body
            }
            $crate::column::DataType::UInt32 => {
                type $t = u32;
                $body
            }
            $crate::column::DataType::Int64 => {
                type $t = i64;
                $body
            }
            $crate::column::DataType::UInt64
            | $crate::column::DataType::Timestamp
            | $crate::column::DataType::PositionList
            | $crate::column::DataType::StringEnc => {
                type $t = u64;
                $body
            }
            $crate::column::DataType::Float32 => {
                type $t = f32;
                $body
            }
            $crate::column::DataType::Float64 => {
                type $t = f64;
                $body
            }
            other => anyhow::bail!("unsupported datatype {other:?}"),
        }
    };
}

pub(crate) use with_scalar_type;

/// Chunk size in elements for a given scalar type.
pub(crate) fn chunk_elements<T>() -> usize {
    (CHUNK_BYTES / std::mem::size_of::<T>()).max(1)
}

/// Read one value of an arbitrary numeric column as `f64`.
pub(crate) fn value_as_f64(column: &Arc<Column>, idx: usize) -> anyhow::Result<f64> {
    let dtype = column.dtype();
    with_scalar_type!(dtype, T, {
        Ok(column.as_slice::<T>()[idx].to_f64())
    })
}
