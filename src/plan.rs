//! Plan, work-item, and response message types.
//!
//! Everything in this module crosses the wire (bincode-encoded payloads of
//! framed messages, see [`net::frame`](crate::net::frame)) and is therefore
//! plain serde data. A [`QueryPlan`] is a flat list of [`WorkItem`]s whose
//! `depends_on` edges form a DAG ending in a single `Result` item; a
//! [`QueryGroup`] batches rewritten plans together with the column-transfer
//! items that pre-stage their shared base columns.
//!
//! Operator payloads name their input and output columns by `(table,
//! column)`; the uniform [`OperatorPayload::input_refs`] /
//! [`output_refs`](OperatorPayload::output_refs) accessors are what the
//! router-side DAG validation and the group rewriting walk over, so adding
//! a payload variant means extending those too.

use crate::column::DataType;
use serde::{Deserialize, Serialize};

pub type PlanId = u32;
pub type ItemId = u32;
pub type GroupId = u64;
/// Client identity on the fabric; randomly generated 64-bit value.
pub type ClientUuid = u64;

/// A named column reference carried inside operator payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
    pub dtype: DataType,
    /// True when the column originates from ingested base data rather than
    /// from another item's output.
    pub is_base: bool,
}

impl ColumnRef {
    pub fn new(table: &str, column: &str, dtype: DataType) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
            dtype,
            is_base: false,
        }
    }

    pub fn base(table: &str, column: &str, dtype: DataType) -> Self {
        Self {
            is_base: true,
            ..Self::new(table, column, dtype)
        }
    }

    /// `table.column`, the catalog-independent name used by the grouper.
    pub fn ident(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }
}

/// Comparison predicate of filters and joins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Inclusive range; two literals.
    Between,
    /// Membership in the literal set.
    In,
    /// SQL LIKE with `%` wildcards; string columns only.
    Like,
}

/// A literal constant in a filter or map payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
}

/// Aggregation function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateKind {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

/// Scalar arithmetic of the map operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Position-list set operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetOpKind {
    Union,
    Intersect,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterPayload {
    pub input: ColumnRef,
    pub output: ColumnRef,
    pub op: CompareOp,
    pub values: Vec<Literal>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinPayload {
    pub inner: ColumnRef,
    pub outer: ColumnRef,
    /// Position list into the inner column.
    pub inner_output: ColumnRef,
    /// Position list into the outer column.
    pub outer_output: ColumnRef,
    pub predicate: CompareOp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregatePayload {
    pub input: ColumnRef,
    pub output: ColumnRef,
    pub kind: AggregateKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SortPayload {
    pub input: ColumnRef,
    /// Position list ordering the input.
    pub output: ColumnRef,
    pub descending: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupPayload {
    pub key: ColumnRef,
    /// Column to aggregate per group; `None` means count.
    pub aggregate: Option<ColumnRef>,
    pub kind: AggregateKind,
    /// Distinct key values, one per group.
    pub key_output: ColumnRef,
    /// Aggregate value per group, aligned with `key_output`.
    pub agg_output: ColumnRef,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MapPayload {
    pub input: ColumnRef,
    /// Column-column variant; when `None`, `constant` applies.
    pub partner: Option<ColumnRef>,
    pub constant: Option<Literal>,
    pub op: ArithOp,
    pub output: ColumnRef,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaterializePayload {
    /// Position list selecting rows of `source`.
    pub positions: ColumnRef,
    pub source: ColumnRef,
    pub output: ColumnRef,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetPayload {
    pub inner: ColumnRef,
    pub outer: ColumnRef,
    pub output: ColumnRef,
    pub kind: SetOpKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultPayload {
    pub columns: Vec<ColumnRef>,
    /// Optional position list applied to all result columns.
    pub index: Option<ColumnRef>,
    /// Header labels; column names are used when empty.
    pub header: Vec<String>,
    /// When set, the result is persisted as `./results/<name>.tsv`.
    pub file_name: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferPayload {
    pub source: ColumnRef,
    pub destination: ColumnRef,
}

/// The per-operator portion of a work item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OperatorPayload {
    Filter(FilterPayload),
    Join(JoinPayload),
    Aggregate(AggregatePayload),
    Sort(SortPayload),
    Group(GroupPayload),
    Map(MapPayload),
    Materialize(MaterializePayload),
    Set(SetPayload),
    Result(ResultPayload),
    Transfer(TransferPayload),
}

impl OperatorPayload {
    /// Stable per-variant discriminant, the low half of the dispatcher's
    /// composite operator id.
    pub fn case_id(&self) -> u16 {
        match self {
            OperatorPayload::Filter(_) => 1,
            OperatorPayload::Join(_) => 2,
            OperatorPayload::Aggregate(_) => 3,
            OperatorPayload::Sort(_) => 4,
            OperatorPayload::Group(_) => 5,
            OperatorPayload::Map(_) => 6,
            OperatorPayload::Materialize(_) => 7,
            OperatorPayload::Set(_) => 8,
            OperatorPayload::Result(_) => 9,
            OperatorPayload::Transfer(_) => 10,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperatorPayload::Filter(_) => "filter",
            OperatorPayload::Join(_) => "join",
            OperatorPayload::Aggregate(_) => "aggregate",
            OperatorPayload::Sort(_) => "sort",
            OperatorPayload::Group(_) => "group",
            OperatorPayload::Map(_) => "map",
            OperatorPayload::Materialize(_) => "materialize",
            OperatorPayload::Set(_) => "set",
            OperatorPayload::Result(_) => "result",
            OperatorPayload::Transfer(_) => "transfer",
        }
    }

    /// All column references read by this operator.
    pub fn input_refs(&self) -> Vec<&ColumnRef> {
        match self {
            OperatorPayload::Filter(p) => vec![&p.input],
            OperatorPayload::Join(p) => vec![&p.inner, &p.outer],
            OperatorPayload::Aggregate(p) => vec![&p.input],
            OperatorPayload::Sort(p) => vec![&p.input],
            OperatorPayload::Group(p) => {
                let mut refs = vec![&p.key];
                if let Some(agg) = &p.aggregate {
                    refs.push(agg);
                }
                refs
            }
            OperatorPayload::Map(p) => {
                let mut refs = vec![&p.input];
                if let Some(partner) = &p.partner {
                    refs.push(partner);
                }
                refs
            }
            OperatorPayload::Materialize(p) => vec![&p.positions, &p.source],
            OperatorPayload::Set(p) => vec![&p.inner, &p.outer],
            OperatorPayload::Result(p) => {
                let mut refs: Vec<&ColumnRef> = p.columns.iter().collect();
                if let Some(index) = &p.index {
                    refs.push(index);
                }
                refs
            }
            OperatorPayload::Transfer(p) => vec![&p.source],
        }
    }

    /// Mutable variant of [`input_refs`](Self::input_refs), used by the
    /// grouper when rewriting table names to staged aliases.
    pub fn input_refs_mut(&mut self) -> Vec<&mut ColumnRef> {
        match self {
            OperatorPayload::Filter(p) => vec![&mut p.input],
            OperatorPayload::Join(p) => vec![&mut p.inner, &mut p.outer],
            OperatorPayload::Aggregate(p) => vec![&mut p.input],
            OperatorPayload::Sort(p) => vec![&mut p.input],
            OperatorPayload::Group(p) => {
                let mut refs = vec![&mut p.key];
                if let Some(agg) = &mut p.aggregate {
                    refs.push(agg);
                }
                refs
            }
            OperatorPayload::Map(p) => {
                let mut refs = vec![&mut p.input];
                if let Some(partner) = &mut p.partner {
                    refs.push(partner);
                }
                refs
            }
            OperatorPayload::Materialize(p) => vec![&mut p.positions, &mut p.source],
            OperatorPayload::Set(p) => vec![&mut p.inner, &mut p.outer],
            OperatorPayload::Result(p) => {
                let mut refs: Vec<&mut ColumnRef> = p.columns.iter_mut().collect();
                if let Some(index) = &mut p.index {
                    refs.push(index);
                }
                refs
            }
            OperatorPayload::Transfer(p) => vec![&mut p.source],
        }
    }

    /// All column references produced by this operator.
    pub fn output_refs(&self) -> Vec<&ColumnRef> {
        match self {
            OperatorPayload::Filter(p) => vec![&p.output],
            OperatorPayload::Join(p) => vec![&p.inner_output, &p.outer_output],
            OperatorPayload::Aggregate(p) => vec![&p.output],
            OperatorPayload::Sort(p) => vec![&p.output],
            OperatorPayload::Group(p) => vec![&p.key_output, &p.agg_output],
            OperatorPayload::Map(p) => vec![&p.output],
            OperatorPayload::Materialize(p) => vec![&p.output],
            OperatorPayload::Set(p) => vec![&p.output],
            OperatorPayload::Result(_) => vec![],
            OperatorPayload::Transfer(p) => vec![&p.destination],
        }
    }
}

/// One node of a plan: a single operator invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkItem {
    pub plan_id: PlanId,
    pub item_id: ItemId,
    pub depends_on: Vec<ItemId>,
    pub payload: OperatorPayload,
    /// Request per-item timing and row counts in the response.
    pub extended_result: bool,
}

impl WorkItem {
    pub fn new(plan_id: PlanId, item_id: ItemId, payload: OperatorPayload) -> Self {
        Self {
            plan_id,
            item_id,
            depends_on: Vec::new(),
            payload,
            extended_result: false,
        }
    }

    pub fn depends_on(mut self, deps: &[ItemId]) -> Self {
        self.depends_on = deps.to_vec();
        self
    }

    pub fn is_result(&self) -> bool {
        matches!(self.payload, OperatorPayload::Result(_))
    }
}

/// A DAG of work items ending in a single `Result` item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryPlan {
    pub plan_id: PlanId,
    pub items: Vec<WorkItem>,
}

/// A batch of plans sharing DRAM-staged base columns. The transfers are
/// executed before (well, concurrently with) the plans; the plans have
/// already been rewritten to reference the staged aliases.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryGroup {
    pub group_id: GroupId,
    pub transfers: Vec<WorkItem>,
    pub plans: Vec<QueryPlan>,
}

/// Per-item timing returned when `extended_result` was requested.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExtendedResult {
    pub item_id: ItemId,
    pub start_ns: u64,
    pub end_ns: u64,
    pub row_count: u64,
}

/// Outcome of one operator invocation, handed back through the pool's
/// finish callback.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkResponse {
    pub plan_id: PlanId,
    pub item_id: ItemId,
    pub success: bool,
    pub info: String,
    pub extended: Option<ExtendedResult>,
}

impl WorkResponse {
    pub fn success(plan_id: PlanId, item_id: ItemId) -> Self {
        Self {
            plan_id,
            item_id,
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(plan_id: PlanId, item_id: ItemId, info: impl Into<String>) -> Self {
        Self {
            plan_id,
            item_id,
            success: false,
            info: info.into(),
            ..Default::default()
        }
    }
}

/// Final per-plan outcome sent back to the originator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanResponse {
    pub plan_id: PlanId,
    pub success: bool,
    pub info: String,
    pub extended: Vec<ExtendedResult>,
}

/// The oneof request envelope. The high half of the dispatcher's composite
/// id is this enum's case.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WorkRequest {
    Item(WorkItem),
    Plan(QueryPlan),
    Group(QueryGroup),
}

impl WorkRequest {
    pub fn case_id(&self) -> u16 {
        match self {
            WorkRequest::Item(_) => 1,
            WorkRequest::Plan(_) => 2,
            WorkRequest::Group(_) => 3,
        }
    }
}
