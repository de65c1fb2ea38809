//! Test fixtures: catalog population helpers, plan builders, and recording
//! doubles for the orchestrator and front-end seams.
//!
//! Integration tests build small in-memory scenarios against these instead
//! of hand-rolling work items each time. The recorders stand in for the
//! operator dispatcher and the router connection so scheduling behavior
//! can be asserted without a worker pool or a socket.

use crate::catalog::Catalog;
use crate::column::{Column, DataType};
use crate::dictionary::Dictionary;
use crate::orchestrator::ItemDispatcher;
use crate::plan::{
    AggregateKind, AggregatePayload, ClientUuid, ColumnRef, CompareOp, FilterPayload, ItemId,
    Literal, MaterializePayload, OperatorPayload, PlanId, PlanResponse, QueryPlan, ResultPayload,
    WorkItem,
};
use crate::unit::ResponseSink;
use parking_lot::Mutex;
use std::sync::Arc;

/// Register a complete `u64` base column.
pub fn base_u64_column(catalog: &Catalog, table: &str, column: &str, values: &[u64]) -> Arc<Column> {
    let col = Arc::new(Column::new(DataType::UInt64, values.len(), true, None));
    col.allocate();
    col.write_slice(0, values);
    catalog
        .add(table, column, col)
        .expect("base column registered")
}

/// Register a complete dictionary-encoded string base column.
pub fn base_string_column(
    catalog: &Catalog,
    table: &str,
    column: &str,
    values: &[&str],
) -> Arc<Column> {
    let dictionary = Arc::new(Dictionary::new());
    let codes: Vec<u64> = values.iter().map(|v| dictionary.encode(v)).collect();
    dictionary.set_ready();
    let col = Arc::new(Column::new(DataType::StringEnc, codes.len(), true, None));
    col.init_dictionary(Some(dictionary));
    col.allocate();
    col.write_slice(0, &codes);
    catalog
        .add(table, column, col)
        .expect("base column registered")
}

/// A `Filter(input < value) -> output` item over a base `u64` column.
pub fn filter_lt_item(
    plan_id: PlanId,
    item_id: ItemId,
    table: &str,
    column: &str,
    value: u64,
    output: &str,
) -> WorkItem {
    WorkItem::new(
        plan_id,
        item_id,
        OperatorPayload::Filter(FilterPayload {
            input: ColumnRef::base(table, column, DataType::UInt64),
            output: ColumnRef::new(table, output, DataType::PositionList),
            op: CompareOp::Lt,
            values: vec![Literal::UInt(value)],
        }),
    )
}

/// A materialize item gathering `table.source` through `table.positions`.
pub fn materialize_item(
    plan_id: PlanId,
    item_id: ItemId,
    table: &str,
    positions: &str,
    source: &str,
    output: &str,
) -> WorkItem {
    WorkItem::new(
        plan_id,
        item_id,
        OperatorPayload::Materialize(MaterializePayload {
            positions: ColumnRef::new(table, positions, DataType::PositionList),
            source: ColumnRef::base(table, source, DataType::UInt64),
            output: ColumnRef::new(table, output, DataType::UInt64),
        }),
    )
}

/// An aggregate item over an intermediate column.
pub fn aggregate_item(
    plan_id: PlanId,
    item_id: ItemId,
    table: &str,
    input: &str,
    kind: AggregateKind,
    output: &str,
) -> WorkItem {
    WorkItem::new(
        plan_id,
        item_id,
        OperatorPayload::Aggregate(AggregatePayload {
            input: ColumnRef::new(table, input, DataType::UInt64),
            output: ColumnRef::new(table, output, DataType::UInt64),
            kind,
        }),
    )
}

/// The terminal result item of a plan.
pub fn result_item(plan_id: PlanId, item_id: ItemId, table: &str, columns: &[&str]) -> WorkItem {
    WorkItem::new(
        plan_id,
        item_id,
        OperatorPayload::Result(ResultPayload {
            columns: columns
                .iter()
                .map(|c| ColumnRef::new(table, c, DataType::UInt64))
                .collect(),
            index: None,
            header: Vec::new(),
            file_name: None,
        }),
    )
}

/// `Filter -> Result`, the smallest complete plan.
pub fn single_filter_plan(plan_id: PlanId, table: &str, column: &str, value: u64) -> QueryPlan {
    let filter = filter_lt_item(plan_id, 1, table, column, value, "f");
    let result = result_item(plan_id, 2, table, &["f"]).depends_on(&[1]);
    QueryPlan {
        plan_id,
        items: vec![filter, result],
    }
}

/// `Filter -> Materialize -> Result`, a three-stage chain.
pub fn chain_plan(plan_id: PlanId, table: &str, column: &str, value: u64) -> QueryPlan {
    let filter = filter_lt_item(plan_id, 1, table, column, value, "pos");
    let materialize =
        materialize_item(plan_id, 2, table, "pos", column, "m").depends_on(&[1]);
    let result = result_item(plan_id, 3, table, &["m"]).depends_on(&[2]);
    QueryPlan {
        plan_id,
        items: vec![filter, materialize, result],
    }
}

/// `Filter -> {Sum, Count} -> Result`, a diamond-shaped fan-out.
pub fn fanout_plan(plan_id: PlanId, table: &str, column: &str, value: u64) -> QueryPlan {
    let producer = filter_lt_item(plan_id, 1, table, column, value, "pos");
    let sum = aggregate_item(plan_id, 2, table, "pos", AggregateKind::Sum, "pos_agg")
        .depends_on(&[1]);
    let count = aggregate_item(plan_id, 3, table, "pos", AggregateKind::Count, "pos_cnt")
        .depends_on(&[1]);
    let result = result_item(plan_id, 4, table, &["pos_agg", "pos_cnt"]).depends_on(&[2, 3]);
    QueryPlan {
        plan_id,
        items: vec![producer, sum, count, result],
    }
}

/// Records every dispatched item instead of executing it.
#[derive(Default)]
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<(ClientUuid, WorkItem)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dispatched(&self) -> Vec<(ClientUuid, WorkItem)> {
        self.dispatched.lock().clone()
    }

    pub fn dispatched_item_ids(&self) -> Vec<ItemId> {
        self.dispatched
            .lock()
            .iter()
            .map(|(_, item)| item.item_id)
            .collect()
    }
}

impl ItemDispatcher for RecordingDispatcher {
    fn dispatch(&self, target: ClientUuid, item: WorkItem) {
        self.dispatched.lock().push((target, item));
    }
}

/// Records outbound front-end traffic.
#[derive(Default)]
pub struct RecordingSink {
    pub plan_responses: Mutex<Vec<(ClientUuid, PlanResponse)>>,
    pub forwarded: Mutex<Vec<(ClientUuid, WorkItem)>>,
    pub texts: Mutex<Vec<(ClientUuid, String)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ResponseSink for RecordingSink {
    fn send_plan_response(&self, target: ClientUuid, response: &PlanResponse) {
        self.plan_responses.lock().push((target, response.clone()));
    }

    fn forward_work(&self, target: ClientUuid, item: &WorkItem) {
        self.forwarded.lock().push((target, item.clone()));
    }

    fn send_text(&self, target: ClientUuid, text: &str) {
        self.texts.lock().push((target, text.to_string()));
    }
}

/// Spin-wait until `predicate` holds or the timeout elapses. Returns
/// whether the predicate held.
pub fn wait_until(timeout: std::time::Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    predicate()
}
