use anyhow::Result;
use gridflow::catalog::Catalog;
use gridflow::column::DataType;
use gridflow::orchestrator::OrchestratorConfig;
use gridflow::plan::{
    ColumnRef, OperatorPayload, QueryGroup, TransferPayload, WorkItem,
};
use gridflow::testing::{
    base_u64_column, chain_plan, fanout_plan, single_filter_plan, wait_until, RecordingSink,
};
use gridflow::unit::UnitFrontend;
use gridflow::worker::{Topology, WorkerPool};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);
const PLANNER: u64 = 77;

fn frontend() -> (Arc<UnitFrontend>, Arc<RecordingSink>, Arc<Catalog>) {
    let catalog = Arc::new(Catalog::new());
    let pool = WorkerPool::new(2, None, Topology::detect(1));
    let sink = RecordingSink::new();
    let frontend = UnitFrontend::install(
        Arc::clone(&catalog),
        pool,
        Arc::clone(&sink) as _,
        OrchestratorConfig {
            gc_interval: Duration::from_millis(100),
            max_pending_cleanup: 100,
        },
    );
    (frontend, sink, catalog)
}

#[test]
fn single_filter_plan_executes_end_to_end() -> Result<()> {
    let (frontend, sink, catalog) = frontend();
    base_u64_column(&catalog, "t", "a", &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

    frontend.handle_query_plan(PLANNER, single_filter_plan(1, "t", "a", 42));

    assert!(wait_until(WAIT, || !sink.plan_responses.lock().is_empty()));
    let (target, response) = sink.plan_responses.lock()[0].clone();
    assert_eq!(target, PLANNER);
    assert!(response.success, "{}", response.info);
    assert_eq!(response.plan_id, 1);

    // The plan is finalized and garbage-collected shortly after.
    assert!(wait_until(WAIT, || {
        frontend.orchestrator().plan_status(1).is_none()
    }));
    Ok(())
}

#[test]
fn chain_plan_executes_in_dependency_order() -> Result<()> {
    let (frontend, sink, catalog) = frontend();
    base_u64_column(&catalog, "t", "a", &[9, 1, 8, 2, 7]);

    frontend.handle_query_plan(PLANNER, chain_plan(2, "t", "a", 5));
    assert!(wait_until(WAIT, || !sink.plan_responses.lock().is_empty()));
    assert!(sink.plan_responses.lock()[0].1.success);
    Ok(())
}

#[test]
fn fanout_plan_collects_both_aggregates() -> Result<()> {
    let (frontend, sink, catalog) = frontend();
    base_u64_column(&catalog, "t", "a", &[3, 1, 4, 1, 5]);

    frontend.handle_query_plan(PLANNER, fanout_plan(3, "t", "a", 100));
    assert!(wait_until(WAIT, || !sink.plan_responses.lock().is_empty()));
    assert!(sink.plan_responses.lock()[0].1.success);
    Ok(())
}

#[test]
fn failing_item_yields_a_single_failure_response() -> Result<()> {
    let (frontend, sink, _catalog) = frontend();
    // No base data: the filter fails to find its column.

    frontend.handle_query_plan(PLANNER, single_filter_plan(4, "t", "a", 42));
    assert!(wait_until(WAIT, || !sink.plan_responses.lock().is_empty()));
    std::thread::sleep(Duration::from_millis(100));

    let responses = sink.plan_responses.lock().clone();
    assert_eq!(responses.len(), 1);
    let (target, response) = &responses[0];
    assert_eq!(*target, PLANNER);
    assert!(!response.success);
    assert!(response.info.contains("failed at item"));
    Ok(())
}

#[test]
fn query_group_stages_columns_and_drops_tables_when_done() -> Result<()> {
    let (frontend, sink, catalog) = frontend();
    let values: Vec<u64> = (1..=10).collect();
    base_u64_column(&catalog, "t", "a", &values);

    // One staged column aliased to 42_t, one plan reading the alias.
    let transfer = WorkItem::new(
        0,
        0,
        OperatorPayload::Transfer(TransferPayload {
            source: ColumnRef::base("t", "a", DataType::UInt64),
            destination: ColumnRef::base("42_t", "a", DataType::UInt64),
        }),
    );
    let plan = single_filter_plan(9, "42_t", "a", 42);
    let group = QueryGroup {
        group_id: 42,
        transfers: vec![transfer],
        plans: vec![plan],
    };

    frontend.handle_query_group(PLANNER, group);

    assert!(wait_until(WAIT, || !sink.plan_responses.lock().is_empty()));
    let (_, response) = sink.plan_responses.lock()[0].clone();
    assert!(response.success, "{}", response.info);

    // Group isolation: after the last plan finished, no aliased table
    // remains in the catalog.
    assert!(wait_until(WAIT, || catalog.get("42_t", "a").is_none()));
    assert!(wait_until(WAIT, || catalog.get("42_t", "f").is_none()));
    // The original base table is untouched by the group teardown... except
    // that the result item dropped its own output table.
    Ok(())
}

#[test]
fn configuration_actions_resize_and_reset() -> Result<()> {
    let (frontend, sink, catalog) = frontend();
    base_u64_column(&catalog, "t", "a", &[1, 2, 3]);

    frontend.handle_configuration(
        PLANNER,
        gridflow::net::frame::ConfigurationAction::SetWorker { count: 4 },
        "unit-under-test",
    );
    assert_eq!(frontend.pool().active_workers(), 4);

    frontend.handle_configuration(
        PLANNER,
        gridflow::net::frame::ConfigurationAction::ResetCatalog,
        "unit-under-test",
    );
    assert_eq!(catalog.column_count(), 0);

    let texts = sink.texts.lock();
    assert!(texts.iter().any(|(_, t)| t.contains("workers updated")));
    assert!(texts.iter().any(|(_, t)| t.contains("catalog cleared")));
    Ok(())
}

#[test]
fn draining_unit_forwards_queued_work() -> Result<()> {
    let catalog = Arc::new(Catalog::new());
    // A single worker so tasks queue behind a slow one.
    let pool = WorkerPool::new(1, None, Topology::detect(1));
    let sink = RecordingSink::new();
    let frontend = UnitFrontend::install(
        Arc::clone(&catalog),
        Arc::clone(&pool),
        Arc::clone(&sink) as _,
        OrchestratorConfig::default(),
    );

    // Tasks only need to occupy the queue long enough for the drain; a
    // large scan keeps the single worker busy.
    let values: Vec<u64> = (0..16_000_000).collect();
    base_u64_column(&catalog, "t", "a", &values);
    for tag in 1..=4 {
        frontend.handle_work(
            PLANNER,
            gridflow::testing::filter_lt_item(5, tag, "t", "a", 1, "f"),
        );
    }
    assert!(wait_until(WAIT, || pool.busy_workers() == 1));

    // Drain: whatever is still queued must be pushed back to the router.
    pool.stop_workers(0);
    let forwarded = sink.forwarded.lock().len();
    assert!(forwarded > 0, "nothing was forwarded on drain");
    assert!(sink
        .forwarded
        .lock()
        .iter()
        .all(|(target, _)| *target == PLANNER));
    Ok(())
}
