use anyhow::Result;
use gridflow::column::DataType;
use gridflow::dag::{item_depths, PlanDag};
use gridflow::plan::{
    AggregateKind, AggregatePayload, ColumnRef, OperatorPayload, QueryPlan, WorkItem,
};
use gridflow::testing::{chain_plan, fanout_plan, filter_lt_item, result_item, single_filter_plan};

#[test]
fn valid_plans_pass_validation() -> Result<()> {
    for plan in [
        single_filter_plan(1, "t", "a", 10),
        chain_plan(2, "t", "a", 10),
        fanout_plan(3, "t", "a", 10),
    ] {
        let dag = PlanDag::build(plan, 1, 2);
        assert!(dag.report().is_ok(), "errors: {:?}", dag.report().errors);
        assert!(dag.report().warnings.is_empty());
    }
    Ok(())
}

#[test]
fn root_is_the_result_item() -> Result<()> {
    let dag = PlanDag::build(fanout_plan(1, "t", "a", 10), 0, 0);
    assert_eq!(dag.root(), Some(4));
    Ok(())
}

#[test]
fn missing_result_warns_and_uses_terminal() -> Result<()> {
    let plan = QueryPlan {
        plan_id: 1,
        items: vec![filter_lt_item(1, 1, "t", "a", 10, "f")],
    };
    let dag = PlanDag::build(plan, 0, 0);
    assert!(!dag.report().warnings.is_empty());
    assert_eq!(dag.root(), Some(1));
    Ok(())
}

#[test]
fn multiple_results_warn_and_pick_first() -> Result<()> {
    let mut plan = single_filter_plan(1, "t", "a", 10);
    plan.items
        .push(result_item(1, 3, "t", &["f"]).depends_on(&[1]));
    let dag = PlanDag::build(plan, 0, 0);
    assert!(!dag.report().warnings.is_empty());
    assert_eq!(dag.root(), Some(2));
    Ok(())
}

#[test]
fn cycles_fail_validation() -> Result<()> {
    let mut plan = single_filter_plan(1, "t", "a", 10);
    // 1 -> 2 already exists; close the loop.
    plan.items[0].depends_on = vec![2];
    let dag = PlanDag::build(plan, 0, 0);
    assert!(!dag.report().is_ok());
    assert!(dag
        .report()
        .errors
        .iter()
        .any(|e| e.message.contains("cycle")));
    Ok(())
}

#[test]
fn unreachable_items_fail_validation() -> Result<()> {
    let mut plan = single_filter_plan(1, "t", "a", 10);
    // An island filter that nothing consumes.
    plan.items
        .push(filter_lt_item(1, 9, "t", "a", 5, "island"));
    let dag = PlanDag::build(plan, 0, 0);
    assert!(dag
        .report()
        .errors
        .iter()
        .any(|e| e.message.contains("reach")));
    Ok(())
}

#[test]
fn unlinked_intermediate_input_fails_validation() -> Result<()> {
    let filter = filter_lt_item(1, 1, "t", "a", 10, "f");
    // The result consumes a column nothing produces.
    let result = result_item(1, 2, "t", &["ghost"]).depends_on(&[1]);
    let plan = QueryPlan {
        plan_id: 1,
        items: vec![filter, result],
    };
    let dag = PlanDag::build(plan, 0, 0);
    assert!(dag
        .report()
        .errors
        .iter()
        .any(|e| e.message.contains("no producing ancestor")));
    Ok(())
}

#[test]
fn postfix_stripping_links_derived_names() -> Result<()> {
    // Producer emits "val"; the consumer references "val_agg", which links
    // after stripping the aggregate postfix.
    let filter = filter_lt_item(1, 1, "t", "a", 10, "val");
    let aggregate = WorkItem::new(
        1,
        2,
        OperatorPayload::Aggregate(AggregatePayload {
            input: ColumnRef::new("t", "val_agg", DataType::UInt64),
            output: ColumnRef::new("t", "sum", DataType::UInt64),
            kind: AggregateKind::Sum,
        }),
    )
    .depends_on(&[1]);
    let result = result_item(1, 3, "t", &["sum"]).depends_on(&[2]);
    let plan = QueryPlan {
        plan_id: 1,
        items: vec![filter, aggregate, result],
    };
    let dag = PlanDag::build(plan, 0, 0);
    assert!(dag.report().is_ok(), "errors: {:?}", dag.report().errors);
    Ok(())
}

#[test]
fn postfix_stripping_is_iterative() -> Result<()> {
    // "val_idx_ext" -> "val_idx" -> "val".
    let filter = filter_lt_item(1, 1, "t", "a", 10, "val");
    let aggregate = WorkItem::new(
        1,
        2,
        OperatorPayload::Aggregate(AggregatePayload {
            input: ColumnRef::new("t", "val_idx_ext", DataType::UInt64),
            output: ColumnRef::new("t", "out", DataType::UInt64),
            kind: AggregateKind::Sum,
        }),
    )
    .depends_on(&[1]);
    let result = result_item(1, 3, "t", &["out"]).depends_on(&[2]);
    let plan = QueryPlan {
        plan_id: 1,
        items: vec![filter, aggregate, result],
    };
    let dag = PlanDag::build(plan, 0, 0);
    assert!(dag.report().is_ok(), "errors: {:?}", dag.report().errors);
    Ok(())
}

#[test]
fn base_columns_are_collected_with_types() -> Result<()> {
    let dag = PlanDag::build(fanout_plan(1, "lineitem", "qty", 10), 0, 0);
    let base = dag.base_columns();
    assert_eq!(base.len(), 1);
    assert_eq!(base["lineitem.qty"], vec![1]);
    assert_eq!(
        dag.base_column_types()["lineitem.qty"],
        DataType::UInt64
    );
    Ok(())
}

#[test]
fn depths_are_longest_paths_from_leaves() -> Result<()> {
    let plan = fanout_plan(1, "t", "a", 10);
    let depths = item_depths(&plan);
    assert_eq!(depths[&1], 0);
    assert_eq!(depths[&2], 1);
    assert_eq!(depths[&3], 1);
    assert_eq!(depths[&4], 2);
    Ok(())
}
