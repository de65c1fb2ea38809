use anyhow::Result;
use gridflow::router::grouping::{group_by_superset_absorption, GroupingConfig};
use std::collections::HashSet;

fn set(columns: &[&str]) -> HashSet<String> {
    columns.iter().map(|c| c.to_string()).collect()
}

fn config(max_merge_overhead: f32) -> GroupingConfig {
    GroupingConfig { max_merge_overhead }
}

#[test]
fn subsets_are_absorbed_for_free() -> Result<()> {
    // {A,B} ⊆ {A,B,C}: one group regardless of the merge knob.
    let sets = vec![set(&["A", "B", "C"]), set(&["A", "B"])];
    let groups = group_by_superset_absorption(&sets, &config(1.0));
    assert_eq!(groups.len(), 1);
    let mut members = groups[0].clone();
    members.sort_unstable();
    assert_eq!(members, vec![0, 1]);
    Ok(())
}

#[test]
fn absorption_walks_by_descending_set_size() -> Result<()> {
    // The largest set opens the first group even when submitted last.
    let sets = vec![set(&["A"]), set(&["A", "B"]), set(&["A", "B", "C"])];
    let groups = group_by_superset_absorption(&sets, &config(1.0));
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0][0], 2);
    Ok(())
}

#[test]
fn merge_respects_the_overhead_bound() -> Result<()> {
    // {A,B} and {B,C}: union 3, largest member 2 -> ratio 1.5.
    let sets = vec![set(&["A", "B"]), set(&["B", "C"])];

    let merged = group_by_superset_absorption(&sets, &config(1.5));
    assert_eq!(merged.len(), 1);

    let kept_apart = group_by_superset_absorption(&sets, &config(1.4));
    assert_eq!(kept_apart.len(), 2);
    Ok(())
}

#[test]
fn cheapest_pair_merges_first() -> Result<()> {
    // {A,B,C,D}+{A,B,C,E} has ratio 5/4; {X,Y}+{Y,Z} has ratio 3/2. With
    // the bound between them only the first pair merges.
    let sets = vec![
        set(&["A", "B", "C", "D"]),
        set(&["A", "B", "C", "E"]),
        set(&["X", "Y"]),
        set(&["Y", "Z"]),
    ];
    let groups = group_by_superset_absorption(&sets, &config(1.3));
    assert_eq!(groups.len(), 3);
    let merged = groups
        .iter()
        .find(|g| g.len() == 2)
        .expect("one merged group");
    let mut members = merged.to_vec();
    members.sort_unstable();
    assert_eq!(members, vec![0, 1]);
    Ok(())
}

#[test]
fn disjoint_sets_stay_separate_without_budget() -> Result<()> {
    let sets = vec![set(&["A"]), set(&["B"]), set(&["C"])];
    let groups = group_by_superset_absorption(&sets, &config(1.0));
    assert_eq!(groups.len(), 3);
    Ok(())
}

#[test]
fn generous_budget_collapses_everything() -> Result<()> {
    let sets = vec![set(&["A"]), set(&["B"]), set(&["C"])];
    let groups = group_by_superset_absorption(&sets, &config(100.0));
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].len(), 3);
    Ok(())
}

#[test]
fn empty_input_yields_no_groups() -> Result<()> {
    let groups = group_by_superset_absorption(&[], &config(2.0));
    assert!(groups.is_empty());
    Ok(())
}

#[test]
fn identical_sets_collapse_in_phase_one() -> Result<()> {
    let sets = vec![set(&["A", "B"]), set(&["A", "B"]), set(&["A", "B"])];
    let groups = group_by_superset_absorption(&sets, &config(1.0));
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].len(), 3);
    Ok(())
}
