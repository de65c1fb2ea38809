//! Superset-absorption clustering of plans by their base-column sets.
//!
//! Plans that read overlapping base columns benefit from sharing one
//! DRAM-staged copy; plans with disjoint column sets only dilute the
//! staging budget. Clustering runs in two phases:
//!
//! 1. **Absorption**: walk the plans by descending column-set size. Each
//!    yet-unassigned plan opens a group; every unassigned plan whose set is
//!    a subset of the group's columns is absorbed for free (the union does
//!    not grow).
//! 2. **Merging**: repeatedly merge the pair of groups with the smallest
//!    *merge overhead ratio* `|A ∪ B| / max-member-size`, as long as the
//!    ratio stays within `max_merge_overhead`. The single scalar thus
//!    trades DRAM footprint against cross-plan sharing.

use std::collections::HashSet;

/// Knobs of the clustering pass.
#[derive(Clone, Copy, Debug)]
pub struct GroupingConfig {
    /// Upper bound on `|union| / largest member` for phase-2 merges;
    /// e.g. 1.5 allows the union to exceed the largest member by half.
    pub max_merge_overhead: f32,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            max_merge_overhead: 2.0,
        }
    }
}

struct GroupInfo {
    indices: Vec<usize>,
    columns: HashSet<String>,
    /// Column count of the largest individual member.
    max_member_size: usize,
}

fn merge_overhead_ratio(a: &GroupInfo, b: &GroupInfo) -> f32 {
    let union_size = a.columns.union(&b.columns).count();
    let max_member = a.max_member_size.max(b.max_member_size);
    if max_member == 0 {
        return 1.0;
    }
    union_size as f32 / max_member as f32
}

/// Cluster plans by their base-column sets; returns groups of plan indices.
pub fn group_by_superset_absorption(
    column_sets: &[HashSet<String>],
    config: &GroupingConfig,
) -> Vec<Vec<usize>> {
    let n = column_sets.len();
    if n == 0 {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| column_sets[b].len().cmp(&column_sets[a].len()));

    let mut assigned = vec![false; n];
    let mut groups: Vec<GroupInfo> = Vec::new();

    // Phase 1: large sets absorb their subsets.
    for &i in &order {
        if assigned[i] {
            continue;
        }
        let mut group = GroupInfo {
            indices: vec![i],
            columns: column_sets[i].clone(),
            max_member_size: column_sets[i].len(),
        };
        assigned[i] = true;

        for &j in &order {
            if assigned[j] {
                continue;
            }
            if column_sets[j].is_subset(&group.columns) {
                group.indices.push(j);
                assigned[j] = true;
            }
        }
        groups.push(group);
    }

    // Phase 2: merge the cheapest eligible pair until none remains.
    loop {
        let mut best: Option<(usize, usize, f32)> = None;
        for a in 0..groups.len() {
            for b in (a + 1)..groups.len() {
                let ratio = merge_overhead_ratio(&groups[a], &groups[b]);
                if ratio <= config.max_merge_overhead
                    && best.is_none_or(|(_, _, best_ratio)| ratio < best_ratio)
                {
                    best = Some((a, b, ratio));
                }
            }
        }
        let Some((a, b, _)) = best else {
            break;
        };
        let absorbed = groups.remove(b);
        let target = &mut groups[a];
        target.indices.extend(absorbed.indices);
        target.columns.extend(absorbed.columns);
        target.max_member_size = target.max_member_size.max(absorbed.max_member_size);
    }

    groups.into_iter().map(|g| g.indices).collect()
}
