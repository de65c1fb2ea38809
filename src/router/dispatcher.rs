//! Group assembly: clustering, staging decisions, and plan rewriting.
//!
//! [`Grouper::analyze`] takes the plans of one sealed window and produces
//! ready-to-send [`QueryGroup`] messages: plans clustered by shared base
//! columns, one column-transfer work item per column the cost model
//! selected for DRAM staging, and every plan rewritten so its reads hit the
//! staged alias `<group_id>_<table>` instead of the original table.

use crate::dag::{self, PlanDag};
use crate::ident::UniqueId;
use crate::plan::{
    ClientUuid, ColumnRef, OperatorPayload, QueryGroup, QueryPlan, TransferPayload, WorkItem,
};
use crate::router::cost::{
    decide_transfers, ColumnAccess, HardwareConfig, LoadProfile, DEFAULT_CHUNK_BYTES,
};
use crate::router::grouping::{group_by_superset_absorption, GroupingConfig};
use crate::router::schema::ColumnSizes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Stateless group assembly engine; one per router.
pub struct Grouper {
    pub grouping: GroupingConfig,
    pub chunk_bytes: u64,
    pub hardware: HardwareConfig,
    pub sizes: ColumnSizes,
    pub ids: Arc<UniqueId>,
}

impl Grouper {
    pub fn new(sizes: ColumnSizes, ids: Arc<UniqueId>) -> Self {
        Self {
            grouping: GroupingConfig::default(),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            hardware: HardwareConfig::default(),
            sizes,
            ids,
        }
    }

    /// Cluster, decide transfers, rewrite, and address the groups
    /// round-robin over the connected compute units.
    pub fn analyze(
        &self,
        dags: Vec<PlanDag>,
        compute_units: &[ClientUuid],
    ) -> Vec<(ClientUuid, QueryGroup)> {
        if dags.is_empty() {
            return Vec::new();
        }
        if compute_units.is_empty() {
            warn!("no compute unit connected, cannot dispatch groups");
            return Vec::new();
        }

        let column_sets: Vec<HashSet<String>> = dags
            .iter()
            .map(|dag| dag.base_columns().keys().cloned().collect())
            .collect();
        let groups = group_by_superset_absorption(&column_sets, &self.grouping);

        let group_accesses: Vec<HashMap<String, ColumnAccess>> = groups
            .iter()
            .map(|group| self.collect_accesses(group, &dags))
            .collect();

        // The global load profile sums every group's demand; each group's
        // selection then updates it in place.
        let mut load = LoadProfile::default();
        for accesses in &group_accesses {
            for access in accesses.values() {
                for &depth in &access.access_depths {
                    load.add(depth, access.size_bytes);
                }
            }
        }

        let decisions =
            decide_transfers(&group_accesses, &mut load, self.chunk_bytes, &self.hardware);

        let mut out = Vec::with_capacity(groups.len());
        for (group_idx, group) in groups.iter().enumerate() {
            let group_id = self.ids.next();
            let id_prefix = format!("{group_id}_");

            // One transfer per selected column, deduplicated across the
            // group's plans, in saving order.
            let mut transfers: Vec<WorkItem> = Vec::new();
            let mut replacements: HashMap<String, String> = HashMap::new();
            for ident in &decisions[group_idx] {
                let Some(source) = self.find_base_ref(group, &dags, ident) else {
                    warn!(ident, "selected column not found in any plan, skipping");
                    continue;
                };
                let aliased_table = format!("{id_prefix}{}", source.table);
                replacements.insert(ident.clone(), aliased_table.clone());

                let destination = ColumnRef {
                    table: aliased_table,
                    ..source.clone()
                };
                transfers.push(WorkItem::new(
                    0,
                    0,
                    OperatorPayload::Transfer(TransferPayload {
                        source,
                        destination,
                    }),
                ));
            }

            let plans: Vec<QueryPlan> = group
                .iter()
                .map(|&dag_idx| rename_tables(dags[dag_idx].plan().clone(), &replacements))
                .collect();

            let target = compute_units[group_idx % compute_units.len()];
            info!(
                group_id,
                plans = plans.len(),
                transfers = transfers.len(),
                "assembled query group"
            );
            out.push((
                target,
                QueryGroup {
                    group_id,
                    transfers,
                    plans,
                },
            ));
        }
        out
    }

    /// Merge base-column access patterns of every plan in the group.
    fn collect_accesses(&self, group: &[usize], dags: &[PlanDag]) -> HashMap<String, ColumnAccess> {
        let mut accesses: HashMap<String, ColumnAccess> = HashMap::new();
        for &dag_idx in group {
            let dag = &dags[dag_idx];
            let depths = dag::item_depths(dag.plan());
            for (ident, readers) in dag.base_columns() {
                let access = accesses.entry(ident.clone()).or_insert_with(|| ColumnAccess {
                    ident: ident.clone(),
                    size_bytes: self.sizes.get(ident).unwrap_or(0),
                    ..Default::default()
                });
                access.access_count += readers.len();
                for item in readers {
                    if let Some(&depth) = depths.get(item) {
                        access.access_depths.push(depth);
                    }
                }
            }
        }
        accesses
    }

    /// The original (pre-alias) reference of a selected base column.
    fn find_base_ref(&self, group: &[usize], dags: &[PlanDag], ident: &str) -> Option<ColumnRef> {
        for &dag_idx in group {
            for item in &dags[dag_idx].plan().items {
                for input in item.payload.input_refs() {
                    if input.is_base && input.ident() == ident {
                        return Some(input.clone());
                    }
                }
            }
        }
        None
    }
}

/// Rewrite every input reference whose `table.column` is in the
/// replacement map to point at the staged alias table.
pub fn rename_tables(mut plan: QueryPlan, replacements: &HashMap<String, String>) -> QueryPlan {
    for item in &mut plan.items {
        for input in item.payload.input_refs_mut() {
            if let Some(new_table) = replacements.get(&input.ident()) {
                input.table = new_table.clone();
            }
        }
    }
    plan
}
