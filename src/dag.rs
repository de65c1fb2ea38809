//! Router-side plan DAG: construction, validation, and depth analysis.
//!
//! A plan arrives as a flat list of work items with `depends_on` edges.
//! [`PlanDag::build`] materializes the adjacency in both directions, finds
//! the root, and runs three validation passes into one
//! [`ValidationReport`]:
//!
//! 1. **Acyclicity** - DFS with a recursion stack; any back edge is an
//!    error.
//! 2. **Root reachability** - every item must transitively reach the root.
//! 3. **Column linkage** - every non-base input column of an item must be
//!    produced by some transitive ancestor, where "produced" tolerates the
//!    conventional output-name postfixes (`_idx`, `_agg`, `_sorted`, ...),
//!    stripped iteratively until no further postfix matches.
//!
//! The DAG is returned regardless of the outcome so the router can still
//! forward plans that only raised warnings.
//!
//! [`item_depths`] computes, per item, the longest path from any leaf -
//! the "depth" at which the item's base-column reads hit the memory
//! hierarchy. The transfer cost model buckets contention by this depth.

use crate::column::DataType;
use crate::plan::{ClientUuid, ItemId, QueryPlan, WorkItem};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Output-name postfixes accepted when linking an input column to its
/// producing ancestor.
const LINK_POSTFIXES: &[&str] = &[
    "_i", "_o", "_idx", "_idx_ext", "_agg", "_sorted", "_pos", "_mask", "_result", "_out", "_in",
    "_left", "_right", "_l", "_r",
];

/// A single validation finding.
#[derive(Clone, Debug)]
pub struct ValidationIssue {
    pub item: Option<ItemId>,
    pub message: String,
}

impl ValidationIssue {
    fn new(item: Option<ItemId>, message: impl Into<String>) -> Self {
        Self {
            item,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.item {
            Some(id) => write!(f, "[item {}] {}", id, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Accumulated findings of all validation passes.
#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, item: Option<ItemId>, message: impl Into<String>) {
        self.errors.push(ValidationIssue::new(item, message));
    }

    fn warn(&mut self, item: Option<ItemId>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue::new(item, message));
    }
}

/// A validated plan DAG with its base-column summary.
pub struct PlanDag {
    plan: QueryPlan,
    src_uuid: ClientUuid,
    tgt_uuid: ClientUuid,
    children: HashMap<ItemId, Vec<ItemId>>,
    parents: HashMap<ItemId, Vec<ItemId>>,
    root: Option<ItemId>,
    /// `table.column -> reading items` for inputs marked `is_base`.
    base_columns: HashMap<String, Vec<ItemId>>,
    base_types: HashMap<String, DataType>,
    report: ValidationReport,
}

impl PlanDag {
    /// Build the DAG and run all validation passes.
    pub fn build(plan: QueryPlan, src_uuid: ClientUuid, tgt_uuid: ClientUuid) -> Self {
        let mut children: HashMap<ItemId, Vec<ItemId>> = HashMap::new();
        let mut parents: HashMap<ItemId, Vec<ItemId>> = HashMap::new();
        for item in &plan.items {
            children.entry(item.item_id).or_default();
            parents.entry(item.item_id).or_default();
        }
        for item in &plan.items {
            for &dep in &item.depends_on {
                children.entry(dep).or_default().push(item.item_id);
                parents.entry(item.item_id).or_default().push(dep);
            }
        }

        let mut dag = Self {
            plan,
            src_uuid,
            tgt_uuid,
            children,
            parents,
            root: None,
            base_columns: HashMap::new(),
            base_types: HashMap::new(),
            report: ValidationReport::default(),
        };

        dag.find_root();
        dag.check_cycles();
        dag.check_reachability();
        dag.check_column_linkage();
        dag.collect_base_columns();
        dag
    }

    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    pub fn into_plan(self) -> QueryPlan {
        self.plan
    }

    pub fn src_uuid(&self) -> ClientUuid {
        self.src_uuid
    }

    pub fn tgt_uuid(&self) -> ClientUuid {
        self.tgt_uuid
    }

    pub fn root(&self) -> Option<ItemId> {
        self.root
    }

    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    /// `table.column -> reading item ids` for all base inputs.
    pub fn base_columns(&self) -> &HashMap<String, Vec<ItemId>> {
        &self.base_columns
    }

    pub fn base_column_types(&self) -> &HashMap<String, DataType> {
        &self.base_types
    }

    fn item(&self, id: ItemId) -> Option<&WorkItem> {
        self.plan.items.iter().find(|item| item.item_id == id)
    }

    /// The root is the single `Result` item. No result item warns and falls
    /// back to a terminal node; several warn and pick the first.
    fn find_root(&mut self) {
        let results: Vec<ItemId> = self
            .plan
            .items
            .iter()
            .filter(|item| item.is_result())
            .map(|item| item.item_id)
            .collect();
        self.root = match results.len() {
            1 => Some(results[0]),
            0 => {
                let terminal = self
                    .plan
                    .items
                    .iter()
                    .map(|item| item.item_id)
                    .find(|id| self.children.get(id).is_none_or(Vec::is_empty));
                self.report
                    .warn(None, "plan has no result item, using a terminal node as root");
                terminal
            }
            _ => {
                self.report.warn(
                    None,
                    format!("plan has {} result items, using the first", results.len()),
                );
                Some(results[0])
            }
        };
    }

    /// DFS with an explicit recursion stack; a back edge means a cycle.
    fn check_cycles(&mut self) {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InStack,
            Done,
        }

        let mut marks: HashMap<ItemId, Mark> = self
            .plan
            .items
            .iter()
            .map(|item| (item.item_id, Mark::Unvisited))
            .collect();
        let ids: Vec<ItemId> = self.plan.items.iter().map(|item| item.item_id).collect();

        for start in ids {
            if marks[&start] != Mark::Unvisited {
                continue;
            }
            // Iterative DFS: (node, next child index).
            let mut stack: Vec<(ItemId, usize)> = vec![(start, 0)];
            marks.insert(start, Mark::InStack);
            while let Some(&(node, next)) = stack.last() {
                let kids = self.children.get(&node).cloned().unwrap_or_default();
                if next < kids.len() {
                    stack.last_mut().expect("non-empty stack").1 += 1;
                    let child = kids[next];
                    match marks.get(&child).copied().unwrap_or(Mark::Done) {
                        Mark::InStack => {
                            self.report.error(
                                Some(child),
                                format!("dependency cycle detected through item {child}"),
                            );
                        }
                        Mark::Unvisited => {
                            marks.insert(child, Mark::InStack);
                            stack.push((child, 0));
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                }
            }
        }
    }

    /// Every item must reach the root by following child edges.
    fn check_reachability(&mut self) {
        let Some(root) = self.root else {
            self.report.error(None, "plan has no reachable root");
            return;
        };
        // Walk the inverse edges from the root instead of one forward walk
        // per item.
        let mut reaches: HashSet<ItemId> = HashSet::new();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if !reaches.insert(node) {
                continue;
            }
            if let Some(parents) = self.parents.get(&node) {
                stack.extend(parents.iter().copied());
            }
        }
        for item in &self.plan.items {
            if !reaches.contains(&item.item_id) {
                self.report.error(
                    Some(item.item_id),
                    format!("item {} cannot reach the plan root", item.item_id),
                );
            }
        }
    }

    /// Every intermediate (non-base) input must be produced by a transitive
    /// ancestor, modulo the conventional output-name postfixes.
    fn check_column_linkage(&mut self) {
        let mut issues = Vec::new();
        for item in &self.plan.items {
            let ancestors = self.transitive_ancestors(item.item_id);
            for input in item.payload.input_refs() {
                if input.is_base {
                    continue;
                }
                let wanted = candidate_names(&input.column);
                let produced = ancestors
                    .iter()
                    .filter_map(|id| self.item(*id))
                    .flat_map(|ancestor| ancestor.payload.output_refs())
                    .any(|output| wanted.iter().any(|name| output.column == *name));
                if !produced {
                    issues.push((
                        item.item_id,
                        format!(
                            "input column {} of item {} has no producing ancestor",
                            input.ident(),
                            item.item_id
                        ),
                    ));
                }
            }
        }
        for (id, message) in issues {
            self.report.error(Some(id), message);
        }
    }

    fn transitive_ancestors(&self, id: ItemId) -> HashSet<ItemId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<ItemId> = self.parents.get(&id).cloned().unwrap_or_default();
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                if let Some(parents) = self.parents.get(&node) {
                    stack.extend(parents.iter().copied());
                }
            }
        }
        seen
    }

    fn collect_base_columns(&mut self) {
        for item in &self.plan.items {
            for input in item.payload.input_refs() {
                if !input.is_base {
                    continue;
                }
                let ident = input.ident();
                self.base_columns
                    .entry(ident.clone())
                    .or_default()
                    .push(item.item_id);
                self.base_types.entry(ident).or_insert(input.dtype);
            }
        }
    }
}

/// All names an input column may be produced under: the name itself plus
/// every iterative postfix-stripped form (`a_idx_ext` -> `a_idx` -> `a`).
fn candidate_names(column: &str) -> Vec<String> {
    let mut names = vec![column.to_string()];
    loop {
        let last = names.last().cloned().unwrap_or_default();
        let Some(stripped) = LINK_POSTFIXES
            .iter()
            .filter_map(|postfix| last.strip_suffix(postfix))
            .find(|stripped| !stripped.is_empty())
        else {
            break;
        };
        if names.iter().any(|name| name == stripped) {
            break;
        }
        names.push(stripped.to_string());
    }
    names
}

/// Longest path from any leaf to each item ("execution depth").
pub fn item_depths(plan: &QueryPlan) -> HashMap<ItemId, u32> {
    let deps: HashMap<ItemId, Vec<ItemId>> = plan
        .items
        .iter()
        .map(|item| (item.item_id, item.depends_on.clone()))
        .collect();

    fn depth_of(
        id: ItemId,
        deps: &HashMap<ItemId, Vec<ItemId>>,
        memo: &mut HashMap<ItemId, u32>,
        visiting: &mut HashSet<ItemId>,
    ) -> u32 {
        if let Some(&d) = memo.get(&id) {
            return d;
        }
        if !visiting.insert(id) {
            // Cycle guard; validation reports it separately.
            return 0;
        }
        let d = deps
            .get(&id)
            .into_iter()
            .flatten()
            .map(|&dep| depth_of(dep, deps, memo, visiting) + 1)
            .max()
            .unwrap_or(0);
        visiting.remove(&id);
        memo.insert(id, d);
        d
    }

    let mut memo = HashMap::new();
    let mut visiting = HashSet::new();
    for item in &plan.items {
        depth_of(item.item_id, &deps, &mut memo, &mut visiting);
    }
    memo
}
