//! Compute-unit front-end.
//!
//! Wires the worker pool's finish callback into the orchestrator, turns
//! terminal `Result` completions into [`PlanResponse`]s for the
//! originator, and keeps the group bookkeeping: which plans belong to
//! which query group and which aliased tables the group staged. When the
//! last plan of a group finishes, every staged table is dropped from the
//! catalog.
//!
//! Outbound traffic goes through the [`ResponseSink`] trait so the
//! front-end works identically over a live router connection and inside
//! in-process tests.

use crate::catalog::Catalog;
use crate::column::{Column, DataType};
use crate::dispatch::OperatorDispatcher;
use crate::orchestrator::{OrchestratorConfig, PlanOrchestrator};
use crate::plan::{
    ClientUuid, ExtendedResult, GroupId, OperatorPayload, PlanId, PlanResponse, QueryGroup,
    QueryPlan, WorkItem,
};
use crate::worker::{Task, WorkerPool};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Outbound channel of a compute unit.
pub trait ResponseSink: Send + Sync {
    fn send_plan_response(&self, target: ClientUuid, response: &PlanResponse);
    /// Push a queued task back to the router for rerouting.
    fn forward_work(&self, target: ClientUuid, item: &WorkItem);
    fn send_text(&self, target: ClientUuid, text: &str);
}

#[derive(Default)]
struct GroupBook {
    group_to_plans: HashMap<GroupId, Vec<PlanId>>,
    plan_to_group: HashMap<PlanId, GroupId>,
    group_to_tables: HashMap<GroupId, HashSet<String>>,
}

/// Front-end state shared by all network callbacks of one unit.
pub struct UnitFrontend {
    catalog: Arc<Catalog>,
    pool: Arc<WorkerPool>,
    dispatcher: Arc<OperatorDispatcher>,
    orchestrator: PlanOrchestrator,
    sink: Arc<dyn ResponseSink>,
    groups: Mutex<GroupBook>,
    extended: Mutex<HashMap<PlanId, Vec<ExtendedResult>>>,
}

impl UnitFrontend {
    /// Build the front-end and wire the pool callbacks to it.
    pub fn install(
        catalog: Arc<Catalog>,
        pool: Arc<WorkerPool>,
        sink: Arc<dyn ResponseSink>,
        orchestrator_config: OrchestratorConfig,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(OperatorDispatcher::new(
            Arc::clone(&pool),
            Arc::clone(&catalog),
        ));
        let orchestrator =
            PlanOrchestrator::new(orchestrator_config, Arc::clone(&dispatcher) as _);

        let frontend = Arc::new(Self {
            catalog,
            pool: Arc::clone(&pool),
            dispatcher,
            orchestrator,
            sink,
            groups: Mutex::new(GroupBook::default()),
            extended: Mutex::new(HashMap::new()),
        });

        // The pool outlives its callbacks only through weak references;
        // otherwise pool and front-end keep each other alive.
        let finish_ref: Weak<UnitFrontend> = Arc::downgrade(&frontend);
        pool.set_on_finish(Arc::new(move |task| {
            if let Some(frontend) = finish_ref.upgrade() {
                frontend.on_task_finished(task);
            }
        }));
        let forward_ref: Weak<UnitFrontend> = Arc::downgrade(&frontend);
        pool.set_on_forward(Arc::new(move |task| {
            if let Some(frontend) = forward_ref.upgrade() {
                frontend.on_task_forwarded(task);
            }
        }));

        frontend
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn orchestrator(&self) -> &PlanOrchestrator {
        &self.orchestrator
    }

    pub fn dispatcher(&self) -> &Arc<OperatorDispatcher> {
        &self.dispatcher
    }

    /// A direct work request (or a rerouted one).
    pub fn handle_work(&self, src_uuid: ClientUuid, item: WorkItem) {
        self.dispatcher.dispatch(src_uuid, item);
    }

    /// A plan submitted for orchestration.
    pub fn handle_query_plan(&self, src_uuid: ClientUuid, plan: QueryPlan) {
        let plan_id = plan.plan_id;
        if !self.orchestrator.submit_plan(plan, src_uuid) {
            self.sink.send_plan_response(
                src_uuid,
                &PlanResponse {
                    plan_id,
                    success: false,
                    info: "the plan orchestrator is not running, plan was not submitted".into(),
                    extended: Vec::new(),
                },
            );
        }
    }

    /// A query group: pre-register staging destinations, dispatch the
    /// transfers, submit the plans, and remember the group bookkeeping.
    pub fn handle_query_group(&self, src_uuid: ClientUuid, group: QueryGroup) {
        info!(
            group = group.group_id,
            transfers = group.transfers.len(),
            plans = group.plans.len(),
            "received query group"
        );

        for transfer_item in group.transfers {
            let OperatorPayload::Transfer(transfer) = &transfer_item.payload else {
                warn!("query group carried a non-transfer staging item, skipping");
                continue;
            };
            let Some(source) = self
                .catalog
                .get(&transfer.source.table, &transfer.source.column)
            else {
                error!(
                    column = transfer.source.ident(),
                    "transfer source missing from catalog, skipping transfer"
                );
                continue;
            };

            // Register the destination before the copy starts so plan
            // items can resolve it and block on its watermark.
            let destination = Arc::new(Column::new(
                source.dtype(),
                source.elements(),
                false,
                None,
            ));
            if source.dtype() == DataType::StringEnc {
                destination.init_dictionary(source.dictionary());
            }
            if self
                .catalog
                .add(
                    &transfer.destination.table,
                    &transfer.destination.column,
                    destination,
                )
                .is_none()
            {
                warn!(
                    column = transfer.destination.ident(),
                    "staging destination already registered"
                );
            }
            self.groups
                .lock()
                .group_to_tables
                .entry(group.group_id)
                .or_default()
                .insert(transfer.destination.table.clone());

            self.dispatcher.dispatch(src_uuid, transfer_item);
        }

        for plan in group.plans {
            {
                let mut groups = self.groups.lock();
                groups
                    .group_to_plans
                    .entry(group.group_id)
                    .or_default()
                    .push(plan.plan_id);
                groups.plan_to_group.insert(plan.plan_id, group.group_id);
            }
            self.handle_query_plan(src_uuid, plan);
        }
    }

    /// Runtime configuration from the router.
    pub fn handle_configuration(
        &self,
        src_uuid: ClientUuid,
        action: crate::net::frame::ConfigurationAction,
        pretty_name: &str,
    ) {
        use crate::net::frame::ConfigurationAction;
        let response = match action {
            ConfigurationAction::SetWorker { count } => {
                debug!(count, "updating worker count");
                self.pool.update_workers(count);
                format!("[{pretty_name}] workers updated to {count}")
            }
            ConfigurationAction::ResetCatalog => {
                info!("clearing the data catalog");
                self.catalog.clear();
                format!("[{pretty_name}] catalog cleared")
            }
        };
        self.sink.send_text(0, &response);
        self.sink.send_text(src_uuid, &response);
    }

    /// Pool finish callback: feed the orchestrator and answer the
    /// originator when a plan reaches its terminal item.
    fn on_task_finished(&self, task: Task) {
        let Some(item) = task.work_item else {
            return;
        };
        // Staging transfers run outside any plan.
        if item.plan_id == 0 && item.item_id == 0 {
            return;
        }

        if !task.response.success {
            debug!(plan = item.plan_id, item = item.item_id, "task failed");
            self.orchestrator.on_item_failed(item.plan_id, item.item_id);
            self.sink.send_plan_response(
                task.target,
                &PlanResponse {
                    plan_id: item.plan_id,
                    success: false,
                    info: format!(
                        "plan failed at item {}: {}",
                        item.item_id, task.response.info
                    ),
                    extended: Vec::new(),
                },
            );
            return;
        }

        self.orchestrator
            .on_item_completed(item.plan_id, item.item_id);
        if let Some(extended) = task.response.extended {
            self.extended
                .lock()
                .entry(item.plan_id)
                .or_default()
                .push(extended);
        }

        if item.is_result() {
            debug!(plan = item.plan_id, "plan reached its terminal item");
            self.orchestrator.finalize_plan(item.plan_id);

            let extended = self
                .extended
                .lock()
                .remove(&item.plan_id)
                .unwrap_or_default();
            self.sink.send_plan_response(
                task.target,
                &PlanResponse {
                    plan_id: item.plan_id,
                    success: true,
                    info: "plan completed successfully".into(),
                    extended,
                },
            );

            self.release_group_tables(item.plan_id);
            if let OperatorPayload::Result(result) = &item.payload {
                if let Some(first) = result.columns.first() {
                    self.catalog.drop_table(&first.table);
                }
            }
        }
    }

    /// Drop the group's staged tables once its last plan finished.
    fn release_group_tables(&self, plan_id: PlanId) {
        let tables: Vec<String> = {
            let mut groups = self.groups.lock();
            let Some(group_id) = groups.plan_to_group.remove(&plan_id) else {
                return;
            };
            let remaining = groups.group_to_plans.entry(group_id).or_default();
            remaining.retain(|&p| p != plan_id);
            if !remaining.is_empty() {
                return;
            }
            groups.group_to_plans.remove(&group_id);
            groups
                .group_to_tables
                .remove(&group_id)
                .into_iter()
                .flatten()
                .collect()
        };
        for table in tables {
            debug!(table, "dropping staged group table");
            self.catalog.drop_table(&table);
        }
    }

    /// Pool forward callback: a draining unit pushes queued work back to
    /// the router.
    fn on_task_forwarded(&self, task: Task) {
        if let Some(item) = task.work_item {
            info!(
                plan = item.plan_id,
                item = item.item_id,
                "forwarding queued task for rerouting"
            );
            self.sink.forward_work(task.target, &item);
        }
    }
}
