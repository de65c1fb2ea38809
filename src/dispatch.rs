//! Mapping from work-item descriptors to operator instances.
//!
//! Every dispatchable operation is keyed by a composite id: the request
//! envelope case in the high 16 bits, the operator payload case in the low
//! 16. The dispatcher holds a factory per id; a work item with no matching
//! factory gets a fabricated failure response handed straight to the
//! pool's finish path, so the orchestrator sees the failure like any other.

use crate::catalog::Catalog;
use crate::operators::{self, Operator};
use crate::plan::{ClientUuid, WorkItem, WorkRequest, WorkResponse};
use crate::worker::{Task, WorkerPool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

pub type CompositeId = u32;

type OperatorFactory = fn(Arc<Catalog>, WorkItem) -> Box<dyn Operator>;

/// Combine request and operator case into one dispatch key.
pub fn composite_id(request_case: u16, operator_case: u16) -> CompositeId {
    (CompositeId::from(request_case) << 16) | CompositeId::from(operator_case)
}

/// The request case of a bare work item inside a [`WorkRequest`].
pub const WORK_ITEM_CASE: u16 = 1;

/// Operator classes a unit can be configured to support.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperatorClass {
    Filter,
    Join,
    Aggregate,
    Sort,
    Group,
    Map,
    Materialize,
    Set,
    Result,
    Transfer,
}

impl OperatorClass {
    pub const ALL: [OperatorClass; 10] = [
        OperatorClass::Filter,
        OperatorClass::Join,
        OperatorClass::Aggregate,
        OperatorClass::Sort,
        OperatorClass::Group,
        OperatorClass::Map,
        OperatorClass::Materialize,
        OperatorClass::Set,
        OperatorClass::Result,
        OperatorClass::Transfer,
    ];

    fn operator_case(self) -> u16 {
        match self {
            OperatorClass::Filter => 1,
            OperatorClass::Join => 2,
            OperatorClass::Aggregate => 3,
            OperatorClass::Sort => 4,
            OperatorClass::Group => 5,
            OperatorClass::Map => 6,
            OperatorClass::Materialize => 7,
            OperatorClass::Set => 8,
            OperatorClass::Result => 9,
            OperatorClass::Transfer => 10,
        }
    }

    fn factory(self) -> OperatorFactory {
        match self {
            OperatorClass::Filter => operators::filter::build,
            OperatorClass::Join => operators::join::build,
            OperatorClass::Aggregate => operators::aggregate::build,
            OperatorClass::Sort => operators::sort::build,
            OperatorClass::Group => operators::group::build,
            OperatorClass::Map => operators::map::build,
            OperatorClass::Materialize => operators::materialize::build,
            OperatorClass::Set => operators::set_ops::build,
            OperatorClass::Result => operators::result::build,
            OperatorClass::Transfer => operators::transfer::build,
        }
    }
}

/// Builds operator tasks from work items and submits them to the pool.
pub struct OperatorDispatcher {
    factories: HashMap<CompositeId, OperatorFactory>,
    pool: Arc<WorkerPool>,
    catalog: Arc<Catalog>,
}

impl OperatorDispatcher {
    /// Dispatcher supporting every operator class.
    pub fn new(pool: Arc<WorkerPool>, catalog: Arc<Catalog>) -> Self {
        Self::with_supported(pool, catalog, &OperatorClass::ALL)
    }

    /// Dispatcher supporting only the given classes; anything else fails
    /// the item at dispatch time.
    pub fn with_supported(
        pool: Arc<WorkerPool>,
        catalog: Arc<Catalog>,
        classes: &[OperatorClass],
    ) -> Self {
        let mut factories = HashMap::new();
        for class in classes {
            let id = composite_id(WORK_ITEM_CASE, class.operator_case());
            debug!(?class, id, "registered operator factory");
            factories.insert(id, class.factory());
        }
        Self {
            factories,
            pool,
            catalog,
        }
    }

    /// The composite id a request envelope dispatches under.
    pub fn id_for_request(&self, request: &WorkRequest) -> CompositeId {
        let operator_case = match request {
            WorkRequest::Item(item) => item.payload.case_id(),
            WorkRequest::Plan(_) | WorkRequest::Group(_) => 0,
        };
        composite_id(request.case_id(), operator_case)
    }

    /// Wrap the item in a task and enqueue it; unknown operations are
    /// finalized immediately with a failure response.
    pub fn dispatch(&self, target: ClientUuid, item: WorkItem) {
        let id = composite_id(WORK_ITEM_CASE, item.payload.case_id());
        match self.factories.get(&id) {
            Some(factory) => {
                let op = factory(Arc::clone(&self.catalog), item.clone());
                self.pool.enqueue(Task::new(op, item, target));
            }
            None => {
                error!(id, operator = item.payload.name(), "requested operation is unknown");
                let task = Task {
                    op: None,
                    response: WorkResponse::failure(
                        item.plan_id,
                        item.item_id,
                        format!("requested operation is unknown: {id}"),
                    ),
                    work_item: Some(item),
                    target,
                };
                self.pool.finalize_task(task);
            }
        }
    }

    /// Single-CPU variant: run the operator inline on the caller thread and
    /// return the finished task instead of enqueueing it.
    pub fn dispatch_inline(&self, target: ClientUuid, item: WorkItem) -> Task {
        let id = composite_id(WORK_ITEM_CASE, item.payload.case_id());
        let mut task = Task {
            op: None,
            work_item: Some(item.clone()),
            response: WorkResponse::default(),
            target,
        };
        match self.factories.get(&id) {
            Some(factory) => {
                let mut op = factory(Arc::clone(&self.catalog), item);
                task.response = op.run();
            }
            None => {
                task.response = WorkResponse::failure(
                    item.plan_id,
                    item.item_id,
                    format!("requested operation is unknown: {id}"),
                );
            }
        }
        task
    }
}
