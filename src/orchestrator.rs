//! Dependency-driven plan orchestration.
//!
//! One orchestrator runs per compute unit and owns exactly two threads:
//!
//! - an **event loop** draining a FIFO channel of plan events. All plan
//!   state mutation happens on this thread, so there is no internal lock
//!   ordering to get wrong - the plan map's mutex only additionally serves
//!   read-only status queries;
//! - a **GC thread** that erases finished plans. It sleeps for
//!   `gc_interval` and is woken early when the cleanup queue reaches
//!   `max_pending_cleanup`.
//!
//! External callers (the pool's finish callback, the network path) never
//! touch plan state; they push events. Events are processed strictly in
//! FIFO order, so two completions for the same plan cannot race.
//!
//! Item lifecycle:
//!
//! ```text
//! Pending ──deps met──▶ Ready ──dispatch──▶ Dispatched ──success──▶ Completed
//!    │                                          │
//!    │                                          └──fail──▶ Failed (plan cancelled)
//!    └──plan cancelled──▶ Cancelled
//! ```
//!
//! `Pending -> Ready -> Dispatched` happens back-to-back inside one event;
//! `Ready` is transient bookkeeping. An item is dispatched at most once,
//! and only when every dependency is in the plan's completed set.
//!
//! On item failure the plan is cancelled: Pending/Ready items flip to
//! Cancelled, but already-dispatched items are not interrupted - their
//! eventual completion events arrive at a cancelled plan and are absorbed.
//! `FinalizePlan` on a plan still `Active` is a no-op; cleanup only starts
//! from `Completed` or `Cancelled`.

use crate::plan::{ClientUuid, ItemId, PlanId, QueryPlan, WorkItem};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// Receiver of ready work items; the operator dispatcher in production, a
/// recorder in tests.
pub trait ItemDispatcher: Send + Sync {
    fn dispatch(&self, target: ClientUuid, item: WorkItem);
}

impl ItemDispatcher for crate::dispatch::OperatorDispatcher {
    fn dispatch(&self, target: ClientUuid, item: WorkItem) {
        crate::dispatch::OperatorDispatcher::dispatch(self, target, item);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanStatus {
    Active,
    Completed,
    Cancelled,
    PendingCleanup,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Ready,
    Dispatched,
    Completed,
    Failed,
    Cancelled,
}

struct ItemState {
    status: ItemStatus,
    dependencies: Vec<ItemId>,
    work_item: WorkItem,
}

struct PlanContext {
    status: PlanStatus,
    target: ClientUuid,
    items: HashMap<ItemId, ItemState>,
    pending_items: HashSet<ItemId>,
    completed_items: HashSet<ItemId>,
}

enum Event {
    SubmitPlan { plan: QueryPlan, target: ClientUuid },
    ItemCompleted { plan_id: PlanId, item_id: ItemId },
    ItemFailed { plan_id: PlanId, item_id: ItemId },
    CancelPlan { plan_id: PlanId },
    FinalizePlan { plan_id: PlanId },
    Shutdown,
}

#[derive(Clone, Copy, Debug)]
pub struct OrchestratorConfig {
    pub gc_interval: Duration,
    /// Queue length at which the GC thread is woken early.
    pub max_pending_cleanup: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(5),
            max_pending_cleanup: 100,
        }
    }
}

struct CleanupQueue {
    queue: Mutex<VecDeque<PlanId>>,
    cv: Condvar,
}

type PlanMap = HashMap<PlanId, PlanContext>;

/// Per-unit scheduler tracking item state across concurrent plans.
pub struct PlanOrchestrator {
    tx: Sender<Event>,
    plans: Arc<Mutex<PlanMap>>,
    cleanup: Arc<CleanupQueue>,
    running: Arc<AtomicBool>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    gc_thread: Mutex<Option<JoinHandle<()>>>,
}

impl PlanOrchestrator {
    pub fn new(config: OrchestratorConfig, dispatcher: Arc<dyn ItemDispatcher>) -> Self {
        let (tx, rx) = unbounded();
        let plans: Arc<Mutex<PlanMap>> = Arc::new(Mutex::new(HashMap::new()));
        let cleanup = Arc::new(CleanupQueue {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        });
        let running = Arc::new(AtomicBool::new(true));

        let event_thread = {
            let plans = Arc::clone(&plans);
            let cleanup = Arc::clone(&cleanup);
            let running = Arc::clone(&running);
            thread::spawn(move || event_loop(&rx, &plans, &cleanup, &running, &config, dispatcher))
        };
        let gc_thread = {
            let plans = Arc::clone(&plans);
            let cleanup = Arc::clone(&cleanup);
            let running = Arc::clone(&running);
            thread::spawn(move || gc_loop(&plans, &cleanup, &running, &config))
        };

        Self {
            tx,
            plans,
            cleanup,
            running,
            event_thread: Mutex::new(Some(event_thread)),
            gc_thread: Mutex::new(Some(gc_thread)),
        }
    }

    fn push(&self, event: Event) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    /// Submit a new plan. Returns false when the orchestrator is shut down.
    pub fn submit_plan(&self, plan: QueryPlan, target: ClientUuid) -> bool {
        self.push(Event::SubmitPlan { plan, target })
    }

    /// A work item finished successfully.
    pub fn on_item_completed(&self, plan_id: PlanId, item_id: ItemId) {
        self.push(Event::ItemCompleted { plan_id, item_id });
    }

    /// A work item failed; the plan will be cancelled.
    pub fn on_item_failed(&self, plan_id: PlanId, item_id: ItemId) {
        self.push(Event::ItemFailed { plan_id, item_id });
    }

    /// Cancel all remaining items of a plan and mark it for cleanup.
    pub fn cancel_plan(&self, plan_id: PlanId) {
        self.push(Event::CancelPlan { plan_id });
    }

    /// Mark a finished plan for cleanup. No-op while the plan is Active.
    pub fn finalize_plan(&self, plan_id: PlanId) {
        self.push(Event::FinalizePlan { plan_id });
    }

    pub fn plan_status(&self, plan_id: PlanId) -> Option<PlanStatus> {
        self.plans.lock().get(&plan_id).map(|ctx| ctx.status)
    }

    pub fn item_status(&self, plan_id: PlanId, item_id: ItemId) -> Option<ItemStatus> {
        self.plans
            .lock()
            .get(&plan_id)?
            .items
            .get(&item_id)
            .map(|item| item.status)
    }

    /// Graceful shutdown: the event loop drains its queue, the GC thread
    /// wakes and exits, both are joined.
    pub fn shutdown(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let _ = self.tx.send(Event::Shutdown);
        self.cleanup.cv.notify_all();
        if let Some(handle) = self.event_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.gc_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PlanOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn event_loop(
    rx: &Receiver<Event>,
    plans: &Mutex<PlanMap>,
    cleanup: &CleanupQueue,
    running: &AtomicBool,
    config: &OrchestratorConfig,
    dispatcher: Arc<dyn ItemDispatcher>,
) {
    let mut stop = false;
    while !stop {
        let Ok(event) = rx.recv() else {
            break;
        };
        stop = process_event(event, plans, cleanup, config, dispatcher.as_ref());
    }
    running.store(false, Ordering::Release);
    // Drain whatever was queued before the shutdown event.
    while let Ok(event) = rx.try_recv() {
        process_event(event, plans, cleanup, config, dispatcher.as_ref());
    }
}

/// Returns true when the event was `Shutdown`.
fn process_event(
    event: Event,
    plans: &Mutex<PlanMap>,
    cleanup: &CleanupQueue,
    config: &OrchestratorConfig,
    dispatcher: &dyn ItemDispatcher,
) -> bool {
    match event {
        Event::SubmitPlan { plan, target } => {
            let mut plans = plans.lock();
            let plan_id = plan.plan_id;
            if plans.contains_key(&plan_id) {
                error!(plan_id, "duplicate plan id, rejecting submission");
                return false;
            }
            let mut ctx = PlanContext {
                status: PlanStatus::Active,
                target,
                items: HashMap::new(),
                pending_items: HashSet::new(),
                completed_items: HashSet::new(),
            };
            for item in plan.items {
                ctx.pending_items.insert(item.item_id);
                ctx.items.insert(
                    item.item_id,
                    ItemState {
                        status: ItemStatus::Pending,
                        dependencies: item.depends_on.clone(),
                        work_item: item,
                    },
                );
            }
            plans.insert(plan_id, ctx);
            let ctx = plans.get_mut(&plan_id).expect("just inserted");
            schedule_ready_items(ctx, dispatcher);
        }
        Event::ItemCompleted { plan_id, item_id } => {
            let mut plans = plans.lock();
            let Some(ctx) = plans.get_mut(&plan_id) else {
                error!(plan_id, "completion event for unknown plan");
                return false;
            };
            if ctx.status != PlanStatus::Active {
                return false;
            }
            let Some(item) = ctx.items.get_mut(&item_id) else {
                return false;
            };
            if item.status != ItemStatus::Dispatched {
                return false;
            }
            item.status = ItemStatus::Completed;
            ctx.pending_items.remove(&item_id);
            ctx.completed_items.insert(item_id);

            if ctx.pending_items.is_empty() {
                debug!(plan_id, "plan completed");
                ctx.status = PlanStatus::Completed;
                return false;
            }
            schedule_ready_items(ctx, dispatcher);
        }
        Event::ItemFailed { plan_id, item_id } => {
            let mut plans = plans.lock();
            let Some(ctx) = plans.get_mut(&plan_id) else {
                error!(plan_id, "failure event for unknown plan");
                return false;
            };
            if ctx.status != PlanStatus::Active {
                return false;
            }
            let Some(item) = ctx.items.get_mut(&item_id) else {
                return false;
            };
            item.status = ItemStatus::Failed;
            debug!(plan_id, item_id, "item failed, cancelling plan");
            cancel_remaining(ctx);
            mark_for_cleanup(ctx, plan_id, cleanup, config);
        }
        Event::CancelPlan { plan_id } => {
            let mut plans = plans.lock();
            let Some(ctx) = plans.get_mut(&plan_id) else {
                error!(plan_id, "cancel event for unknown plan");
                return false;
            };
            if ctx.status == PlanStatus::PendingCleanup {
                return false;
            }
            cancel_remaining(ctx);
            mark_for_cleanup(ctx, plan_id, cleanup, config);
        }
        Event::FinalizePlan { plan_id } => {
            let mut plans = plans.lock();
            let Some(ctx) = plans.get_mut(&plan_id) else {
                error!(plan_id, "finalize event for unknown plan");
                return false;
            };
            match ctx.status {
                PlanStatus::Completed | PlanStatus::Cancelled => {
                    mark_for_cleanup(ctx, plan_id, cleanup, config);
                }
                // A finalize racing ahead of the terminal completion event
                // must not force cleanup of a live plan.
                PlanStatus::Active | PlanStatus::PendingCleanup => {}
            }
        }
        Event::Shutdown => return true,
    }
    false
}

/// Dispatch every pending item whose dependencies are all completed.
fn schedule_ready_items(ctx: &mut PlanContext, dispatcher: &dyn ItemDispatcher) {
    if ctx.status != PlanStatus::Active {
        return;
    }
    let pending: Vec<ItemId> = ctx.pending_items.iter().copied().collect();
    for item_id in pending {
        let Some(item) = ctx.items.get(&item_id) else {
            continue;
        };
        if item.status != ItemStatus::Pending {
            continue;
        }
        let deps_met = item
            .dependencies
            .iter()
            .all(|dep| ctx.completed_items.contains(dep));
        if !deps_met {
            continue;
        }
        let item = ctx.items.get_mut(&item_id).expect("item exists");
        item.status = ItemStatus::Ready;
        item.status = ItemStatus::Dispatched;
        dispatcher.dispatch(ctx.target, item.work_item.clone());
    }
}

fn cancel_remaining(ctx: &mut PlanContext) {
    ctx.status = PlanStatus::Cancelled;
    for item in ctx.items.values_mut() {
        if matches!(item.status, ItemStatus::Pending | ItemStatus::Ready) {
            item.status = ItemStatus::Cancelled;
        }
    }
}

fn mark_for_cleanup(
    ctx: &mut PlanContext,
    plan_id: PlanId,
    cleanup: &CleanupQueue,
    config: &OrchestratorConfig,
) {
    ctx.status = PlanStatus::PendingCleanup;
    let mut queue = cleanup.queue.lock();
    queue.push_back(plan_id);
    if queue.len() >= config.max_pending_cleanup {
        cleanup.cv.notify_one();
    }
}

fn gc_loop(
    plans: &Mutex<PlanMap>,
    cleanup: &CleanupQueue,
    running: &AtomicBool,
    config: &OrchestratorConfig,
) {
    loop {
        let to_cleanup: Vec<PlanId> = {
            let mut queue = cleanup.queue.lock();
            if running.load(Ordering::Acquire) && queue.len() < config.max_pending_cleanup {
                let _ = cleanup.cv.wait_for(&mut queue, config.gc_interval);
            }
            if !running.load(Ordering::Acquire) && queue.is_empty() {
                break;
            }
            queue.drain(..).collect()
        };

        if !to_cleanup.is_empty() {
            let mut plans = plans.lock();
            for plan_id in to_cleanup {
                if plans
                    .get(&plan_id)
                    .is_some_and(|ctx| ctx.status == PlanStatus::PendingCleanup)
                {
                    debug!(plan_id, "garbage-collected plan");
                    plans.remove(&plan_id);
                }
            }
        }
    }
}
