//! Fixed-core worker pool executing operator tasks.
//!
//! The pool owns N OS threads, each pinned to a core of the configured
//! NUMA node, all consuming [`Task`]s from one FIFO deque. Resizing works
//! through the queue itself: to stop `k` workers, `k` sentinel tasks (no
//! operator) are pushed to the *front*; the first workers to dequeue one
//! terminate and park themselves on the zombie list, where a vacuum thread
//! joins them. When a resize stops *all* workers, every task still queued
//! is handed to the `on_forward` callback first, so a draining unit pushes
//! its backlog back onto the network instead of stranding it.
//!
//! Lock order during cleanup is `workers -> zombies`; nothing else nests.

use crate::operators::Operator;
use crate::plan::{ClientUuid, WorkItem, WorkResponse};
use core_affinity::CoreId;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// A runtime pairing of an instantiated operator with its originating work
/// item and response target. Owned exclusively by the worker that dequeues
/// it.
pub struct Task {
    /// `None` marks a sentinel that terminates the dequeuing worker.
    pub op: Option<Box<dyn Operator>>,
    pub work_item: Option<WorkItem>,
    pub response: WorkResponse,
    pub target: ClientUuid,
}

impl Task {
    pub fn new(op: Box<dyn Operator>, work_item: WorkItem, target: ClientUuid) -> Self {
        Self {
            op: Some(op),
            work_item: Some(work_item),
            response: WorkResponse::default(),
            target,
        }
    }

    fn sentinel() -> Self {
        Self {
            op: None,
            work_item: None,
            response: WorkResponse::default(),
            target: 0,
        }
    }
}

pub type TaskCallback = Arc<dyn Fn(Task) + Send + Sync>;

/// Core lists per NUMA node.
///
/// There is no portable NUMA probe, so the topology splits the visible
/// cores into `node_count` contiguous ranges; node -1 / `None` means the
/// union of all of them.
#[derive(Clone, Debug)]
pub struct Topology {
    nodes: Vec<Vec<CoreId>>,
}

impl Topology {
    pub fn detect(node_count: usize) -> Self {
        let cores = core_affinity::get_core_ids().unwrap_or_default();
        let node_count = node_count.max(1);
        let per_node = cores.len().div_ceil(node_count).max(1);
        let nodes = cores
            .chunks(per_node)
            .map(<[CoreId]>::to_vec)
            .collect::<Vec<_>>();
        Self {
            nodes: if nodes.is_empty() { vec![Vec::new()] } else { nodes },
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn cores_per_node(&self) -> usize {
        num_cpus::get() / self.node_count().max(1)
    }

    /// Cores of one node, or the union of all nodes.
    pub fn cores_for(&self, node: Option<usize>) -> Vec<CoreId> {
        match node {
            Some(n) => self.nodes.get(n).cloned().unwrap_or_default(),
            None => self.nodes.iter().flatten().copied().collect(),
        }
    }
}

struct PoolShared {
    pending: Mutex<VecDeque<Task>>,
    pending_cv: Condvar,
    stop_working: AtomicBool,

    active_workers: AtomicUsize,
    busy_workers: AtomicUsize,

    /// Current core set; bumping the generation makes live workers re-pin
    /// at their next dequeue.
    affinity: Mutex<Vec<CoreId>>,
    affinity_gen: AtomicU64,

    workers: Mutex<HashMap<u64, JoinHandle<()>>>,
    pool_cv: Condvar,
    zombies: Mutex<Vec<u64>>,
    zombie_cv: Condvar,
    stop_vacuum: AtomicBool,

    on_finish: RwLock<Option<TaskCallback>>,
    on_forward: RwLock<Option<TaskCallback>>,

    next_worker: AtomicU64,
    spawn_seq: AtomicUsize,
}

/// NUMA-pinned thread pool with live resize and drain forwarding.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    topology: Topology,
    vacuum: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` threads pinned to `node` (or all nodes for `None`).
    pub fn new(workers: usize, node: Option<usize>, topology: Topology) -> Arc<Self> {
        let shared = Arc::new(PoolShared {
            pending: Mutex::new(VecDeque::new()),
            pending_cv: Condvar::new(),
            stop_working: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            busy_workers: AtomicUsize::new(0),
            affinity: Mutex::new(topology.cores_for(node)),
            affinity_gen: AtomicU64::new(0),
            workers: Mutex::new(HashMap::new()),
            pool_cv: Condvar::new(),
            zombies: Mutex::new(Vec::new()),
            zombie_cv: Condvar::new(),
            stop_vacuum: AtomicBool::new(false),
            on_finish: RwLock::new(None),
            on_forward: RwLock::new(None),
            next_worker: AtomicU64::new(0),
            spawn_seq: AtomicUsize::new(0),
        });

        let pool = Arc::new(Self {
            shared: Arc::clone(&shared),
            topology,
            vacuum: Mutex::new(None),
        });

        let vacuum_shared = Arc::clone(&shared);
        *pool.vacuum.lock() = Some(thread::spawn(move || vacuum_loop(&vacuum_shared)));

        info!(workers, cores = shared.affinity.lock().len(), "starting worker pool");
        pool.start_workers(workers);
        pool
    }

    pub fn set_on_finish(&self, callback: TaskCallback) {
        *self.shared.on_finish.write() = Some(callback);
    }

    pub fn set_on_forward(&self, callback: TaskCallback) {
        *self.shared.on_forward.write() = Some(callback);
    }

    /// Hand a finished (or fabricated) task straight to `on_finish`.
    pub fn finalize_task(&self, task: Task) {
        let callback = self.shared.on_finish.read().clone();
        if let Some(callback) = callback {
            callback(task);
        }
    }

    /// Append a task to the global queue.
    pub fn enqueue(&self, task: Task) {
        let mut pending = self.shared.pending.lock();
        pending.push_back(task);
        drop(pending);
        self.shared.pending_cv.notify_one();
    }

    pub fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::Relaxed)
    }

    pub fn busy_workers(&self) -> usize {
        self.shared.busy_workers.load(Ordering::Relaxed)
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Spawn `count` additional workers with the current affinity.
    pub fn start_workers(&self, count: usize) {
        let mut workers = self.shared.workers.lock();
        for _ in 0..count {
            let id = self.shared.next_worker.fetch_add(1, Ordering::Relaxed);
            let shared = Arc::clone(&self.shared);
            let handle = thread::spawn(move || worker_loop(&shared, id));
            workers.insert(id, handle);
        }
        drop(workers);
        self.shared.active_workers.fetch_add(count, Ordering::Relaxed);
    }

    /// Stop `count` workers (0 = all). Stopping every worker first forwards
    /// all still-queued tasks through `on_forward`.
    pub fn stop_workers(&self, count: usize) {
        let active = self.shared.active_workers.load(Ordering::Relaxed);
        let stop_count = if count == 0 { active } else { count.min(active) };
        if stop_count == 0 {
            return;
        }
        {
            let mut pending = self.shared.pending.lock();
            if stop_count == active {
                let forward = self.shared.on_forward.read().clone();
                if let Some(forward) = forward {
                    debug!(queued = pending.len(), "forwarding queued tasks before full stop");
                    while let Some(task) = pending.pop_back() {
                        forward(task);
                    }
                }
            }
            for _ in 0..stop_count {
                pending.push_front(Task::sentinel());
            }
        }
        self.shared.active_workers.fetch_sub(stop_count, Ordering::Relaxed);
        self.shared.pending_cv.notify_all();
    }

    /// Adjust the live worker count toward `count`.
    pub fn update_workers(&self, count: usize) {
        let active = self.shared.active_workers.load(Ordering::Relaxed);
        if count < active {
            debug!(active, stopping = active - count, "shrinking pool");
            self.stop_workers(active - count);
        } else if count > active {
            debug!(active, starting = count - active, "growing pool");
            self.start_workers(count - active);
        }
    }

    /// Re-pin all current and future workers to `node`.
    pub fn set_affinity_to_node(&self, node: Option<usize>) -> anyhow::Result<()> {
        if let Some(n) = node {
            if n >= self.topology.node_count() {
                anyhow::bail!("cannot pin workers to non-existent node {n}");
            }
        }
        *self.shared.affinity.lock() = self.topology.cores_for(node);
        self.shared.affinity_gen.fetch_add(1, Ordering::Release);
        // Live workers observe the bumped generation at their next dequeue.
        self.shared.pending_cv.notify_all();
        Ok(())
    }
}

thread_local! {
    /// Set inside every pool worker so a pool dropped from one of its own
    /// callbacks detaches instead of joining itself.
    static IN_POOL_WORKER: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let _pending = self.shared.pending.lock();
            self.shared.stop_working.store(true, Ordering::Release);
        }
        self.stop_workers(0);

        if IN_POOL_WORKER.with(std::cell::Cell::get) {
            // The last pool handle was released from a worker's finish
            // callback. Joining would deadlock on the current thread, so
            // signal everything and let the threads run out detached.
            self.shared.stop_vacuum.store(true, Ordering::Release);
            self.shared.pending_cv.notify_all();
            self.shared.zombie_cv.notify_all();
            return;
        }

        {
            let mut workers = self.shared.workers.lock();
            while !workers.is_empty() {
                self.shared.pool_cv.wait(&mut workers);
            }
        }

        {
            let _zombies = self.shared.zombies.lock();
            self.shared.stop_vacuum.store(true, Ordering::Release);
        }
        self.shared.zombie_cv.notify_all();
        if let Some(vacuum) = self.vacuum.lock().take() {
            let _ = vacuum.join();
        }
        debug!(pending = self.shared.pending.lock().len(), "worker pool torn down");
    }
}

fn pin_current(shared: &PoolShared, seq: usize) {
    let cores = shared.affinity.lock();
    if cores.is_empty() {
        return;
    }
    let core = cores[seq % cores.len()];
    if !core_affinity::set_for_current(core) {
        error!(core = core.id, "failed to pin worker thread");
    }
}

fn worker_loop(shared: &Arc<PoolShared>, id: u64) {
    IN_POOL_WORKER.with(|flag| flag.set(true));
    let seq = shared.spawn_seq.fetch_add(1, Ordering::Relaxed);
    pin_current(shared, seq);
    let mut seen_gen = shared.affinity_gen.load(Ordering::Acquire);

    loop {
        let current_gen = shared.affinity_gen.load(Ordering::Acquire);
        if current_gen != seen_gen {
            seen_gen = current_gen;
            pin_current(shared, seq);
        }

        let task = {
            let mut pending = shared.pending.lock();
            while pending.is_empty() && !shared.stop_working.load(Ordering::Acquire) {
                shared.pending_cv.wait(&mut pending);
            }
            if shared.stop_working.load(Ordering::Acquire) && pending.is_empty() {
                break;
            }
            match pending.pop_front() {
                Some(task) => task,
                None => continue,
            }
        };

        let mut task = task;
        let Some(mut op) = task.op.take() else {
            debug!(worker = id, "worker received stop sentinel");
            break;
        };

        shared.busy_workers.fetch_add(1, Ordering::Relaxed);
        task.response = op.run();
        drop(op);
        let finish = shared.on_finish.read().clone();
        if let Some(finish) = finish {
            finish(task);
        }
        shared.busy_workers.fetch_sub(1, Ordering::Relaxed);
    }

    let mut zombies = shared.zombies.lock();
    zombies.push(id);
    drop(zombies);
    shared.zombie_cv.notify_all();
}

fn vacuum_loop(shared: &Arc<PoolShared>) {
    loop {
        {
            let mut zombies = shared.zombies.lock();
            while zombies.is_empty() && !shared.stop_vacuum.load(Ordering::Acquire) {
                shared.zombie_cv.wait(&mut zombies);
            }
            if shared.stop_vacuum.load(Ordering::Acquire) && zombies.is_empty() {
                break;
            }
        }
        cleanup_zombies(shared);
    }
    // Final sweep so shutdown never leaks a joinable thread.
    cleanup_zombies(shared);
}

fn cleanup_zombies(shared: &Arc<PoolShared>) {
    let mut to_join = Vec::new();
    {
        let mut workers = shared.workers.lock();
        let mut zombies = shared.zombies.lock();
        for id in zombies.drain(..) {
            if let Some(handle) = workers.remove(&id) {
                to_join.push(handle);
            }
        }
    }
    // Joining happens without holding any pool lock.
    for handle in to_join {
        let _ = handle.join();
    }
    shared.pool_cv.notify_all();
}
