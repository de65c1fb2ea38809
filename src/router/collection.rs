//! Time-windowed collection of incoming plans.
//!
//! The router batches independently submitted plans: the first plan after
//! an idle period stamps `window_start`, and a timer thread seals the
//! window once `window_duration` has elapsed. Sealing hands the collected
//! plans to the collection's analysis worker (grouping + transfer
//! decisions + dispatch), which runs on its own thread so the receive path
//! never blocks on analysis.

use crate::dag::PlanDag;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// The analysis callback a sealed collection runs, exactly once.
pub type Analysis = Box<dyn FnOnce(Vec<PlanDag>) + Send>;

struct CollectionState {
    dags: Vec<PlanDag>,
    sealed: bool,
    shutdown: bool,
}

struct CollectionShared {
    state: Mutex<CollectionState>,
    cv: Condvar,
}

/// A thread-safe batch of plans with a background analysis worker.
///
/// `add` appends until the collection is sealed; `seal` unblocks the worker
/// which then runs the analysis over everything collected. Sealing twice
/// fails.
pub struct PlanCollection {
    shared: Arc<CollectionShared>,
    worker: Option<JoinHandle<()>>,
}

impl PlanCollection {
    pub fn new(analysis: Analysis) -> Self {
        let shared = Arc::new(CollectionShared {
            state: Mutex::new(CollectionState {
                dags: Vec::new(),
                sealed: false,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || {
            let dags = {
                let mut state = worker_shared.state.lock();
                while !state.sealed {
                    worker_shared.cv.wait(&mut state);
                }
                if state.shutdown {
                    return;
                }
                std::mem::take(&mut state.dags)
            };
            debug!(plans = dags.len(), "analyzing sealed collection");
            analysis(dags);
        });

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Append a plan. Fails once the collection has been sealed.
    pub fn add(&self, dag: PlanDag) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock();
        if state.sealed {
            anyhow::bail!("cannot add plan to a sealed collection");
        }
        state.dags.push(dag);
        Ok(())
    }

    /// Seal the collection, waking the analysis worker. Fails when already
    /// sealed.
    pub fn seal(&self) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock();
        if state.sealed {
            anyhow::bail!("collection is already sealed");
        }
        state.sealed = true;
        drop(state);
        self.shared.cv.notify_one();
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.shared.state.lock().sealed
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().dags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until the analysis worker has finished.
    pub fn join(mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for PlanCollection {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if !state.sealed {
                state.shutdown = true;
                state.sealed = true;
            }
        }
        self.shared.cv.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Builds a fresh collection per window; the router wires the analysis
/// pipeline in here.
pub type CollectionFactory = Box<dyn Fn() -> PlanCollection + Send + Sync>;

struct ManagerState {
    current: Option<PlanCollection>,
    completed: Vec<PlanCollection>,
    window_start: Option<Instant>,
    window_duration: Duration,
    shutdown: bool,
}

struct ManagerShared {
    state: Mutex<ManagerState>,
    timer_cv: Condvar,
    factory: CollectionFactory,
}

/// Owns the "current" collection and the timer that seals it.
pub struct CollectionManager {
    shared: Arc<ManagerShared>,
    timer: Option<JoinHandle<()>>,
}

impl CollectionManager {
    pub fn new(window_duration: Duration, factory: CollectionFactory) -> Self {
        let shared = Arc::new(ManagerShared {
            state: Mutex::new(ManagerState {
                current: None,
                completed: Vec::new(),
                window_start: None,
                window_duration,
                shutdown: false,
            }),
            timer_cv: Condvar::new(),
            factory,
        });

        let timer_shared = Arc::clone(&shared);
        let timer = thread::spawn(move || timer_loop(&timer_shared));

        Self {
            shared,
            timer: Some(timer),
        }
    }

    /// Route a plan into the current window, opening one if needed. The
    /// first plan after idle stamps the window start and arms the timer.
    pub fn add_dag(&self, dag: PlanDag) {
        {
            let mut state = self.shared.state.lock();
            if state.current.is_none() {
                state.current = Some((self.shared.factory)());
            }
            if state.window_start.is_none() {
                state.window_start = Some(Instant::now());
            }
            if let Some(current) = &state.current {
                if let Err(err) = current.add(dag) {
                    tracing::error!(%err, "failed to add plan to current window");
                }
            }
        }
        self.shared.timer_cv.notify_one();
    }

    /// Close the current window immediately.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        close_window(&mut state);
    }

    pub fn completed_count(&self) -> usize {
        self.shared.state.lock().completed.len()
    }

    pub fn set_window_duration(&self, duration: Duration) {
        self.shared.state.lock().window_duration = duration;
    }
}

impl Drop for CollectionManager {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            close_window(&mut state);
        }
        self.shared.timer_cv.notify_one();
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        // Dropping the completed collections joins their workers.
    }
}

fn close_window(state: &mut ManagerState) {
    if let Some(current) = state.current.take() {
        if let Err(err) = current.seal() {
            tracing::error!(%err, "failed to seal window");
        }
        state.completed.push(current);
        state.window_start = None;
    }
}

fn timer_loop(shared: &Arc<ManagerShared>) {
    loop {
        let mut state = shared.state.lock();
        if state.shutdown {
            return;
        }
        match state.window_start {
            None => {
                // Idle: wait until a plan opens a window or we shut down.
                shared.timer_cv.wait(&mut state);
            }
            Some(start) => {
                let deadline = start + state.window_duration;
                let now = Instant::now();
                if now >= deadline {
                    debug!("window elapsed, sealing collection");
                    close_window(&mut state);
                } else {
                    let _ = shared.timer_cv.wait_for(&mut state, deadline - now);
                }
            }
        }
    }
}
