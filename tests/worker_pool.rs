use anyhow::Result;
use gridflow::operators::Operator;
use gridflow::plan::{WorkItem, WorkResponse};
use gridflow::testing::{filter_lt_item, wait_until};
use gridflow::worker::{Task, Topology, WorkerPool};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

struct SleepOp {
    millis: u64,
    tag: u32,
}

impl Operator for SleepOp {
    fn run(&mut self) -> WorkResponse {
        std::thread::sleep(Duration::from_millis(self.millis));
        WorkResponse::success(1, self.tag)
    }
}

fn task(millis: u64, tag: u32) -> Task {
    let item: WorkItem = filter_lt_item(1, tag, "t", "a", 10, "f");
    Task::new(Box::new(SleepOp { millis, tag }), item, 99)
}

#[test]
fn tasks_run_and_finish_in_fifo_order() -> Result<()> {
    let pool = WorkerPool::new(1, None, Topology::detect(1));
    let finished: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&finished);
    pool.set_on_finish(Arc::new(move |t| recorder.lock().push(t.response.item_id)));

    for tag in 1..=4 {
        pool.enqueue(task(1, tag));
    }
    assert!(wait_until(WAIT, || finished.lock().len() == 4));
    assert_eq!(*finished.lock(), vec![1, 2, 3, 4]);
    Ok(())
}

#[test]
fn finalize_task_invokes_on_finish_directly() -> Result<()> {
    let pool = WorkerPool::new(0, None, Topology::detect(1));
    let finished: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&finished);
    pool.set_on_finish(Arc::new(move |t| recorder.lock().push(t.response.item_id)));

    let mut t = task(0, 7);
    t.op = None;
    t.response = WorkResponse::failure(1, 7, "fabricated");
    pool.finalize_task(t);
    assert_eq!(*finished.lock(), vec![7]);
    Ok(())
}

#[test]
fn update_workers_grows_and_shrinks() -> Result<()> {
    let pool = WorkerPool::new(2, None, Topology::detect(1));
    assert_eq!(pool.active_workers(), 2);

    pool.update_workers(4);
    assert_eq!(pool.active_workers(), 4);

    pool.update_workers(1);
    assert_eq!(pool.active_workers(), 1);

    // The remaining worker still serves tasks.
    let finished: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&finished);
    pool.set_on_finish(Arc::new(move |t| recorder.lock().push(t.response.item_id)));
    pool.enqueue(task(1, 1));
    assert!(wait_until(WAIT, || finished.lock().len() == 1));
    Ok(())
}

#[test]
fn full_drain_forwards_queued_tasks() -> Result<()> {
    let pool = WorkerPool::new(1, None, Topology::detect(1));
    let finished: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let forwarded: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    let finish_recorder = Arc::clone(&finished);
    pool.set_on_finish(Arc::new(move |t| {
        finish_recorder.lock().push(t.response.item_id)
    }));
    let forward_recorder = Arc::clone(&forwarded);
    pool.set_on_forward(Arc::new(move |t| {
        forward_recorder
            .lock()
            .push(t.work_item.as_ref().map(|i| i.item_id).unwrap_or(0))
    }));

    // Occupy the single worker, then queue three more tasks.
    pool.enqueue(task(300, 1));
    assert!(wait_until(WAIT, || pool.busy_workers() == 1));
    for tag in 2..=4 {
        pool.enqueue(task(1, tag));
    }

    // Stopping all workers forwards everything still queued.
    pool.stop_workers(0);
    let mut fwd: Vec<u32> = forwarded.lock().clone();
    fwd.sort_unstable();
    assert_eq!(fwd, vec![2, 3, 4]);
    assert_eq!(pool.active_workers(), 0);

    // The in-flight task still finishes; the forwarded ones never run.
    assert!(wait_until(WAIT, || finished.lock().len() == 1));
    assert_eq!(*finished.lock(), vec![1]);
    Ok(())
}

#[test]
fn partial_stop_keeps_queue_intact() -> Result<()> {
    let pool = WorkerPool::new(2, None, Topology::detect(1));
    let forwarded: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let forward_recorder = Arc::clone(&forwarded);
    pool.set_on_forward(Arc::new(move |t| {
        forward_recorder
            .lock()
            .push(t.work_item.as_ref().map(|i| i.item_id).unwrap_or(0))
    }));
    let finished: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let finish_recorder = Arc::clone(&finished);
    pool.set_on_finish(Arc::new(move |t| {
        finish_recorder.lock().push(t.response.item_id)
    }));

    pool.stop_workers(1);
    assert_eq!(pool.active_workers(), 1);
    // No forwarding on a partial stop.
    assert!(forwarded.lock().is_empty());

    pool.enqueue(task(1, 5));
    assert!(wait_until(WAIT, || finished.lock().len() == 1));
    Ok(())
}

#[test]
fn affinity_update_to_invalid_node_fails() -> Result<()> {
    let pool = WorkerPool::new(1, None, Topology::detect(1));
    assert!(pool.set_affinity_to_node(Some(64)).is_err());
    assert!(pool.set_affinity_to_node(Some(0)).is_ok());
    assert!(pool.set_affinity_to_node(None).is_ok());
    Ok(())
}

#[test]
fn topology_splits_cores_into_nodes() -> Result<()> {
    let topology = Topology::detect(2);
    assert_eq!(topology.node_count().min(2), topology.node_count());
    let all = topology.cores_for(None);
    let node0 = topology.cores_for(Some(0));
    assert!(node0.len() <= all.len());
    assert!(topology.cores_for(Some(99)).is_empty());
    Ok(())
}
