use anyhow::Result;
use gridflow::dag::PlanDag;
use gridflow::router::collection::{CollectionManager, PlanCollection};
use gridflow::testing::{single_filter_plan, wait_until};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn dag(plan_id: u32) -> PlanDag {
    PlanDag::build(single_filter_plan(plan_id, "t", "a", 10), 0, 0)
}

#[test]
fn seal_hands_plans_to_the_analysis_worker() -> Result<()> {
    let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let collection = PlanCollection::new(Box::new(move |dags| {
        recorder.lock().push(dags.len());
    }));

    collection.add(dag(1))?;
    collection.add(dag(2))?;
    assert!(!collection.is_sealed());
    collection.seal()?;
    collection.join();

    assert_eq!(*seen.lock(), vec![2]);
    Ok(())
}

#[test]
fn sealing_twice_fails() -> Result<()> {
    let collection = PlanCollection::new(Box::new(|_| {}));
    collection.seal()?;
    assert!(collection.seal().is_err());
    Ok(())
}

#[test]
fn adding_after_seal_fails() -> Result<()> {
    let collection = PlanCollection::new(Box::new(|_| {}));
    collection.add(dag(1))?;
    collection.seal()?;
    assert!(collection.add(dag(2)).is_err());
    Ok(())
}

#[test]
fn dropping_an_unsealed_collection_skips_analysis() -> Result<()> {
    let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    {
        let collection = PlanCollection::new(Box::new(move |dags| {
            recorder.lock().push(dags.len());
        }));
        collection.add(dag(1))?;
        // Dropped without seal: shutdown, not analysis.
    }
    assert!(seen.lock().is_empty());
    Ok(())
}

#[test]
fn window_seals_after_its_duration() -> Result<()> {
    let analyzed: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&analyzed);
    let manager = CollectionManager::new(
        Duration::from_millis(50),
        Box::new(move || {
            let recorder = Arc::clone(&recorder);
            PlanCollection::new(Box::new(move |dags| {
                recorder.lock().push(dags.len());
            }))
        }),
    );

    manager.add_dag(dag(1));
    manager.add_dag(dag(2));
    assert!(wait_until(Duration::from_secs(2), || {
        analyzed.lock().as_slice() == [2]
    }));
    assert_eq!(manager.completed_count(), 1);

    // A later plan opens a fresh window.
    manager.add_dag(dag(3));
    assert!(wait_until(Duration::from_secs(2), || {
        analyzed.lock().as_slice() == [2, 1]
    }));
    Ok(())
}

#[test]
fn flush_closes_the_window_immediately() -> Result<()> {
    let analyzed: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&analyzed);
    let manager = CollectionManager::new(
        Duration::from_secs(60),
        Box::new(move || {
            let recorder = Arc::clone(&recorder);
            PlanCollection::new(Box::new(move |dags| {
                recorder.lock().push(dags.len());
            }))
        }),
    );

    manager.add_dag(dag(1));
    manager.flush();
    assert!(wait_until(Duration::from_secs(2), || {
        analyzed.lock().as_slice() == [1]
    }));
    Ok(())
}

#[test]
fn shutdown_seals_the_open_window() -> Result<()> {
    let analyzed: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&analyzed);
    {
        let manager = CollectionManager::new(
            Duration::from_secs(60),
            Box::new(move || {
                let recorder = Arc::clone(&recorder);
                PlanCollection::new(Box::new(move |dags| {
                    recorder.lock().push(dags.len());
                }))
            }),
        );
        manager.add_dag(dag(1));
        // Dropping the manager seals and joins.
    }
    assert_eq!(analyzed.lock().as_slice(), [1]);
    Ok(())
}
