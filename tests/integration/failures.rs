//! Failure propagation

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use flowtask::{RunError, TaskError, WorkerPool};

#[test]
fn test_error_reaches_future_and_successors_still_run() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let after = Arc::new(AtomicBool::new(false));
    let sibling = Arc::new(AtomicBool::new(false));
    let graph = pool.new_graph("faulty");

    let broken = graph.new_task();
    broken
        .name("broken")
        .functor_with(|_| Err(anyhow::anyhow!("checksum mismatch")));

    let s = sibling.clone();
    graph
        .new_task()
        .functor(move || s.store(true, Ordering::SeqCst));

    let a = after.clone();
    graph
        .new_task()
        .functor(move || a.store(true, Ordering::SeqCst))
        .depends_on(&broken)
        .unwrap();

    let err = graph.run_and_wait().unwrap_err();
    assert!(after.load(Ordering::SeqCst));
    assert!(sibling.load(Ordering::SeqCst));

    match &err {
        RunError::Failed { run, failures } => {
            assert_eq!(run, "faulty");
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].task_name(), "broken");
            assert!(failures[0].to_string().contains("checksum mismatch"));
        },
        other => panic!("unexpected outcome: {other}"),
    }
    assert_eq!(pool.status().arena.live, 0);
}

#[test]
fn test_panic_is_captured() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let graph = pool.new_graph("panicky");
    graph
        .new_task()
        .name("explodes")
        .functor(|| panic!("kaboom {}", 42));

    let err = graph.run_and_wait().unwrap_err();
    match &err.failures()[0] {
        TaskError::Panicked { task, message } => {
            assert_eq!(task, "explodes");
            assert_eq!(message, "kaboom 42");
        },
        other => panic!("unexpected failure: {other}"),
    }

    // Workers survive the panic.
    let ok = pool.new_graph("after");
    ok.new_task().functor(|| {});
    ok.run_and_wait().unwrap();
}

#[test]
fn test_setup_failure() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let built = Arc::new(AtomicUsize::new(0));
    let graph = pool.new_graph("setup");

    let b = built.clone();
    graph.setup_functor(move |graph| {
        let b = b.clone();
        graph.new_task().functor(move || {
            b.fetch_add(1, Ordering::SeqCst);
        });
        anyhow::bail!("asset missing")
    });

    let err = graph.run_and_wait().unwrap_err();
    assert_eq!(err.failures().len(), 1);
    assert!(matches!(
        &err.failures()[0],
        TaskError::Setup { graph, .. } if graph == "setup"
    ));
    // Children added before the failure still run.
    assert_eq!(built.load(Ordering::SeqCst), 1);
}

#[test]
fn test_all_failures_are_collected() {
    let pool = WorkerPool::with_threads(4).unwrap();
    let graph = pool.new_graph("many");
    for i in 0..10 {
        graph
            .new_task()
            .name(format!("t{i}"))
            .functor_with(move |_| {
                if i % 2 == 0 {
                    anyhow::bail!("even task {i}");
                }
                Ok(())
            });
    }

    let err = graph.run_and_wait().unwrap_err();
    assert_eq!(err.failures().len(), 5);
    assert!(err.to_string().starts_with("run 'many' finished with 5 failed task(s)"));
}

#[test]
fn test_failure_in_one_run_does_not_leak_into_another() {
    let pool = WorkerPool::with_threads(2).unwrap();

    let bad = pool.new_graph("bad");
    bad.new_task().functor_with(|_| anyhow::bail!("nope"));
    let good = pool.new_graph("good");
    good.new_task().functor(|| {});

    let bad = bad.run().unwrap();
    let good = good.run().unwrap();
    assert!(bad.wait().is_err());
    good.wait().unwrap();
}
