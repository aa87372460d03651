//! Dependency ordering

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use flowtask::WorkerPool;
use parking_lot::Mutex;

#[test]
fn test_join_runs_after_both_inputs() {
    let pool = WorkerPool::with_threads(4).unwrap();

    for _ in 0..50 {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = pool.new_graph("abc");

        let a = graph.new_task();
        let l = log.clone();
        a.name("a").functor(move || l.lock().push("a"));

        let b = graph.new_task();
        let l = log.clone();
        b.name("b").functor(move || l.lock().push("b"));

        let c = graph.new_task();
        let l = log.clone();
        c.name("c")
            .functor(move || l.lock().push("c"))
            .depends_on(&a)
            .unwrap()
            .depends_on(&b)
            .unwrap();

        graph.run_and_wait().unwrap();

        let log = log.lock();
        assert_eq!(log.len(), 3);
        assert_eq!(log[2], "c");
    }
}

#[test]
fn test_chain_preserves_order() {
    let pool = WorkerPool::with_threads(4).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let graph = pool.new_graph("chain");

    let mut previous = None;
    for i in 0..32 {
        let task = graph.new_task();
        let l = log.clone();
        task.functor(move || l.lock().push(i));
        if let Some(previous) = &previous {
            task.depends_on(previous).unwrap();
        }
        previous = Some(task);
    }

    graph.run_and_wait().unwrap();
    assert_eq!(*log.lock(), (0..32).collect::<Vec<_>>());
}

#[test]
fn test_wide_join_runs_once() {
    let pool = WorkerPool::with_threads(8).unwrap();

    for _ in 0..20 {
        let runs = Arc::new(AtomicUsize::new(0));
        let finished_inputs = Arc::new(AtomicUsize::new(0));
        let graph = pool.new_graph("fan-in");

        let join = graph.new_task();
        let (r, f) = (runs.clone(), finished_inputs.clone());
        join.functor(move || {
            assert_eq!(f.load(Ordering::SeqCst), 64);
            r.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..64 {
            let input = graph.new_task();
            let f = finished_inputs.clone();
            input.functor(move || {
                f.fetch_add(1, Ordering::SeqCst);
            });
            join.depends_on(&input).unwrap();
        }

        graph.run_and_wait().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_explicit_gate_opened_from_many_threads() {
    let pool = WorkerPool::with_threads(4).unwrap();

    for _ in 0..20 {
        let runs = Arc::new(AtomicUsize::new(0));
        let graph = pool.new_graph("gated");
        let gated = graph.new_task();
        let r = runs.clone();
        gated
            .functor(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .set_explicit_deps_count(8)
            .unwrap();

        let future = graph.run().unwrap();
        thread::scope(|s| {
            for _ in 0..8 {
                let gated = gated.clone();
                s.spawn(move || gated.signal_explicit_dep().unwrap());
            }
        });

        future.wait().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_successor_across_graphs() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let graph = pool.new_graph("outer");

    let first = graph.new_task_graph();
    for i in 0..4 {
        let l = log.clone();
        first.new_task().functor(move || l.lock().push(i));
    }
    let second = graph.new_task_graph();
    let l = log.clone();
    second.new_task().functor(move || l.lock().push(100));
    second.depends_on(&first).unwrap();

    graph.run_and_wait().unwrap();
    let log = log.lock();
    assert_eq!(log.len(), 5);
    assert_eq!(log[4], 100);
}
