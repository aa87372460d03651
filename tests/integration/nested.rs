//! Nested graphs and setup functors

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flowtask::{TaskGraph, WorkerPool};
use parking_lot::Mutex;

#[test]
fn test_setup_functor_builds_leaves_and_join() {
    let pool = WorkerPool::with_threads(4).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let graph = pool.new_graph("dynamic");

    let l = log.clone();
    graph.setup_functor(move |graph| {
        let left = graph.new_task();
        let l1 = l.clone();
        left.name("left").functor(move || l1.lock().push("left"));

        let right = graph.new_task();
        let l2 = l.clone();
        right.name("right").functor(move || l2.lock().push("right"));

        let join = graph.new_task();
        let l3 = l.clone();
        join.name("join")
            .functor(move || l3.lock().push("join"))
            .depends_on(&left)?
            .depends_on(&right)?;
        Ok(())
    });
    assert_eq!(graph.child_count(), 0);

    graph.run_and_wait().unwrap();
    let log = log.lock();
    assert_eq!(log.len(), 3);
    assert_eq!(log[2], "join");
}

#[test]
fn test_outer_successor_waits_for_whole_subgraph() {
    let pool = WorkerPool::with_threads(4).unwrap();
    let inner_done = Arc::new(AtomicUsize::new(0));
    let seen_by_successor = Arc::new(AtomicUsize::new(usize::MAX));
    let graph = pool.new_graph("outer");

    let inner = graph.new_task_graph();
    let d = inner_done.clone();
    inner.name("inner").setup_functor(move |inner| {
        for _ in 0..3 {
            let d = d.clone();
            inner.new_task().functor_with(move |ctx| {
                // Spawned work belongs to the inner graph as well.
                let d2 = d.clone();
                ctx.new_task().functor(move || {
                    d2.fetch_add(1, Ordering::SeqCst);
                });
                d.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        Ok(())
    });

    let successor = graph.new_task();
    let (d, seen) = (inner_done.clone(), seen_by_successor.clone());
    successor
        .functor(move || seen.store(d.load(Ordering::SeqCst), Ordering::SeqCst))
        .depends_on(&inner)
        .unwrap();

    graph.run_and_wait().unwrap();
    assert_eq!(seen_by_successor.load(Ordering::SeqCst), 6);
}

fn build_level(
    graph: &TaskGraph,
    depth: usize,
    counter: &Arc<AtomicUsize>,
) {
    let c = counter.clone();
    graph.new_task().functor(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    if depth > 0 {
        build_level(&graph.new_task_graph(), depth - 1, counter);
    }
}

#[test]
fn test_deep_nesting() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let graph = pool.new_graph("deep");
    build_level(&graph, 16, &counter);

    graph.run_and_wait().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 17);
    assert_eq!(pool.status().arena.live, 0);
}

#[test]
fn test_nested_setup_functors() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let graph = pool.new_graph("levels");

    let c = counter.clone();
    graph.setup_functor(move |outer| {
        let inner = outer.new_task_graph();
        let c = c.clone();
        inner.setup_functor(move |inner| {
            for _ in 0..4 {
                let c = c.clone();
                inner.new_task().functor(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                });
            }
            Ok(())
        });
        Ok(())
    });

    graph.run_and_wait().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 4);
}

#[test]
fn test_empty_graphs_finish() {
    let pool = WorkerPool::with_threads(1).unwrap();
    let graph = pool.new_graph("empty");
    graph.run_and_wait().unwrap();

    let outer = pool.new_graph("outer");
    outer.new_task_graph();
    outer.new_task_graph();
    outer.run_and_wait().unwrap();
}

#[test]
fn test_wait_from_inside_a_task() {
    let pool = Arc::new(WorkerPool::with_threads(1).unwrap());
    let inner_ran = Arc::new(AtomicUsize::new(0));

    let p = pool.clone();
    let r = inner_ran.clone();
    let outer = pool.new_graph("outer");
    outer.new_task().functor_with(move |_| {
        // The only worker helps instead of blocking on itself.
        let inner = p.new_graph("inner");
        let r = r.clone();
        inner.new_task().functor(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        inner.run_and_wait()?;
        Ok(())
    });

    outer.run_and_wait().unwrap();
    assert_eq!(inner_ran.load(Ordering::SeqCst), 1);
}
