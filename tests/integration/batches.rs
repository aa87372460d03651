//! Batches and detached tasks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flowtask::{SchedulerError, WorkerPool};
use parking_lot::Mutex;

#[test]
fn test_enqueue_and_wait() {
    let pool = WorkerPool::with_threads(3).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let batch = pool.new_batch("batch");

    let load = batch.new_task();
    let l = log.clone();
    load.name("load").functor(move || l.lock().push("load"));

    let process = batch.new_task_parallel_for();
    let l = log.clone();
    process
        .name("process")
        .job_count(4)
        .func(move |_| l.lock().push("process"))
        .depends_on(&load)
        .unwrap();

    let store = batch.new_task();
    let l = log.clone();
    store
        .name("store")
        .functor(move || l.lock().push("store"))
        .depends_on(&process)
        .unwrap();

    assert_eq!(batch.len(), 3);
    batch.enqueue_and_wait().unwrap();

    let log = log.lock();
    assert_eq!(log.len(), 6);
    assert_eq!(log[0], "load");
    assert_eq!(log[5], "store");
    assert_eq!(pool.status().arena.live, 0);
}

#[test]
fn test_empty_batch_resolves() {
    let pool = WorkerPool::with_threads(1).unwrap();
    let batch = pool.new_batch("nothing");
    assert!(batch.is_empty());
    let future = batch.enqueue().unwrap();
    assert!(future.is_finished());
    future.wait().unwrap();
}

#[test]
fn test_batch_cycle_rejected() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let batch = pool.new_batch("cyclic");

    let a = batch.new_task();
    let b = batch.new_task();
    let c = batch.new_task();
    for task in [&a, &b, &c] {
        let r = ran.clone();
        task.functor(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
    }
    b.depends_on(&a).unwrap();
    c.depends_on(&b).unwrap();
    a.depends_on(&c).unwrap();

    assert!(matches!(batch.enqueue(), Err(SchedulerError::Cycle(_))));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(pool.status().arena.live, 0);
}

#[test]
fn test_batch_member_graph() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let batch = pool.new_batch("with-graph");

    let graph = batch.new_task_graph();
    let r = ran.clone();
    graph.setup_functor(move |graph| {
        for _ in 0..5 {
            let r = r.clone();
            graph.new_task().functor(move || {
                r.fetch_add(1, Ordering::SeqCst);
            });
        }
        Ok(())
    });
    assert!(matches!(
        graph.run(),
        Err(SchedulerError::NotTopLevel(_))
    ));

    let after = batch.new_task();
    let r = ran.clone();
    after
        .functor(move || {
            assert_eq!(r.load(Ordering::SeqCst), 5);
        })
        .depends_on(&graph)
        .unwrap();

    batch.enqueue_and_wait().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 5);
}

#[test]
fn test_spawned_tasks_extend_the_run() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let l = log.clone();
    let future = pool
        .spawn("parent", move |ctx| {
            let first = ctx.new_task();
            let l1 = l.clone();
            first.name("child").functor(move || l1.lock().push("child"));

            let second = ctx.new_task();
            let l2 = l.clone();
            second
                .name("grandchild")
                .functor(move || l2.lock().push("after child"))
                .depends_on(&first)?;

            l.lock().push("parent");
            Ok(())
        })
        .unwrap();

    future.wait().unwrap();
    assert_eq!(*log.lock(), vec!["parent", "child", "after child"]);
    assert_eq!(pool.status().arena.live, 0);
}

#[test]
fn test_many_detached_tasks() {
    let pool = WorkerPool::with_threads(4).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let futures: Vec<_> = (0..100)
        .map(|i| {
            let h = hits.clone();
            pool.spawn(format!("job-{i}"), move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap()
        })
        .collect();

    for future in futures {
        future.wait().unwrap();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 100);
    assert_eq!(pool.stats().snapshot().runs_completed, 100);
}
