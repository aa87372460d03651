//! Named events

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flowtask::WorkerPool;
use parking_lot::Mutex;

#[test]
fn test_waiter_runs_after_signaling_node() {
    let pool = WorkerPool::with_threads(4).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let graph = pool.new_graph("events");

    let waiter = graph.new_task();
    let l = log.clone();
    waiter
        .functor(move || l.lock().push("waiter"))
        .wait_on_event("uploaded", 3)
        .unwrap();

    let producer = graph.new_task();
    let l = log.clone();
    producer
        .functor(move || {
            thread::sleep(Duration::from_millis(5));
            l.lock().push("producer");
        })
        .signal_event("uploaded", 3)
        .unwrap();

    graph.run_and_wait().unwrap();
    assert_eq!(*log.lock(), vec!["producer", "waiter"]);
}

#[test]
fn test_event_ids_are_distinct() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let graph = pool.new_graph("ids");
    let ran = Arc::new(AtomicBool::new(false));

    let waiter = graph.new_task();
    let r = ran.clone();
    waiter
        .functor(move || r.store(true, Ordering::SeqCst))
        .wait_on_event("frame", 2)
        .unwrap();

    let future = graph.run().unwrap();
    future.signal_event("frame", 1);
    thread::sleep(Duration::from_millis(20));
    assert!(!ran.load(Ordering::SeqCst));
    assert!(!future.is_finished());

    future.signal_event("frame", 2);
    future.wait().unwrap();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn test_signal_is_idempotent() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let graph = pool.new_graph("idempotent");

    for _ in 0..2 {
        let r = runs.clone();
        graph
            .new_task()
            .functor(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .wait_on_event("go", 0)
            .unwrap();
    }

    let future = graph.run().unwrap();
    future.signal_event("go", 0);
    future.signal_event("go", 0);
    future.signal_event("go", 0);
    future.wait().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_late_waiter_sees_earlier_signal() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let late_ran = Arc::new(AtomicBool::new(false));
    let graph = pool.new_graph("late");

    let early = graph.new_task();
    early.functor(|| {}).signal_event("ready", 0).unwrap();

    let spawner = graph.new_task();
    let flag = late_ran.clone();
    spawner
        .functor_with(move |ctx| {
            assert!(ctx.is_event_signaled("ready", 0));
            ctx.new_task()
                .name("late")
                .functor(move || flag.store(true, Ordering::SeqCst))
                .wait_on_event("ready", 0)?;
            Ok(())
        })
        .depends_on(&early)
        .unwrap();

    graph.run_and_wait().unwrap();
    assert!(late_ran.load(Ordering::SeqCst));
}

#[test]
fn test_signal_from_running_functor() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let graph = pool.new_graph("mid-functor");

    let waiter = graph.new_task();
    let l = log.clone();
    waiter
        .functor(move || l.lock().push("waiter"))
        .wait_on_event("half", 7)
        .unwrap();

    let worker = graph.new_task();
    let l = log.clone();
    worker.functor_with(move |ctx| {
        l.lock().push("first half");
        ctx.signal_event("half", 7);
        Ok(())
    });

    graph.run_and_wait().unwrap();
    let log = log.lock();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0], "first half");
}

#[test]
fn test_events_are_scoped_to_their_run() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let second_ran = Arc::new(AtomicBool::new(false));

    let first = pool.new_graph("first");
    first
        .new_task()
        .functor(|| {})
        .wait_on_event("go", 0)
        .unwrap();
    let second = pool.new_graph("second");
    let flag = second_ran.clone();
    second
        .new_task()
        .functor(move || flag.store(true, Ordering::SeqCst))
        .wait_on_event("go", 0)
        .unwrap();

    let first = first.run().unwrap();
    let second = second.run().unwrap();
    first.signal_event("go", 0);
    first.wait().unwrap();

    thread::sleep(Duration::from_millis(20));
    assert!(!second_ran.load(Ordering::SeqCst));

    second.signal_event("go", 0);
    second.wait().unwrap();
    assert!(second_ran.load(Ordering::SeqCst));
}

#[test]
fn test_graph_waits_on_event_as_a_whole() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let graph = pool.new_graph("outer");

    let inner = graph.new_task_graph();
    for _ in 0..3 {
        let r = ran.clone();
        inner.new_task().functor(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
    }
    inner.wait_on_event("open", 0).unwrap();

    let future = graph.run().unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    future.signal_event("open", 0);
    future.wait().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 3);
}
