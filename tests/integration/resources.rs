//! Graph resources

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use flowtask::WorkerPool;

struct Frame {
    pixels: Vec<AtomicUsize>,
}

#[test]
fn test_resource_lives_until_graph_finishes() {
    let pool = WorkerPool::with_threads(4).unwrap();
    let frame = Arc::new(Frame {
        pixels: (0..64).map(|_| AtomicUsize::new(0)).collect(),
    });
    let weak: Weak<Frame> = Arc::downgrade(&frame);
    let alive_in_last = Arc::new(AtomicBool::new(false));

    let graph = pool.new_graph("frame");
    graph.add_resource(frame);

    let shade = graph.new_task_parallel_for();
    let w = weak.clone();
    shade.job_count(64).func(move |i| {
        if let Some(frame) = w.upgrade() {
            frame.pixels[i].store(i, Ordering::SeqCst);
        }
    });

    let present = graph.new_task();
    let (w, alive) = (weak.clone(), alive_in_last.clone());
    present
        .functor(move || {
            thread::sleep(Duration::from_millis(5));
            let ok = w.upgrade().is_some_and(|frame| {
                frame
                    .pixels
                    .iter()
                    .enumerate()
                    .all(|(i, p)| p.load(Ordering::SeqCst) == i)
            });
            alive.store(ok, Ordering::SeqCst);
        })
        .depends_on(&shade)
        .unwrap();

    graph.run_and_wait().unwrap();
    assert!(alive_in_last.load(Ordering::SeqCst));
    assert!(weak.upgrade().is_none());
}

#[test]
fn test_resource_held_by_caller_is_released_by_graph() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let shared = Arc::new(vec![1u32, 2, 3]);

    let graph = pool.new_graph("keep-alive");
    graph.add_resource(shared.clone()).add_resource(shared.clone());
    assert_eq!(Arc::strong_count(&shared), 3);

    graph.new_task().functor(|| {});
    graph.run_and_wait().unwrap();
    assert_eq!(Arc::strong_count(&shared), 1);
}

#[test]
fn test_nested_graph_resource() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let buffer = Arc::new(AtomicUsize::new(0));
    let weak = Arc::downgrade(&buffer);
    let graph = pool.new_graph("outer");

    let inner = graph.new_task_graph();
    inner.add_resource(buffer);
    for _ in 0..4 {
        let w = weak.clone();
        inner.new_task().functor(move || {
            if let Some(buffer) = w.upgrade() {
                buffer.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let after = graph.new_task();
    let (w, dropped) = (weak.clone(), Arc::new(AtomicBool::new(false)));
    let d = dropped.clone();
    after
        .functor(move || d.store(w.upgrade().is_none(), Ordering::SeqCst))
        .depends_on(&inner)
        .unwrap();

    graph.run_and_wait().unwrap();
    // The inner graph's resource is gone before its successor starts.
    assert!(dropped.load(Ordering::SeqCst));
}

#[test]
fn test_discarded_graph_drops_resources() {
    let pool = WorkerPool::with_threads(1).unwrap();
    let data = Arc::new(String::from("unused"));
    let graph = pool.new_graph("discarded");
    graph.add_resource(data.clone());
    graph.new_task().functor(|| {});

    graph.discard().unwrap();
    assert_eq!(Arc::strong_count(&data), 1);
    assert_eq!(pool.status().arena.live, 0);
}
