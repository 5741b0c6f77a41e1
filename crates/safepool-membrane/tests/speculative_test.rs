use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;
use safepool_membrane::{
    CheckQueue, CheckRequest, Runtime, RuntimeConfig, SourceSite, ViolationKind,
};

fn shared_runtime() -> Arc<Runtime> {
    Arc::new(Runtime::quiet(RuntimeConfig::diagnostic().with_dangling(false)).expect("runtime"))
}

#[test]
fn producers_on_many_threads_share_one_queue() {
    let runtime = shared_runtime();
    let pool = Arc::new(RwLock::new(runtime.pool_init(16)));
    let base = runtime.pool_alloc(&mut pool.write(), 64).expect("alloc");
    let queue = Arc::new(CheckQueue::spawn(Arc::clone(&runtime), Arc::clone(&pool), 8).expect("spawn"));

    let producers: Vec<_> = (0..4)
        .map(|t| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..64usize {
                    let request = CheckRequest::Index {
                        src: base,
                        dst: base + i,
                    };
                    assert!(queue.submit(request, SourceSite::UNKNOWN));
                }
                // One bad index per producer.
                let bad = CheckRequest::Index {
                    src: base,
                    dst: base + 128 + t,
                };
                assert!(queue.submit(bad, SourceSite::new(0, Some("worker.c"), 10 + t as u32)));
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer");
    }

    queue.wait_for_completion();
    let found = queue.take_violations();
    assert_eq!(found.len(), 4);
    assert!(found.iter().all(|v| v.kind == ViolationKind::OutOfBounds));
    let mut lines: Vec<_> = found.iter().filter_map(|v| v.source_line).collect();
    lines.sort_unstable();
    assert_eq!(lines, vec![10, 11, 12, 13]);
    assert_eq!(runtime.metrics().index_checks, 4 * 65);
}

#[test]
fn synchronization_point_orders_checks_before_free() {
    let runtime = shared_runtime();
    let pool = Arc::new(RwLock::new(runtime.pool_init(32)));
    let p = runtime.pool_alloc(&mut pool.write(), 32).expect("alloc");
    let queue = CheckQueue::spawn(Arc::clone(&runtime), Arc::clone(&pool), 2).expect("spawn");

    for offset in (0..32).step_by(4) {
        assert!(queue.submit(CheckRequest::Dereference { ptr: p + offset }, SourceSite::UNKNOWN));
    }
    queue.wait_for_completion();
    runtime.pool_free(&mut pool.write(), p);
    assert!(queue.take_violations().is_empty());

    // After the free the same check is a dangling access.
    assert!(queue.submit(CheckRequest::Dereference { ptr: p }, SourceSite::UNKNOWN));
    queue.wait_for_completion();
    let found = queue.take_violations();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].kind, ViolationKind::DanglingPointer);
}

#[test]
fn incomplete_requests_pass_unknown_pointers() {
    let runtime = shared_runtime();
    let pool = Arc::new(RwLock::new(runtime.pool_init(8)));
    let queue = CheckQueue::spawn(Arc::clone(&runtime), pool, 4).expect("spawn");
    let foreign = 0x7100_0000usize;
    assert!(queue.submit(CheckRequest::DereferenceIncomplete { ptr: foreign }, SourceSite::UNKNOWN));
    assert!(queue.submit(
        CheckRequest::IndexIncomplete {
            src: foreign,
            dst: foreign + 8,
        },
        SourceSite::UNKNOWN,
    ));
    queue.wait_for_completion();
    assert!(queue.take_violations().is_empty());
    drop(queue);
    assert_eq!(runtime.metrics().incomplete_passes, 2);
}
