//! Loom-based concurrency tests
//!
//! These tests use the `loom` library to exhaustively check all possible
//! thread interleavings of the queue, the reclaimer and the multi-access
//! container, and detect data races, use-after-free and ordering bugs.
//!
//! None of the scenarios retry in a loop: loom explores every schedule of a
//! bounded number of operations and the assertions cover every outcome.
//!
//! Run with: `cargo test --features loom --test loom_tests --release`

#![cfg(feature = "loom")]

use loom::sync::Arc;
use loom::sync::atomic::{AtomicUsize, Ordering};
use loom::thread;
use sprawl::{BoundedQueue, Empty, EpochReclaimer, Full, MultiAccess, UnboundedQueue};

/// Counts drops with a loom atomic so the model tracks the accesses.
struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Test: two producers race for the single slot; exactly one wins
#[test]
fn loom_queue_producers_race_for_last_slot() {
    loom::model(|| {
        let queue = Arc::new(BoundedQueue::new(1).unwrap());

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.enqueue(i).is_ok())
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);

        let value = queue.dequeue().unwrap();
        assert!(value == 0 || value == 1);
        assert_eq!(queue.dequeue(), Err(Empty));
    });
}

/// Test: a consumer racing one producer sees either nothing or the whole value
#[test]
fn loom_queue_producer_consumer_handoff() {
    loom::model(|| {
        let queue = Arc::new(BoundedQueue::new(2).unwrap());

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                queue.enqueue(String::from("payload")).unwrap();
            })
        };

        let taken = match queue.dequeue() {
            Ok(value) => {
                assert_eq!(value, "payload");
                true
            }
            Err(Empty) => false,
        };

        producer.join().unwrap();

        if taken {
            assert!(queue.is_empty());
        } else {
            assert_eq!(queue.dequeue().unwrap(), "payload");
        }
    });
}

/// Test: two consumers never take the same element
#[test]
fn loom_queue_consumers_do_not_duplicate() {
    loom::model(|| {
        let queue = Arc::new(BoundedQueue::new(2).unwrap());
        queue.enqueue(1u32).unwrap();
        queue.enqueue(2u32).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.dequeue().ok())
            })
            .collect();

        let mut taken: Vec<u32> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        taken.sort_unstable();
        assert_eq!(taken, vec![1, 2]);
    });
}

/// Test: a full queue with a concurrent consumer wraps around correctly
#[test]
fn loom_queue_wraparound_with_concurrent_consumer() {
    loom::model(|| {
        let queue = Arc::new(BoundedQueue::new(1).unwrap());
        queue.enqueue(10u32).unwrap();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.dequeue())
        };

        let second = queue.enqueue(20u32);

        let first = consumer.join().unwrap();
        assert_eq!(first, Ok(10));
        match second {
            Ok(()) => assert_eq!(queue.dequeue(), Ok(20)),
            Err(Full(value)) => {
                assert_eq!(value, 20);
                assert!(queue.is_empty());
            }
        }
    });
}

/// Test: a retired object is not freed while a concurrent guard may observe it
#[test]
fn loom_reclaimer_guard_blocks_free() {
    loom::model(|| {
        let reclaimer = EpochReclaimer::builder().auto_reclaim_threshold(None).build();
        let drops = Arc::new(AtomicUsize::new(0));

        let local = reclaimer.register();
        let guard = local.enter();

        let sweeper = {
            let reclaimer = reclaimer.clone();
            let drops = Arc::clone(&drops);
            thread::spawn(move || {
                reclaimer.retire(Box::new(DropCounter(drops)));
                reclaimer.advance_epoch()
            })
        };

        let freed = sweeper.join().unwrap();
        assert_eq!(freed, 0);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(guard);
        reclaimer.advance_epoch();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    });
}

/// Test: concurrent sweeps free each retired object exactly once
#[test]
fn loom_reclaimer_concurrent_sweeps() {
    loom::model(|| {
        let reclaimer = EpochReclaimer::builder().auto_reclaim_threshold(None).build();
        let drops = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let reclaimer = reclaimer.clone();
                let drops = Arc::clone(&drops);
                thread::spawn(move || {
                    reclaimer.retire(Box::new(DropCounter(drops)));
                    reclaimer.advance_epoch();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // A sweep that lost the lock may have left work behind.
        reclaimer.advance_epoch();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert_eq!(reclaimer.retired_count(), 0);
    });
}

/// Test: a reader racing a writer sees the old or the new snapshot, both intact
#[test]
fn loom_multiaccess_reader_writer() {
    loom::model(|| {
        let shared = Arc::new(MultiAccess::new(String::from("old")));

        let reader = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let accessor = shared.accessor();
                let view = accessor.read();
                match view.version() {
                    0 => assert_eq!(&*view, "old"),
                    1 => assert_eq!(&*view, "new"),
                    other => panic!("unexpected version {other}"),
                }
            })
        };

        {
            let accessor = shared.accessor();
            assert_eq!(accessor.write(String::from("new")), 1);
        }

        reader.join().unwrap();
    });
}

/// Test: two writers publish versions 1 and 2 without losing either
#[test]
fn loom_multiaccess_two_writers() {
    loom::model(|| {
        let shared = Arc::new(MultiAccess::new(0u32));

        let handles: Vec<_> = (1..=2)
            .map(|value| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || shared.accessor().write(value))
            })
            .collect();

        let mut versions: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        versions.sort_unstable();
        assert_eq!(versions, vec![1, 2]);

        let accessor = shared.accessor();
        let view = accessor.read();
        assert_eq!(view.version(), 2);
        assert!(*view == 1 || *view == 2);
    });
}

/// Test: compare_and_write lets exactly one of two racing writers through
#[test]
fn loom_multiaccess_compare_and_write_race() {
    loom::model(|| {
        let shared = Arc::new(MultiAccess::new(0u32));

        let handles: Vec<_> = (1..=2)
            .map(|value| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || shared.accessor().compare_and_write(0, value).is_ok())
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);

        let accessor = shared.accessor();
        assert_eq!(accessor.read().version(), 1);
    });
}

/// Test: every replaced snapshot is eventually freed, and only once
#[test]
fn loom_multiaccess_snapshots_are_reclaimed() {
    loom::model(|| {
        let drops = Arc::new(AtomicUsize::new(0));
        let shared = Arc::new(MultiAccess::new(DropCounter(Arc::clone(&drops))));

        let writer = {
            let shared = Arc::clone(&shared);
            let drops = Arc::clone(&drops);
            thread::spawn(move || {
                shared.accessor().write(DropCounter(drops));
            })
        };

        {
            let accessor = shared.accessor();
            let _view = accessor.read();
        }

        writer.join().unwrap();
        shared.reclaimer().advance_epoch();
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        drop(shared);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    });
}

/// Test: two producers crossing a block boundary lose nothing and keep their order
#[test]
fn loom_unbounded_producers_cross_block() {
    loom::model(|| {
        let queue = Arc::new(UnboundedQueue::new());
        {
            // Leave one free slot in the first block so the racing pushes cross it.
            let handle = queue.handle();
            handle.enqueue(0u32);
            handle.enqueue(1u32);
        }

        let producers: Vec<_> = (0..2u32)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let handle = queue.handle();
                    handle.enqueue(10 + p);
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let handle = queue.handle();
        let mut taken: Vec<u32> = std::iter::from_fn(|| handle.dequeue().ok()).collect();
        assert_eq!(&taken[..2], &[0, 1]);
        taken.sort_unstable();
        assert_eq!(taken, vec![0, 1, 10, 11]);
    });
}

/// Test: a consumer draining a block while a producer fills the next one
#[test]
fn loom_unbounded_consumer_retires_block_under_producer() {
    loom::model(|| {
        let reclaimer = EpochReclaimer::builder().auto_reclaim_threshold(None).build();
        let drops = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(UnboundedQueue::with_reclaimer(reclaimer.clone()));
        {
            let handle = queue.handle();
            for _ in 0..2 {
                handle.enqueue(DropCounter(Arc::clone(&drops)));
            }
        }

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let handle = queue.handle();
                (0..3).filter(|_| handle.dequeue().is_ok()).count()
            })
        };

        {
            let handle = queue.handle();
            handle.enqueue(DropCounter(Arc::clone(&drops)));
            handle.enqueue(DropCounter(Arc::clone(&drops)));
        }

        let taken = consumer.join().unwrap();
        assert!((2..=3).contains(&taken));
        assert_eq!(drops.load(Ordering::SeqCst), taken);

        drop(queue);
        reclaimer.advance_epoch();
        assert_eq!(drops.load(Ordering::SeqCst), 4);
        assert_eq!(reclaimer.retired_count(), 0);
    });
}
