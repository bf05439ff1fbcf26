/// 并发测试模块
/// 测试多生产者多消费者队列、并发读写快照以及回收安全性
use crate::config::{MultiAccessWorkload, QueueWorkload};
use crate::harness::{self, Checksummed};
use crate::{Backoff, BoundedQueue, EpochReclaimer, MultiAccess, UnboundedQueue};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;

/// 测试1: 容量 4，2 个生产者各 1000 个元素，2 个消费者，元素不丢失不重复；
/// 只有 4 个槽位全部被占用时入队才会返回 Full
#[test]
fn test_two_producers_two_consumers_small_capacity() {
    const CAPACITY: usize = 4;
    const PER_PRODUCER: u64 = 1000;

    let queue = BoundedQueue::new(CAPACITY).unwrap();
    let consumed = AtomicUsize::new(0);
    // 已开始入队、尚未被取出的元素数，以及它的历史最大值
    let occupancy = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);
    let full_seen = AtomicUsize::new(0);

    let taken: Vec<Vec<u64>> = thread::scope(|s| {
        for producer in 0..2u64 {
            let queue = &queue;
            let occupancy = &occupancy;
            let peak = &peak;
            let full_seen = &full_seen;
            s.spawn(move || {
                let backoff = Backoff::new();
                for i in 0..PER_PRODUCER {
                    let mut value = producer * PER_PRODUCER + i;
                    loop {
                        let before = occupancy.fetch_add(1, Ordering::SeqCst);
                        peak.fetch_max(before + 1, Ordering::SeqCst);
                        match queue.enqueue(value) {
                            Ok(()) => break,
                            Err(full) => {
                                occupancy.fetch_sub(1, Ordering::SeqCst);
                                full_seen.fetch_add(1, Ordering::Relaxed);
                                value = full.into_inner();
                                backoff.snooze();
                            }
                        }
                    }
                    backoff.reset();
                }
            });
        }

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let queue = &queue;
                let consumed = &consumed;
                let occupancy = &occupancy;
                s.spawn(move || {
                    let mut taken = Vec::new();
                    while consumed.load(Ordering::Acquire) < 2 * PER_PRODUCER as usize {
                        if let Ok(value) = queue.dequeue() {
                            occupancy.fetch_sub(1, Ordering::SeqCst);
                            taken.push(value);
                            consumed.fetch_add(1, Ordering::AcqRel);
                        } else {
                            thread::yield_now();
                        }
                    }
                    taken
                })
            })
            .collect();

        consumers.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut all: Vec<u64> = taken.iter().flatten().copied().collect();
    assert_eq!(all.len(), 2000);
    all.sort_unstable();
    assert_eq!(all, (0..2000).collect::<Vec<_>>());

    // 每个消费者看到的同一生产者的元素保持生产顺序
    for consumer in &taken {
        for producer in 0..2 {
            let seen: Vec<_> = consumer
                .iter()
                .filter(|v| **v / PER_PRODUCER == producer)
                .collect();
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }
    }

    // Full 出现的那一刻，4 个元素占满槽位且发起者自身也已计入，
    // 所以计数器至少曾达到 CAPACITY + 1
    if full_seen.load(Ordering::Relaxed) > 0 {
        assert!(
            peak.load(Ordering::SeqCst) > CAPACITY,
            "Full reported while fewer than {CAPACITY} slots were occupied"
        );
    }
    assert_eq!(occupancy.load(Ordering::SeqCst), 0);
    assert!(queue.is_empty());
}

/// 测试2: 满队列下的竞争不会让长度超过容量
#[test]
fn test_len_never_exceeds_capacity() {
    let queue = BoundedQueue::new(8).unwrap();
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..3 {
            let queue = &queue;
            let stop = &stop;
            s.spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let _ = queue.enqueue(1u8);
                }
            });
        }
        let queue = &queue;
        let stop = &stop;
        s.spawn(move || {
            for _ in 0..10_000 {
                assert!(queue.len() <= queue.capacity());
                let _ = queue.dequeue();
            }
            stop.store(true, Ordering::Relaxed);
        });
    });
}

/// 测试3: 通过测试工具运行的队列负载保持一致
#[test]
fn test_queue_workload_is_consistent() {
    let workload = QueueWorkload {
        capacity: 16,
        producers: 3,
        consumers: 2,
        items_per_producer: 5_000,
    };
    let comparison = harness::compare_queues(&workload).unwrap();
    assert!(comparison.ours.is_consistent(), "{:?}", comparison.ours);
    assert!(comparison.reference.is_consistent());
    assert_eq!(comparison.ours.items, 15_000);
}

/// 测试4: 并发读写时读者总是看到完整快照
#[test]
fn test_readers_never_see_torn_snapshot() {
    let report = harness::run_multiaccess_workload(&MultiAccessWorkload {
        readers: 4,
        writers: 2,
        writes_per_writer: 2_000,
        reads_per_reader: 20_000,
    });
    assert_eq!(report.torn_reads, 0);
    assert_eq!(report.version_regressions, 0);
    assert_eq!(report.final_version, 4_000);
    assert_eq!(report.retired_after_sweep, 0);
}

const POISON: u64 = 0xDEAD_BEEF_DEAD_BEEF;

/// Overwrites itself with a marker when dropped, so a read of reclaimed memory shows up.
struct Poisoned {
    value: AtomicU64,
}

impl Drop for Poisoned {
    fn drop(&mut self) {
        self.value.store(POISON, Ordering::SeqCst);
    }
}

/// 测试5: 读者在持有视图期间绝不会观察到已被释放的快照
#[test]
fn test_reclamation_never_frees_observed_snapshot() {
    let shared = MultiAccess::new(Poisoned {
        value: AtomicU64::new(0),
    });
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..4 {
            let shared = &shared;
            let done = &done;
            s.spawn(move || {
                let accessor = shared.accessor();
                while !done.load(Ordering::Acquire) {
                    let view = accessor.read();
                    let first = view.value.load(Ordering::SeqCst);
                    // 在视图存活期间多次读取，给回收器留出窗口
                    for _ in 0..8 {
                        std::hint::spin_loop();
                        let again = view.value.load(Ordering::SeqCst);
                        assert_ne!(again, POISON);
                        assert_eq!(again, first);
                    }
                }
            });
        }

        let shared = &shared;
        let done = &done;
        s.spawn(move || {
            let accessor = shared.accessor();
            for i in 1..=5_000 {
                accessor.write(Poisoned {
                    value: AtomicU64::new(i),
                });
            }
            done.store(true, Ordering::Release);
        });
    });

    let accessor = shared.accessor();
    assert_eq!(accessor.read().value.load(Ordering::SeqCst), 5_000);
}

/// 测试6: 并发 update 不丢失任何增量
#[test]
fn test_concurrent_update_loses_no_increment() {
    let shared = MultiAccess::new(0u64);

    thread::scope(|s| {
        for _ in 0..4 {
            let shared = &shared;
            s.spawn(move || {
                let accessor = shared.accessor();
                for _ in 0..1_000 {
                    accessor.update(|v| v + 1);
                }
            });
        }
    });

    let accessor = shared.accessor();
    let view = accessor.read();
    assert_eq!(*view, 4_000);
    assert_eq!(view.version(), 4_000);
}

/// 测试7: 并发写入的版本号互不相同且连续
#[test]
fn test_concurrent_write_versions_are_unique() {
    let shared = MultiAccess::new(Checksummed::new(0));

    let versions: Vec<Vec<u64>> = thread::scope(|s| {
        let handles: Vec<_> = (0..4u64)
            .map(|writer| {
                let shared = &shared;
                s.spawn(move || {
                    let accessor = shared.accessor();
                    (0..500)
                        .map(|i| accessor.write(Checksummed::new(writer * 1_000 + i)))
                        .collect::<Vec<u64>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let unique: HashSet<u64> = versions.iter().flatten().copied().collect();
    assert_eq!(unique.len(), 2_000);
    assert_eq!(unique.iter().min(), Some(&1));
    assert_eq!(unique.iter().max(), Some(&2_000));
    for per_writer in &versions {
        assert!(per_writer.windows(2).all(|w| w[0] < w[1]));
    }
}

/// 测试8: 所有线程结束并最终清扫后没有泄漏
#[test]
fn test_no_leak_after_concurrent_writes() {
    let live = Arc::new(AtomicUsize::new(0));

    struct Tracked(Arc<AtomicUsize>);
    impl Tracked {
        fn new(live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Tracked(Arc::clone(live))
        }
    }
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    let reclaimer = EpochReclaimer::builder().auto_reclaim_threshold(8).build();
    let shared = MultiAccess::with_reclaimer(Tracked::new(&live), reclaimer.clone());

    thread::scope(|s| {
        for _ in 0..3 {
            let shared = &shared;
            let live = &live;
            s.spawn(move || {
                let accessor = shared.accessor();
                for _ in 0..1_000 {
                    accessor.write(Tracked::new(live));
                    let _view = accessor.read();
                }
            });
        }
    });

    reclaimer.advance_epoch();
    assert_eq!(reclaimer.retired_count(), 0);
    // 只剩当前快照
    assert_eq!(live.load(Ordering::SeqCst), 1);

    drop(shared);
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

/// 测试9: 无界队列，4 个生产者 4 个消费者，跨越大量块，元素不丢失不重复且保持每个生产者的顺序
#[test]
fn test_unbounded_many_producers_many_consumers() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 5_000;
    const TOTAL: usize = (PRODUCERS * PER_PRODUCER) as usize;

    let queue = UnboundedQueue::new();
    let consumed = AtomicUsize::new(0);

    let taken: Vec<Vec<u64>> = thread::scope(|s| {
        for producer in 0..PRODUCERS {
            let queue = &queue;
            s.spawn(move || {
                let handle = queue.handle();
                for i in 0..PER_PRODUCER {
                    handle.enqueue(producer * PER_PRODUCER + i);
                }
            });
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = &queue;
                let consumed = &consumed;
                s.spawn(move || {
                    let handle = queue.handle();
                    let mut taken = Vec::new();
                    while consumed.load(Ordering::Acquire) < TOTAL {
                        if let Ok(value) = handle.dequeue() {
                            taken.push(value);
                            consumed.fetch_add(1, Ordering::AcqRel);
                        } else {
                            thread::yield_now();
                        }
                    }
                    taken
                })
            })
            .collect();

        consumers.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut all: Vec<u64> = taken.iter().flatten().copied().collect();
    assert_eq!(all.len(), TOTAL);
    all.sort_unstable();
    assert_eq!(all, (0..TOTAL as u64).collect::<Vec<_>>());

    for consumer in &taken {
        for producer in 0..PRODUCERS {
            let seen: Vec<_> = consumer
                .iter()
                .filter(|v| **v / PER_PRODUCER == producer)
                .collect();
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }
    }

    assert!(queue.is_empty());
    queue.reclaimer().advance_epoch();
    assert_eq!(queue.reclaimer().retired_count(), 0);
}

/// 测试10: 无界队列并发使用后，元素与块全部释放
#[test]
fn test_unbounded_no_leak_after_concurrent_use() {
    let live = Arc::new(AtomicUsize::new(0));

    struct Tracked(Arc<AtomicUsize>);
    impl Tracked {
        fn new(live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Tracked(Arc::clone(live))
        }
    }
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    let reclaimer = EpochReclaimer::builder().auto_reclaim_threshold(4).build();
    let queue = UnboundedQueue::with_reclaimer(reclaimer.clone()).advance_on_retire(false);

    thread::scope(|s| {
        for _ in 0..3 {
            let queue = &queue;
            let live = &live;
            s.spawn(move || {
                let handle = queue.handle();
                for round in 0..2_000 {
                    handle.enqueue(Tracked::new(live));
                    if round % 3 != 0 {
                        drop(handle.dequeue());
                    }
                }
            });
        }
    });

    // 剩下的元素仍在队列中
    assert_eq!(live.load(Ordering::SeqCst), queue.len());

    drop(queue);
    reclaimer.advance_epoch();
    assert_eq!(live.load(Ordering::SeqCst), 0);
    assert_eq!(reclaimer.retired_count(), 0);
}
