//! Load and differential harness for the queue and the multi-access container.
//!
//! The harness is a plain consumer of the public API: it drives the primitives from
//! several threads, measures throughput, and checks the observable guarantees
//! (nothing lost, nothing duplicated, per-producer order, no torn snapshot).
//! Queue runs can be repeated on `crossbeam_queue::ArrayQueue` to compare against a
//! reference implementation under the same load.

use crate::config::{MultiAccessWorkload, QueueWorkload};
use crate::error::InvalidCapacity;
use crate::{Backoff, BoundedQueue, EpochReclaimer, MultiAccess};
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Why a workload could not be run.
#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error(transparent)]
    InvalidCapacity(#[from] InvalidCapacity),

    #[error("{items} items would be produced but no consumer thread is configured")]
    NoConsumers { items: usize },

    /// Items are tagged as `producer << 32 | seq`, so both must fit in 32 bits,
    /// and the total must fit in `usize`.
    #[error("{producers} producers x {items_per_producer} items cannot be tagged uniquely")]
    TooManyItems {
        producers: usize,
        items_per_producer: usize,
    },
}

/// The operations the queue harness needs, so one driver runs every implementation.
pub trait ConcurrentQueue<T>: Send + Sync + Sized {
    /// Label used in reports.
    const NAME: &'static str;

    fn with_capacity(capacity: usize) -> Result<Self, InvalidCapacity>;

    fn try_push(&self, value: T) -> Result<(), T>;

    fn try_pop(&self) -> Option<T>;
}

impl<T: Send> ConcurrentQueue<T> for BoundedQueue<T> {
    const NAME: &'static str = "sprawl::BoundedQueue";

    fn with_capacity(capacity: usize) -> Result<Self, InvalidCapacity> {
        BoundedQueue::new(capacity)
    }

    fn try_push(&self, value: T) -> Result<(), T> {
        self.enqueue(value).map_err(|full| full.into_inner())
    }

    fn try_pop(&self) -> Option<T> {
        self.dequeue().ok()
    }
}

impl<T: Send> ConcurrentQueue<T> for ArrayQueue<T> {
    const NAME: &'static str = "crossbeam_queue::ArrayQueue";

    fn with_capacity(capacity: usize) -> Result<Self, InvalidCapacity> {
        if capacity == 0 {
            return Err(InvalidCapacity {
                requested: capacity,
            });
        }
        Ok(ArrayQueue::new(capacity))
    }

    fn try_push(&self, value: T) -> Result<(), T> {
        self.push(value)
    }

    fn try_pop(&self) -> Option<T> {
        self.pop()
    }
}

/// Outcome of one queue run.
#[derive(Debug, Clone)]
pub struct QueueReport {
    pub implementation: &'static str,
    pub items: usize,
    pub elapsed: Duration,
    /// Enqueue attempts rejected as full.
    pub full_retries: usize,
    /// Dequeue attempts rejected as empty.
    pub empty_retries: usize,
    pub duplicates: usize,
    pub missing: usize,
    /// Times a consumer saw a producer's items out of that producer's order.
    pub order_violations: usize,
}

impl QueueReport {
    /// Items moved through the queue per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return f64::INFINITY;
        }
        self.items as f64 / secs
    }

    /// No loss, no duplication, per-producer order preserved.
    pub fn is_consistent(&self) -> bool {
        self.duplicates == 0 && self.missing == 0 && self.order_violations == 0
    }
}

/// Both implementations run on the same workload.
#[derive(Debug, Clone)]
pub struct QueueComparison {
    pub ours: QueueReport,
    pub reference: QueueReport,
}

impl QueueComparison {
    /// Throughput of ours relative to the reference (> 1.0 means faster).
    pub fn speedup(&self) -> f64 {
        self.ours.throughput() / self.reference.throughput()
    }
}

/// Producers and per-producer sequence numbers each get 32 bits of a tag.
const TAG_FIELD_LIMIT: u64 = 1 << 32;

/// Total item count, if every `(producer, seq)` pair gets a distinct tag.
fn tagged_total(producers: usize, items_per_producer: usize) -> Result<usize, WorkloadError> {
    let fits =
        producers as u64 <= TAG_FIELD_LIMIT && items_per_producer as u64 <= TAG_FIELD_LIMIT;
    producers
        .checked_mul(items_per_producer)
        .filter(|_| fits)
        .ok_or(WorkloadError::TooManyItems {
            producers,
            items_per_producer,
        })
}

#[inline]
fn tag(producer: usize, seq: usize) -> u64 {
    ((producer as u64) << 32) | seq as u64
}

#[inline]
fn untag(value: u64) -> (usize, usize) {
    ((value >> 32) as usize, (value & 0xFFFF_FFFF) as usize)
}

/// Run `workload` on queue implementation `Q`.
///
/// Each producer enqueues `items_per_producer` distinct tagged values, retrying with
/// [`Backoff`] while the queue is full. Consumers dequeue until every item has been
/// taken. The returned report counts retries and verifies the dequeued multiset.
pub fn run_queue_workload<Q>(workload: &QueueWorkload) -> Result<QueueReport, WorkloadError>
where
    Q: ConcurrentQueue<u64>,
{
    let total = tagged_total(workload.producers, workload.items_per_producer)?;
    let queue = Q::with_capacity(workload.capacity)?;
    if total > 0 && workload.consumers == 0 {
        return Err(WorkloadError::NoConsumers { items: total });
    }

    let consumed = AtomicUsize::new(0);
    let full_retries = AtomicUsize::new(0);
    let empty_retries = AtomicUsize::new(0);

    let start = Instant::now();
    let per_consumer: Vec<Vec<u64>> = thread::scope(|s| {
        for producer in 0..workload.producers {
            let queue = &queue;
            let full_retries = &full_retries;
            s.spawn(move || {
                let backoff = Backoff::new();
                let mut rejected = 0;
                for seq in 0..workload.items_per_producer {
                    let mut value = tag(producer, seq);
                    loop {
                        match queue.try_push(value) {
                            Ok(()) => break,
                            Err(back) => {
                                value = back;
                                rejected += 1;
                                backoff.snooze();
                            }
                        }
                    }
                    backoff.reset();
                }
                full_retries.fetch_add(rejected, Ordering::Relaxed);
            });
        }

        let consumers: Vec<_> = (0..workload.consumers)
            .map(|_| {
                let queue = &queue;
                let consumed = &consumed;
                let empty_retries = &empty_retries;
                s.spawn(move || {
                    let backoff = Backoff::new();
                    let mut taken = Vec::new();
                    let mut rejected = 0;
                    while consumed.load(Ordering::Acquire) < total {
                        match queue.try_pop() {
                            Some(value) => {
                                taken.push(value);
                                consumed.fetch_add(1, Ordering::AcqRel);
                                backoff.reset();
                            }
                            None => {
                                rejected += 1;
                                backoff.snooze();
                            }
                        }
                    }
                    empty_retries.fetch_add(rejected, Ordering::Relaxed);
                    taken
                })
            })
            .collect();

        consumers
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(taken) => taken,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    });
    let elapsed = start.elapsed();

    let mut seen = vec![false; total];
    let mut duplicates = 0;
    let mut order_violations = 0;
    for taken in &per_consumer {
        let mut last_seq: Vec<Option<usize>> = vec![None; workload.producers];
        for &value in taken {
            let (producer, seq) = untag(value);
            if last_seq[producer].is_some_and(|last| last >= seq) {
                order_violations += 1;
            }
            last_seq[producer] = Some(seq);

            let index = producer * workload.items_per_producer + seq;
            if std::mem::replace(&mut seen[index], true) {
                duplicates += 1;
            }
        }
    }
    let missing = seen.iter().filter(|taken| !**taken).count();

    let report = QueueReport {
        implementation: Q::NAME,
        items: total,
        elapsed,
        full_retries: full_retries.into_inner(),
        empty_retries: empty_retries.into_inner(),
        duplicates,
        missing,
        order_violations,
    };
    debug!(?report, "queue workload finished");
    Ok(report)
}

/// Run `workload` on [`BoundedQueue`] and on the reference `ArrayQueue`.
pub fn compare_queues(workload: &QueueWorkload) -> Result<QueueComparison, WorkloadError> {
    let ours = run_queue_workload::<BoundedQueue<u64>>(workload)?;
    let reference = run_queue_workload::<ArrayQueue<u64>>(workload)?;
    let comparison = QueueComparison { ours, reference };
    info!(
        ours = comparison.ours.throughput(),
        reference = comparison.reference.throughput(),
        speedup = comparison.speedup(),
        "queue comparison"
    );
    Ok(comparison)
}

/// A payload that can tell whether it was read whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksummed {
    words: [u64; 8],
    checksum: u64,
}

impl Checksummed {
    pub fn new(seed: u64) -> Self {
        let mut words = [0u64; 8];
        for (i, word) in words.iter_mut().enumerate() {
            *word = seed
                .wrapping_add(i as u64)
                .wrapping_mul(0x9E37_79B9_7F4A_7C15);
        }
        let checksum = Self::fold(&words);
        Self { words, checksum }
    }

    fn fold(words: &[u64; 8]) -> u64 {
        words
            .iter()
            .fold(0xCBF2_9CE4_8422_2325, |acc, word| (acc ^ word).rotate_left(17))
    }

    pub fn verify(&self) -> bool {
        Self::fold(&self.words) == self.checksum
    }
}

/// Outcome of one multi-access run.
#[derive(Debug, Clone)]
pub struct MultiAccessReport {
    pub reads: usize,
    pub writes: usize,
    pub elapsed: Duration,
    /// Reads whose payload failed its checksum.
    pub torn_reads: usize,
    /// Reads that saw an older version than the same reader saw before.
    pub version_regressions: usize,
    pub final_version: u64,
    /// Retired snapshots still held after all threads finished and a final sweep ran.
    pub retired_after_sweep: usize,
}

impl MultiAccessReport {
    /// Reads and writes per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return f64::INFINITY;
        }
        (self.reads + self.writes) as f64 / secs
    }

    /// No torn reads, versions never went back, every write published, nothing leaked.
    pub fn is_consistent(&self) -> bool {
        self.torn_reads == 0
            && self.version_regressions == 0
            && self.final_version == self.writes as u64
            && self.retired_after_sweep == 0
    }
}

/// Run `workload` on a [`MultiAccess`] holding [`Checksummed`] payloads.
pub fn run_multiaccess_workload(workload: &MultiAccessWorkload) -> MultiAccessReport {
    let reclaimer = EpochReclaimer::new();
    let container = MultiAccess::with_reclaimer(Checksummed::new(0), reclaimer.clone());

    let torn_reads = AtomicUsize::new(0);
    let version_regressions = AtomicUsize::new(0);

    let start = Instant::now();
    thread::scope(|s| {
        for writer in 0..workload.writers {
            let container = &container;
            s.spawn(move || {
                let accessor = container.accessor();
                for i in 0..workload.writes_per_writer {
                    accessor.write(Checksummed::new(tag(writer, i)));
                }
            });
        }

        for _ in 0..workload.readers {
            let container = &container;
            let torn_reads = &torn_reads;
            let version_regressions = &version_regressions;
            s.spawn(move || {
                let accessor = container.accessor();
                let mut last_version = 0;
                let (mut torn, mut regressions) = (0, 0);
                for _ in 0..workload.reads_per_reader {
                    let view = accessor.read();
                    if !view.verify() {
                        torn += 1;
                    }
                    if view.version() < last_version {
                        regressions += 1;
                    }
                    last_version = view.version();
                }
                torn_reads.fetch_add(torn, Ordering::Relaxed);
                version_regressions.fetch_add(regressions, Ordering::Relaxed);
            });
        }
    });
    let elapsed = start.elapsed();

    let final_version = {
        let local = reclaimer.register();
        let guard = local.enter();
        container.version(&guard)
    };
    reclaimer.advance_epoch();

    let report = MultiAccessReport {
        reads: workload.readers * workload.reads_per_reader,
        writes: workload.writers * workload.writes_per_writer,
        elapsed,
        torn_reads: torn_reads.into_inner(),
        version_regressions: version_regressions.into_inner(),
        final_version,
        retired_after_sweep: reclaimer.retired_count(),
    };
    info!(
        throughput = report.throughput(),
        torn_reads = report.torn_reads,
        retired_after_sweep = report.retired_after_sweep,
        "multiaccess workload finished"
    );
    report
}
