//! Bounded multi-producer/multi-consumer queue.
//!
//! A fixed ring of slots. Head and tail positions pack a lap number above a slot
//! index: `position = lap | index`, where one lap is the smallest power of two
//! strictly greater than the capacity. Each slot carries a stamp in the same
//! format that says whose turn the slot is on:
//!
//! ```text
//! stamp == tail                 free, waiting for the enqueuer of `tail`
//! stamp == head + 1             holds the element of `head`, waiting for its dequeuer
//! stamp == head + one lap       vacated, waiting for the enqueuer of the next lap
//! ```
//!
//! Because the lap occupies bits the index never reaches, the stamps of
//! "occupied" and "free for the next lap" never coincide, even for a capacity of
//! one, and advancing past the last slot wraps the whole position with
//! `wrapping_add`, which keeps the index continuous across `usize` overflow.
//!
//! A thread claims a position by CAS on the shared counter only after checking
//! the slot's stamp matches the position exactly, so a thread that read a stale
//! position can never claim a slot from a different lap.
//!
//! Memory ordering, per operation:
//! - position CAS: `SeqCst`, so the full/empty checks below see a single order of
//!   claims on both counters.
//! - stamp loads: `Acquire`, pairing with the publishing store of the other side,
//!   so a dequeuer sees the payload write and an enqueuer sees the payload move-out.
//! - stamp stores: `Release`, publishing the payload (enqueue) or the vacated slot
//!   (dequeue).
//! - before declaring `Full`/`Empty`: a `SeqCst` fence, then a load of the opposite
//!   counter.
//!
//! 有界多生产者/多消费者队列。头尾位置由"圈号 | 槽位下标"组成，每个槽位带有同样格式的戳，
//! 表示当前轮到谁使用该槽位。
use crate::error::{Empty, Full, InvalidCapacity};
use crate::sync::{AtomicUsize, CachePadded, Ordering, UnsafeCell, fence, wait_for_peer};
use crossbeam_utils::Backoff;
use std::boxed::Box;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::vec::Vec;
use tracing::debug;

struct Slot<T> {
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A fixed-capacity lock-free MPMC queue.
///
/// `enqueue` and `dequeue` never block and never retry on the caller's behalf:
/// a full or empty queue is reported immediately as [`Full`] or [`Empty`]. The
/// internal loop only resolves races between threads contending for the same
/// position, or waits out a peer that has claimed a position and not yet
/// published it.
///
/// Elements enqueued by one thread are dequeued in the order that thread enqueued
/// them. No element is observed before its enqueuer finished writing it.
///
/// # Example
/// ```
/// use sprawl::BoundedQueue;
///
/// let queue = BoundedQueue::new(2).unwrap();
/// queue.enqueue(1).unwrap();
/// queue.enqueue(2).unwrap();
/// assert_eq!(queue.enqueue(3).unwrap_err().into_inner(), 3);
///
/// assert_eq!(queue.dequeue(), Ok(1));
/// assert_eq!(queue.dequeue(), Ok(2));
/// assert!(queue.dequeue().is_err());
/// ```
///
/// 固定容量的无锁 MPMC 队列。
/// `enqueue` 和 `dequeue` 从不阻塞，也从不替调用者重试：队列满或空时立即返回 [`Full`] 或 [`Empty`]。
pub struct BoundedQueue<T> {
    slots: Box<[Slot<T>]>,
    capacity: usize,
    one_lap: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
    _marker: PhantomData<T>,
}

// SAFETY: a slot's payload is only touched by the single thread that won the
// position CAS for it, and hand-off between threads goes through the stamp's
// Release/Acquire pair.
unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` elements.
    ///
    /// The capacity is exact; it is not rounded to a power of two. Fails with
    /// [`InvalidCapacity`] for zero, or when the slot array or lap width cannot be
    /// represented.
    ///
    /// 创建一个最多容纳 `capacity` 个元素的队列。容量是精确的，不会向上取整为 2 的幂。
    pub fn new(capacity: usize) -> Result<Self, InvalidCapacity> {
        Self::starting_at(capacity, 0)
    }

    /// Queue whose head and tail start on the last lap before `usize` wraps.
    #[cfg(all(test, not(feature = "loom")))]
    pub(crate) fn near_position_wrap(capacity: usize) -> Result<Self, InvalidCapacity> {
        let one_lap = Self::lap_width(capacity).ok_or(InvalidCapacity {
            requested: capacity,
        })?;
        Self::starting_at(capacity, !(one_lap - 1))
    }

    fn lap_width(capacity: usize) -> Option<usize> {
        capacity.checked_add(1)?.checked_next_power_of_two()
    }

    fn starting_at(capacity: usize, start: usize) -> Result<Self, InvalidCapacity> {
        let too_large = std::mem::size_of::<Slot<T>>()
            .checked_mul(capacity)
            .is_none_or(|bytes| bytes > isize::MAX as usize);
        let one_lap = match Self::lap_width(capacity) {
            Some(one_lap) if capacity != 0 && !too_large => one_lap,
            _ => {
                return Err(InvalidCapacity {
                    requested: capacity,
                });
            }
        };

        let slots: Box<[Slot<T>]> = (0..capacity)
            .map(|i| Slot {
                stamp: AtomicUsize::new(start | i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        debug!(capacity, one_lap, "bounded queue created");

        Ok(Self {
            slots,
            capacity,
            one_lap,
            enqueue_pos: CachePadded::new(AtomicUsize::new(start)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(start)),
            _marker: PhantomData,
        })
    }

    /// Position following `pos`: the next index on the same lap, or index 0 of
    /// the next lap.
    #[inline]
    fn advance(&self, pos: usize) -> usize {
        let index = pos & (self.one_lap - 1);
        let lap = pos & !(self.one_lap - 1);
        if index + 1 < self.capacity {
            pos + 1
        } else {
            lap.wrapping_add(self.one_lap)
        }
    }

    /// Try to append `value`.
    ///
    /// Fails with [`Full`], handing `value` back, when the slot for the current
    /// enqueue position still holds the element of the previous lap.
    ///
    /// 尝试追加 `value`。当前入队位置的槽位仍保存上一圈的元素时，返回携带 `value` 的 [`Full`]。
    pub fn enqueue(&self, value: T) -> Result<(), Full<T>> {
        let backoff = Backoff::new();
        let mut tail = self.enqueue_pos.load(Ordering::Relaxed);

        loop {
            let index = tail & (self.one_lap - 1);
            let slot = &self.slots[index];
            let stamp = slot.stamp.load(Ordering::Acquire);

            if tail == stamp {
                let next = self.advance(tail);
                match self.enqueue_pos.compare_exchange_weak(
                    tail,
                    next,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS for `tail` while `stamp == tail` makes
                        // this thread the only one allowed to touch the slot until it
                        // stores `tail + 1`.
                        slot.value.with_mut(|cell| unsafe {
                            (*cell).write(value);
                        });
                        slot.stamp.store(tail + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => {
                        tail = current;
                        backoff.spin();
                    }
                }
            } else if stamp.wrapping_add(self.one_lap) == tail + 1 {
                // The slot still holds the element of the previous lap. It is only
                // full if no dequeuer has claimed that element since.
                fence(Ordering::SeqCst);
                let head = self.dequeue_pos.load(Ordering::Relaxed);
                if head.wrapping_add(self.one_lap) == tail {
                    return Err(Full(value));
                }
                wait_for_peer(&backoff);
                tail = self.enqueue_pos.load(Ordering::Relaxed);
            } else {
                // Another producer claimed `tail` and has not published yet.
                wait_for_peer(&backoff);
                tail = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Try to remove the oldest published element.
    ///
    /// Fails with [`Empty`] when the dequeue position has caught up with the
    /// enqueue position.
    ///
    /// 尝试取出最早发布的元素。出队位置追上入队位置时返回 [`Empty`]。
    pub fn dequeue(&self) -> Result<T, Empty> {
        let backoff = Backoff::new();
        let mut head = self.dequeue_pos.load(Ordering::Relaxed);

        loop {
            let index = head & (self.one_lap - 1);
            let slot = &self.slots[index];
            let stamp = slot.stamp.load(Ordering::Acquire);

            if head + 1 == stamp {
                let next = self.advance(head);
                match self.dequeue_pos.compare_exchange_weak(
                    head,
                    next,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: `stamp == head + 1` means the enqueuer of `head`
                        // published an initialized value (Acquire above), and winning
                        // the CAS makes this thread its only reader.
                        let value = slot
                            .value
                            .with_mut(|cell| unsafe { (*cell).assume_init_read() });
                        slot.stamp
                            .store(head.wrapping_add(self.one_lap), Ordering::Release);
                        return Ok(value);
                    }
                    Err(current) => {
                        head = current;
                        backoff.spin();
                    }
                }
            } else if stamp == head {
                // Nothing published at this position. Empty unless a producer has
                // already claimed it.
                fence(Ordering::SeqCst);
                let tail = self.enqueue_pos.load(Ordering::Relaxed);
                if tail == head {
                    return Err(Empty);
                }
                wait_for_peer(&backoff);
                head = self.dequeue_pos.load(Ordering::Relaxed);
            } else {
                // Another consumer claimed `head` and has not vacated the slot yet.
                wait_for_peer(&backoff);
                head = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Alias of [`enqueue`](Self::enqueue).
    #[inline]
    pub fn try_enqueue(&self, value: T) -> Result<(), Full<T>> {
        self.enqueue(value)
    }

    /// Alias of [`dequeue`](Self::dequeue).
    #[inline]
    pub fn try_dequeue(&self) -> Result<T, Empty> {
        self.dequeue()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of claimed-but-not-dequeued positions.
    ///
    /// Exact when no other thread is operating on the queue; a snapshot otherwise.
    pub fn len(&self) -> usize {
        loop {
            let tail = self.enqueue_pos.load(Ordering::SeqCst);
            let head = self.dequeue_pos.load(Ordering::SeqCst);

            // Re-read the tail so `head` and `tail` come from one instant.
            if self.enqueue_pos.load(Ordering::SeqCst) == tail {
                let head_index = head & (self.one_lap - 1);
                let tail_index = tail & (self.one_lap - 1);

                return if head_index < tail_index {
                    tail_index - head_index
                } else if head_index > tail_index {
                    self.capacity - head_index + tail_index
                } else if tail == head {
                    0
                } else {
                    self.capacity
                };
            }
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        let head = self.dequeue_pos.load(Ordering::Relaxed);
        let head_index = head & (self.one_lap - 1);

        for offset in 0..self.len() {
            let index = (head_index + offset) % self.capacity;
            // SAFETY: `&mut self` excludes other threads, and every slot between head
            // and tail holds an initialized element.
            self.slots[index]
                .value
                .with_mut(|cell| unsafe { (*cell).assume_init_drop() });
        }
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
