//! Unbounded multi-producer/multi-consumer queue.
//!
//! Elements live in a linked list of fixed-size blocks. Head and tail are each a
//! pair of (index, block pointer); the index counts slots, including one phantom
//! slot per block that marks the hand-over to the next block:
//!
//! ```text
//! index >> SHIFT      running slot number
//! (index >> SHIFT) % LAP
//!   0 .. BLOCK_CAP    a real slot of the current block
//!   BLOCK_CAP         the next block is being installed; wait
//! index & HAS_NEXT    (head only) the head block is known to have a successor
//! ```
//!
//! The producer that claims the last slot of a block installs the next one, so
//! the tail never stalls on allocation. The consumer that claims the last slot
//! moves the head to the next block and retires the drained block through the
//! queue's [`EpochReclaimer`]. Every operation runs under a guard, so a thread
//! still writing or reading an earlier slot of that block keeps it alive.
//!
//! 无界多生产者/多消费者队列。元素存放在定长块组成的链表中，消费完的块交给回收器退休。

use crate::error::Empty;
use crate::participant::{Guard, LocalEpoch};
use crate::reclaimer::EpochReclaimer;
use crate::sync::{
    AtomicBool, AtomicPtr, AtomicUsize, CachePadded, Ordering, UnsafeCell, fence, wait_for_peer,
};
use crossbeam_utils::Backoff;
use std::boxed::Box;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use tracing::{debug, trace};

// Small blocks keep the loom state space tractable while still crossing blocks.
#[cfg(not(feature = "loom"))]
const LAP: usize = 32;
#[cfg(feature = "loom")]
const LAP: usize = 4;

/// Real slots per block; the last offset of each lap is the hand-over marker.
pub(crate) const BLOCK_CAP: usize = LAP - 1;
const SHIFT: usize = 1;
const HAS_NEXT: usize = 1;

struct Slot<T> {
    ready: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn wait_ready(&self) {
        let backoff = Backoff::new();
        while !self.ready.load(Ordering::Acquire) {
            wait_for_peer(&backoff);
        }
    }
}

struct Block<T> {
    next: AtomicPtr<Block<T>>,
    slots: [Slot<T>; BLOCK_CAP],
}

impl<T> Block<T> {
    fn new() -> Box<Self> {
        Box::new(Block {
            next: AtomicPtr::new(ptr::null_mut()),
            slots: std::array::from_fn(|_| Slot {
                ready: AtomicBool::new(false),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            }),
        })
    }

    fn wait_next(&self) -> *mut Block<T> {
        let backoff = Backoff::new();
        loop {
            let next = self.next.load(Ordering::Acquire);
            if !next.is_null() {
                return next;
            }
            wait_for_peer(&backoff);
        }
    }
}

struct Position<T> {
    index: AtomicUsize,
    block: AtomicPtr<Block<T>>,
}

/// A growable lock-free MPMC queue whose drained blocks are reclaimed by epoch.
///
/// `enqueue` never fails. `dequeue` reports an empty queue immediately as
/// [`Empty`]. A claimed slot may briefly wait for the peer that claimed its
/// neighbor position, but no thread ever waits for a lock.
///
/// Elements enqueued by one thread are dequeued in the order that thread enqueued
/// them.
///
/// **Safety Contract**:
/// - Every operation runs inside a [`Guard`] registered with this queue's
///   reclaimer. [`QueueHandle`] does this for you; the guard-taking methods check
///   it with an `assert!`.
/// - A block is retired only after both head and tail have moved past it, so the
///   reclaimer frees it once every guard that could still touch it is gone.
///
/// **Typical Usage**:
/// ```
/// use sprawl::UnboundedQueue;
///
/// let queue = UnboundedQueue::new();
/// let handle = queue.handle();
///
/// for i in 0..100 {
///     handle.enqueue(i);
/// }
/// assert_eq!(queue.len(), 100);
///
/// let drained: Vec<i32> = std::iter::from_fn(|| handle.dequeue().ok()).collect();
/// assert_eq!(drained, (0..100).collect::<Vec<_>>());
/// assert!(handle.dequeue().is_err());
/// ```
///
/// 一个可增长的无锁 MPMC 队列，消费完的块按纪元回收。
/// `enqueue` 永不失败；队列为空时 `dequeue` 立即返回 [`Empty`]。
/// **安全合约**：
/// - 所有操作都必须在注册到本队列回收器的 [`Guard`] 内进行。
/// - 只有头尾都越过某个块之后它才会被退休。
pub struct UnboundedQueue<T> {
    head: CachePadded<Position<T>>,
    tail: CachePadded<Position<T>>,
    reclaimer: EpochReclaimer,
    advance_on_retire: bool,
    _marker: PhantomData<T>,
}

// SAFETY: a slot's payload is touched only by the producer and the consumer that
// won its index CAS, handing over through the slot's `ready` flag.
unsafe impl<T: Send> Send for UnboundedQueue<T> {}
unsafe impl<T: Send> Sync for UnboundedQueue<T> {}

impl<T: Send + 'static> UnboundedQueue<T> {
    /// Create a queue with its own reclaimer.
    /// 创建一个拥有独立回收器的队列。
    #[inline]
    pub fn new() -> Self {
        Self::with_reclaimer(EpochReclaimer::new())
    }

    /// Create a queue that retires drained blocks through `reclaimer`.
    ///
    /// 创建一个通过 `reclaimer` 退休已消费块的队列。
    pub fn with_reclaimer(reclaimer: EpochReclaimer) -> Self {
        let first = Box::into_raw(Block::<T>::new());
        debug!(block_capacity = BLOCK_CAP, "unbounded queue created");

        Self {
            head: CachePadded::new(Position {
                index: AtomicUsize::new(0),
                block: AtomicPtr::new(first),
            }),
            tail: CachePadded::new(Position {
                index: AtomicUsize::new(0),
                block: AtomicPtr::new(first),
            }),
            reclaimer,
            advance_on_retire: true,
            _marker: PhantomData,
        }
    }

    /// Whether [`QueueHandle::dequeue`] advances the epoch after retiring a block.
    ///
    /// When disabled, drained blocks are swept only by the reclaimer's automatic
    /// threshold or by explicit `advance_epoch()` calls.
    ///
    /// Default: `true`
    #[inline]
    pub fn advance_on_retire(mut self, enabled: bool) -> Self {
        self.advance_on_retire = enabled;
        self
    }

    #[inline]
    pub fn reclaimer(&self) -> &EpochReclaimer {
        &self.reclaimer
    }

    /// Register the calling thread and return its handle to this queue.
    ///
    /// 注册调用线程并返回其访问本队列的句柄。
    #[inline]
    pub fn handle(&self) -> QueueHandle<'_, T> {
        QueueHandle {
            queue: self,
            local: self.reclaimer.register(),
        }
    }

    fn check_guard(&self, guard: &Guard<'_>) {
        assert!(
            guard.local().belongs_to(self.reclaimer.shared()),
            "guard was entered on a different EpochReclaimer than this queue uses"
        );
    }

    /// Append `value` under `guard`.
    ///
    /// # Panics
    /// If `guard` was entered on a different reclaimer.
    ///
    /// 在 `guard` 下追加 `value`。
    pub fn enqueue(&self, value: T, guard: &Guard<'_>) {
        self.check_guard(guard);

        let backoff = Backoff::new();
        let mut tail = self.tail.index.load(Ordering::Acquire);
        let mut block = self.tail.block.load(Ordering::Acquire);
        let mut next_block: Option<Box<Block<T>>> = None;

        loop {
            let offset = (tail >> SHIFT) % LAP;

            if offset == BLOCK_CAP {
                // The producer of the last slot is installing the next block.
                wait_for_peer(&backoff);
                tail = self.tail.index.load(Ordering::Acquire);
                block = self.tail.block.load(Ordering::Acquire);
                continue;
            }

            // Allocate ahead of the CAS so the installing thread never allocates
            // while other producers wait on it.
            if offset + 1 == BLOCK_CAP && next_block.is_none() {
                next_block = Some(Block::new());
            }

            let new_tail = tail.wrapping_add(1 << SHIFT);
            match self.tail.index.compare_exchange_weak(
                tail,
                new_tail,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if offset + 1 == BLOCK_CAP {
                        let next = Box::into_raw(next_block.take().unwrap_or_else(Block::new));
                        let next_index = new_tail.wrapping_add(1 << SHIFT);

                        self.tail.block.store(next, Ordering::Release);
                        self.tail.index.store(next_index, Ordering::Release);
                        // SAFETY: `block` was loaded under `guard` and the tail was
                        // on it, so it has not been retired.
                        unsafe { (*block).next.store(next, Ordering::Release) };
                    }

                    // SAFETY: winning the CAS for `tail` makes this thread the only
                    // writer of the slot, and `guard` keeps `block` alive.
                    let slot = unsafe { &(*block).slots[offset] };
                    slot.value.with_mut(|cell| unsafe {
                        (*cell).write(value);
                    });
                    slot.ready.store(true, Ordering::Release);
                    return;
                }
                Err(current) => {
                    tail = current;
                    block = self.tail.block.load(Ordering::Acquire);
                    backoff.spin();
                }
            }
        }
    }

    /// Remove the oldest element under `guard`.
    ///
    /// Fails with [`Empty`] when the head has caught up with the tail.
    ///
    /// # Panics
    /// If `guard` was entered on a different reclaimer.
    ///
    /// 在 `guard` 下取出最早的元素。头追上尾时返回 [`Empty`]。
    pub fn dequeue(&self, guard: &Guard<'_>) -> Result<T, Empty> {
        self.take(guard).map(|(value, _)| value)
    }

    /// Dequeue, also reporting whether this call retired the head block.
    fn take(&self, guard: &Guard<'_>) -> Result<(T, bool), Empty> {
        self.check_guard(guard);

        let backoff = Backoff::new();
        let mut head = self.head.index.load(Ordering::Acquire);
        let mut block = self.head.block.load(Ordering::Acquire);

        loop {
            let offset = (head >> SHIFT) % LAP;

            if offset == BLOCK_CAP {
                // The consumer of the last slot is moving the head to the next block.
                wait_for_peer(&backoff);
                head = self.head.index.load(Ordering::Acquire);
                block = self.head.block.load(Ordering::Acquire);
                continue;
            }

            let mut new_head = head.wrapping_add(1 << SHIFT);

            if new_head & HAS_NEXT == 0 {
                fence(Ordering::SeqCst);
                let tail = self.tail.index.load(Ordering::Relaxed);

                if head >> SHIFT == tail >> SHIFT {
                    return Err(Empty);
                }

                // Head and tail on different blocks: a successor exists.
                if (head >> SHIFT) / LAP != (tail >> SHIFT) / LAP {
                    new_head |= HAS_NEXT;
                }
            }

            match self.head.index.compare_exchange_weak(
                head,
                new_head,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let last = offset + 1 == BLOCK_CAP;

                    if last {
                        // SAFETY: `block` was loaded under `guard` while the head
                        // was on it.
                        let next = unsafe { (*block).wait_next() };
                        let mut next_index = (new_head & !HAS_NEXT).wrapping_add(1 << SHIFT);
                        // SAFETY: `next` is reachable from the live head block.
                        if !unsafe { (*next).next.load(Ordering::Relaxed) }.is_null() {
                            next_index |= HAS_NEXT;
                        }

                        self.head.block.store(next, Ordering::Release);
                        self.head.index.store(next_index, Ordering::Release);
                    }

                    // SAFETY: winning the CAS for `head` makes this thread the only
                    // reader of the slot, and `guard` keeps `block` alive.
                    let slot = unsafe { &(*block).slots[offset] };
                    slot.wait_ready();
                    let value = slot
                        .value
                        .with_mut(|cell| unsafe { (*cell).assume_init_read() });

                    if last {
                        // SAFETY: head and tail have both moved past `block`, so no
                        // new guard can reach it; existing ones are covered by the
                        // epoch tag.
                        let drained = unsafe { Box::from_raw(block) };
                        self.reclaimer.retire(drained);
                        trace!(slot = head >> SHIFT, "queue block drained and retired");
                    }

                    return Ok((value, last));
                }
                Err(current) => {
                    head = current;
                    block = self.head.block.load(Ordering::Acquire);
                    backoff.spin();
                }
            }
        }
    }
}

impl<T> UnboundedQueue<T> {
    /// Number of enqueued elements not yet dequeued.
    ///
    /// Exact when no other thread is operating on the queue; a snapshot otherwise.
    pub fn len(&self) -> usize {
        loop {
            let mut tail = self.tail.index.load(Ordering::SeqCst);
            let mut head = self.head.index.load(Ordering::SeqCst);

            // Re-read the tail so `head` and `tail` come from one instant.
            if self.tail.index.load(Ordering::SeqCst) == tail {
                tail &= !((1 << SHIFT) - 1);
                head &= !((1 << SHIFT) - 1);

                // An index resting on the hand-over marker counts as the next block.
                if (tail >> SHIFT) & (LAP - 1) == LAP - 1 {
                    tail = tail.wrapping_add(1 << SHIFT);
                }
                if (head >> SHIFT) & (LAP - 1) == LAP - 1 {
                    head = head.wrapping_add(1 << SHIFT);
                }

                // Rebase both on the head's block so the subtraction cannot wrap.
                let lap = (head >> SHIFT) / LAP;
                tail = tail.wrapping_sub((lap * LAP) << SHIFT);
                head = head.wrapping_sub((lap * LAP) << SHIFT);

                tail >>= SHIFT;
                head >>= SHIFT;

                // One marker slot per block crossed is not an element.
                return tail - head - tail / LAP;
            }
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        let head = self.head.index.load(Ordering::SeqCst);
        let tail = self.tail.index.load(Ordering::SeqCst);
        head >> SHIFT == tail >> SHIFT
    }
}

impl<T: Send + 'static> Default for UnboundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for UnboundedQueue<T> {
    /// Drops the elements still queued and frees the blocks still linked.
    /// Blocks retired earlier stay with the reclaimer.
    ///
    /// 释放仍在队列中的元素和仍链接的块。之前退休的块仍由回收器负责。
    fn drop(&mut self) {
        let mut head = self.head.index.load(Ordering::Relaxed) & !HAS_NEXT;
        let tail = self.tail.index.load(Ordering::Relaxed) & !HAS_NEXT;
        let mut block = self.head.block.load(Ordering::Relaxed);

        // SAFETY: `&mut self` excludes other threads. Every slot between head and
        // tail holds an initialized element, and every linked block from the head
        // block on is owned by the queue.
        unsafe {
            while head != tail {
                let offset = (head >> SHIFT) % LAP;

                if offset < BLOCK_CAP {
                    (*block).slots[offset]
                        .value
                        .with_mut(|cell| (*cell).assume_init_drop());
                } else {
                    let next = (*block).next.load(Ordering::Relaxed);
                    drop(Box::from_raw(block));
                    block = next;
                }

                head = head.wrapping_add(1 << SHIFT);
            }

            drop(Box::from_raw(block));
        }
    }
}

impl<T> fmt::Debug for UnboundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnboundedQueue")
            .field("len", &self.len())
            .field("reclaimer", &self.reclaimer)
            .field("advance_on_retire", &self.advance_on_retire)
            .finish()
    }
}

/// A thread's handle to an [`UnboundedQueue`].
///
/// Owns the thread's [`LocalEpoch`], so it is `Send` but `!Sync`: create one per
/// thread with [`UnboundedQueue::handle`].
///
/// 线程访问 [`UnboundedQueue`] 的句柄。拥有线程的 [`LocalEpoch`]，因此是 `Send` 但 `!Sync` 的。
pub struct QueueHandle<'a, T> {
    queue: &'a UnboundedQueue<T>,
    local: LocalEpoch,
}

impl<'a, T: Send + 'static> QueueHandle<'a, T> {
    /// Append `value`. Never fails.
    #[inline]
    pub fn enqueue(&self, value: T) {
        let guard = self.local.enter();
        self.queue.enqueue(value, &guard);
    }

    /// Remove the oldest element, or fail with [`Empty`].
    ///
    /// When this call drained a block, the epoch is advanced after the guard is
    /// released, unless the queue was built with `advance_on_retire(false)`.
    ///
    /// 取出最早的元素；队列为空时返回 [`Empty`]。
    pub fn dequeue(&self) -> Result<T, Empty> {
        let (value, retired) = {
            let guard = self.local.enter();
            self.queue.take(&guard)?
        };

        if retired && self.queue.advance_on_retire {
            self.queue.reclaimer.advance_epoch();
        }

        Ok(value)
    }

    /// The thread's epoch registration, for entering guards directly.
    #[inline]
    pub fn local(&self) -> &LocalEpoch {
        &self.local
    }

    #[inline]
    pub fn queue(&self) -> &'a UnboundedQueue<T> {
        self.queue
    }
}

impl<T> fmt::Debug for QueueHandle<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle")
            .field("local", &self.local)
            .finish()
    }
}
