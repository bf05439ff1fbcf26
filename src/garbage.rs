use std::boxed::Box;
use std::collections::VecDeque;
use std::vec::Vec;

/// An object that has been unlinked from shared view but not yet dropped.
/// It stores the raw pointer and a destructor function to safely drop the concrete type.
///
/// 一个已从共享视图中摘除但尚未删除的对象。
/// 它存储原始指针和析构函数，以安全地 drop 具体类型。
pub(crate) struct RetiredObject {
    ptr: *mut (),
    dtor: unsafe fn(*mut ()),
}

// SAFETY: `RetiredObject::new` only accepts `T: Send`, and the reclaimer is the sole
// owner of the pointer until the destructor runs.
unsafe impl Send for RetiredObject {}

/// Generic destructor for retired objects.
/// Converts the raw pointer back to `Box<T>` and drops it.
///
/// 已退休对象的通用析构函数。
#[inline(always)]
unsafe fn drop_value<T>(ptr: *mut ()) {
    let ptr = ptr as *mut T;
    unsafe {
        drop(Box::from_raw(ptr));
    }
}

impl RetiredObject {
    /// Take ownership of a boxed value.
    /// 从 `Box<T>` 创建一个已退休对象。
    #[inline(always)]
    pub(crate) fn new<T: Send + 'static>(value: Box<T>) -> Self {
        RetiredObject {
            ptr: Box::into_raw(value) as *mut (),
            dtor: drop_value::<T>,
        }
    }
}

impl Drop for RetiredObject {
    #[inline(always)]
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                (self.dtor)(self.ptr);
            }
            self.ptr = std::ptr::null_mut();
        }
    }
}

/// The retired list: bags of retired objects keyed by retirement epoch.
///
/// Bags are kept in non-decreasing epoch order. An object whose tag is older
/// than the newest bag is filed into the newest bag, which only delays its release.
///
/// 已退休列表：按退休纪元分组的对象袋。
/// 袋子按纪元非递减排列。标签早于最新袋子的对象会被放入最新袋子，这只会推迟其释放。
pub(crate) struct GarbageSet {
    queue: VecDeque<(usize, Vec<RetiredObject>)>,
    /// Pool of empty vectors to reduce allocation.
    pool: Vec<Vec<RetiredObject>>,
    count: usize,
    /// Retired-list size at which growth was last reported.
    warned_at: usize,
    sweeps: usize,
}

impl GarbageSet {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            pool: Vec::new(),
            count: 0,
            warned_at: 0,
            sweeps: 0,
        }
    }

    /// Count a sweep and return its ordinal, starting at 1.
    #[inline]
    pub(crate) fn next_sweep(&mut self) -> usize {
        self.sweeps = self.sweeps.wrapping_add(1);
        self.sweeps
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    /// Oldest epoch still holding garbage.
    #[inline]
    pub(crate) fn oldest_epoch(&self) -> Option<usize> {
        self.queue.front().map(|(epoch, _)| *epoch)
    }

    /// File a retired object under `epoch`.
    ///
    /// 将已退休对象归档到 `epoch` 下。
    pub(crate) fn add(&mut self, node: RetiredObject, epoch: usize) {
        if let Some((last_epoch, bag)) = self.queue.back_mut() {
            if *last_epoch >= epoch {
                bag.push(node);
                self.count += 1;
                return;
            }
        }

        // Reuse a vector from the pool if available, or create a new one
        let mut bag = self.pool.pop().unwrap_or_else(|| Vec::with_capacity(16));
        bag.push(node);
        self.queue.push_back((epoch, bag));

        self.count += 1;
    }

    /// Drop every bag whose epoch is strictly older than `min_active_epoch`.
    /// Returns the number of objects freed.
    ///
    /// 释放所有纪元严格早于 `min_active_epoch` 的袋子，返回释放的对象数量。
    pub(crate) fn collect(&mut self, min_active_epoch: usize) -> usize {
        let mut freed = 0;

        while let Some((epoch, _)) = self.queue.front() {
            if *epoch >= min_active_epoch {
                break;
            }
            if let Some((_, mut bag)) = self.queue.pop_front() {
                freed += bag.len();
                bag.clear(); // Drops all retired objects inside
                self.pool.push(bag);
            }
        }

        self.count -= freed;
        if self.count < self.warned_at / 2 {
            self.warned_at = 0;
        }
        freed
    }

    /// Returns `true` once per doubling of the retired list beyond `limit`.
    ///
    /// 已退休列表超过 `limit` 后，每翻倍一次返回一次 `true`。
    pub(crate) fn should_warn(&mut self, limit: usize) -> bool {
        let threshold = if self.warned_at == 0 {
            limit
        } else {
            self.warned_at.saturating_mul(2)
        };
        if limit > 0 && self.count > threshold {
            self.warned_at = self.count;
            true
        } else {
            false
        }
    }
}
