use crate::state::{INACTIVE_EPOCH, ReaderSlot, SharedState};
use crate::sync::{Arc, AtomicUsize, Cell, Ordering, fence};

/// A thread's registration with an [`EpochReclaimer`](crate::EpochReclaimer).
///
/// Each thread that touches epoch-protected memory should hold exactly one
/// `LocalEpoch`, obtained from `EpochReclaimer::register()`. It is `Send` but
/// `!Sync` (due to `Cell`): it may move to a thread, but not be shared by two.
///
/// 线程在 [`EpochReclaimer`](crate::EpochReclaimer) 中的注册。
/// 每个访问受纪元保护内存的线程应持有恰好一个 `LocalEpoch`，
/// 通过 `EpochReclaimer::register()` 获得。它是 `Send` 但 `!Sync` 的（因为 `Cell`）。
pub struct LocalEpoch {
    slot: Arc<ReaderSlot>,
    shared: Arc<SharedState>,
    pin_count: Cell<usize>,
}

impl LocalEpoch {
    pub(crate) fn new(shared: Arc<SharedState>) -> Self {
        let slot = Arc::new(ReaderSlot {
            active_epoch: AtomicUsize::new(INACTIVE_EPOCH),
        });

        shared.readers.lock().push(Arc::clone(&slot));

        LocalEpoch {
            slot,
            shared,
            pin_count: Cell::new(0),
        }
    }

    /// Enter a critical section.
    ///
    /// While the returned [`Guard`] lives, nothing retired at or after the epoch
    /// observed here is freed. Never fails.
    ///
    /// **Reentrancy**: nested calls and `Guard::clone` keep the thread pinned at the
    /// outermost epoch until every guard is dropped.
    ///
    /// **Misuse hazard**: holding a guard across an unbounded stall stops reclamation
    /// for the whole reclaimer. Memory is not corrupted, but the retired list grows
    /// without bound, and sweeps log a warning once it passes the configured limit.
    ///
    /// Ordering: the observed epoch is published with a `SeqCst` store followed by a
    /// `SeqCst` fence, so every later shared-pointer load in this section is ordered
    /// after the publication as seen by any sweeper.
    ///
    /// 进入临界区。
    /// 返回的 [`Guard`] 存活期间，在此观察到的纪元及之后退休的对象都不会被释放。永不失败。
    /// **误用风险**：在无界停顿期间持有守卫会使整个回收器停止回收，
    /// 已退休列表会无限增长，清扫会在超过阈值后记录警告。
    #[inline]
    pub fn enter(&self) -> Guard<'_> {
        let pin_count = self.pin_count.get();

        if pin_count == 0 {
            let current_epoch = self.shared.global_epoch.load(Ordering::SeqCst);
            self.slot
                .active_epoch
                .store(current_epoch, Ordering::SeqCst);
            fence(Ordering::SeqCst);
        }

        self.pin_count.set(pin_count + 1);

        Guard { local: self }
    }

    /// Whether this thread is currently inside a critical section.
    #[inline]
    pub fn is_entered(&self) -> bool {
        self.pin_count.get() > 0
    }

    /// Whether `self` is registered with the same reclaimer state as `shared`.
    #[inline]
    pub(crate) fn belongs_to(&self, shared: &Arc<SharedState>) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }
}

impl std::fmt::Debug for LocalEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEpoch")
            .field(
                "active_epoch",
                &self.slot.active_epoch.load(Ordering::Relaxed),
            )
            .field("pin_count", &self.pin_count.get())
            .finish()
    }
}

/// Scoped critical section obtained from [`LocalEpoch::enter`].
///
/// `!Send` and `!Sync`: it borrows the `!Sync` `LocalEpoch` it came from. Dropping the
/// last guard of a thread marks its slot inactive, which stops it being a barrier to
/// reclamation.
///
/// 通过 [`LocalEpoch::enter`] 获得的作用域临界区。
/// `!Send` 且 `!Sync`。线程的最后一个守卫被 drop 时，其槽位被标记为不活跃，不再阻碍回收。
#[must_use]
pub struct Guard<'a> {
    local: &'a LocalEpoch,
}

impl<'a> Guard<'a> {
    pub(crate) fn local(&self) -> &'a LocalEpoch {
        self.local
    }

    /// The epoch this thread observed when it entered.
    #[inline]
    pub fn epoch(&self) -> usize {
        self.local.slot.active_epoch.load(Ordering::Relaxed)
    }
}

impl<'a> Clone for Guard<'a> {
    #[inline]
    fn clone(&self) -> Self {
        let pin_count = self.local.pin_count.get();

        assert!(
            pin_count > 0,
            "BUG: Cloning a Guard in an unpinned state (pin_count = 0). \
             This indicates incorrect API usage or a library bug."
        );

        self.local.pin_count.set(pin_count + 1);

        Guard { local: self.local }
    }
}

impl<'a> Drop for Guard<'a> {
    #[inline]
    fn drop(&mut self) {
        let pin_count = self.local.pin_count.get();

        assert!(
            pin_count > 0,
            "BUG: Dropping a Guard in an unpinned state (pin_count = 0). \
             This indicates incorrect API usage or a library bug."
        );

        if pin_count == 1 {
            self.local
                .slot
                .active_epoch
                .store(INACTIVE_EPOCH, Ordering::Release);
        }

        self.local.pin_count.set(pin_count - 1);
    }
}

impl std::fmt::Debug for Guard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard").field("epoch", &self.epoch()).finish()
    }
}
