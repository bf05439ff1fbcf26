use crate::garbage::RetiredObject;
use crate::participant::LocalEpoch;
use crate::state::{
    AUTO_RECLAIM_THRESHOLD, DEFAULT_CLEANUP_INTERVAL, DEFAULT_GROWTH_WARNING, INACTIVE_EPOCH,
    ReclaimerSettings, SharedState,
};
use crate::sync::{Arc, Ordering, fence};
use std::boxed::Box;
use tracing::{debug, trace, warn};

/// Builder for configuring an [`EpochReclaimer`].
///
/// - `auto_reclaim_threshold`: pending retired objects that trigger a sweep
/// - `cleanup_interval`: how often slots of dropped participants are pruned
/// - `growth_warning`: retired-list size that triggers a stalled-guard warning
///
/// # Example
/// ```
/// use sprawl::EpochReclaimer;
///
/// let reclaimer = EpochReclaimer::builder()
///     .auto_reclaim_threshold(128)
///     .cleanup_interval(32)
///     .build();
/// ```
///
/// 用于配置 [`EpochReclaimer`] 的构建器。
#[derive(Debug, Clone)]
pub struct EpochReclaimerBuilder {
    auto_reclaim_threshold: Option<usize>,
    cleanup_interval: usize,
    growth_warning: usize,
}

impl EpochReclaimerBuilder {
    /// Create a new builder with default settings.
    /// 创建一个带有默认设置的新构建器。
    #[inline]
    pub fn new() -> Self {
        Self {
            auto_reclaim_threshold: Some(AUTO_RECLAIM_THRESHOLD),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            growth_warning: DEFAULT_GROWTH_WARNING,
        }
    }

    /// Set the automatic reclamation threshold.
    ///
    /// When more than this many retired objects are waiting for a sweep,
    /// `retire` calls `advance_epoch()` itself. Pass `None` to disable.
    ///
    /// Default: `Some(64)`
    ///
    /// 设置自动回收阈值。等待清扫的已退休对象超过此数量时，`retire` 会自行调用
    /// `advance_epoch()`。传递 `None` 可禁用。
    #[inline]
    pub fn auto_reclaim_threshold(mut self, threshold: impl Into<Option<usize>>) -> Self {
        self.auto_reclaim_threshold = threshold.into();
        self
    }

    /// Set the cleanup interval for slots of dropped participants.
    ///
    /// Set to `0` to disable periodic cleanup (not recommended).
    ///
    /// Default: `16`
    ///
    /// 设置已 drop 参与者槽位的清理间隔。设置为 `0` 可禁用定期清理（不推荐）。
    #[inline]
    pub fn cleanup_interval(mut self, interval: usize) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set the retired-list size above which sweeps log a warning.
    ///
    /// The warning repeats only each time the list doubles again. `0` disables it.
    ///
    /// Default: `4096`
    #[inline]
    pub fn growth_warning(mut self, limit: usize) -> Self {
        self.growth_warning = limit;
        self
    }

    /// Build the reclaimer.
    /// 使用配置的设置构建回收器。
    pub fn build(self) -> EpochReclaimer {
        let settings = ReclaimerSettings {
            auto_reclaim_threshold: self.auto_reclaim_threshold,
            cleanup_interval: self.cleanup_interval,
            growth_warning: self.growth_warning,
        };
        debug!(?settings, "epoch reclaimer created");

        EpochReclaimer {
            shared: Arc::new(SharedState::new(settings)),
        }
    }
}

impl Default for EpochReclaimerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An epoch-based reclamation context.
///
/// `EpochReclaimer` owns every retired allocation until no participant can still
/// observe it. It manages:
/// - The global epoch counter.
/// - Registration of participant threads.
/// - The retired list and the sweeps that drain it.
///
/// It is `Clone` and cheap to share: clones refer to the same state. There is no
/// process-wide instance; containers either build their own or are handed one.
/// The retired list is freed when the last clone and the last `LocalEpoch` are gone.
///
/// **Typical Usage**:
/// ```
/// use sprawl::EpochReclaimer;
///
/// let reclaimer = EpochReclaimer::new();
///
/// // Each thread registers once and enters around shared reads.
/// let local = reclaimer.register();
/// {
///     let _guard = local.enter();
///     // read epoch-protected memory here
/// }
///
/// // Writers hand unlinked memory over instead of dropping it.
/// reclaimer.retire(Box::new(vec![1, 2, 3]));
/// reclaimer.advance_epoch();
/// assert_eq!(reclaimer.retired_count(), 0);
/// ```
///
/// 基于纪元的回收上下文。
/// `EpochReclaimer` 拥有每个已退休的分配，直到没有参与者还能观察到它。
/// 它是 `Clone` 的，克隆共享同一状态。不存在进程级实例；容器要么自行构建，要么被注入一个。
#[derive(Clone, Debug)]
pub struct EpochReclaimer {
    shared: Arc<SharedState>,
}

impl EpochReclaimer {
    /// Create a reclaimer with default settings.
    /// 使用默认设置创建回收器。
    #[inline]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for configuring the reclaimer.
    /// 创建一个用于配置回收器的构建器。
    #[inline]
    pub fn builder() -> EpochReclaimerBuilder {
        EpochReclaimerBuilder::new()
    }

    pub(crate) fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Register a participant for the current thread.
    ///
    /// The caller is responsible for ensuring that each `LocalEpoch` is used
    /// by only one thread at a time.
    ///
    /// 为当前线程注册一个参与者。调用者有责任确保每个 `LocalEpoch` 同一时间仅由一个线程使用。
    #[inline]
    pub fn register(&self) -> LocalEpoch {
        LocalEpoch::new(self.shared.clone())
    }

    /// Hand a value that no participant can newly reach over to the reclaimer.
    ///
    /// The value is tagged with the current global epoch and dropped by a later
    /// sweep, once every entered guard observed a newer epoch. The caller must have
    /// already unlinked it (swap/CAS) from shared view before calling this.
    ///
    /// Ordering: the tag is read with `SeqCst` after the caller's unlinking
    /// operation, then the object is pushed onto a lock-free pending queue.
    ///
    /// **Automatic Reclamation**: when the pending queue grows past the configured
    /// threshold, this call runs `advance_epoch()` itself.
    ///
    /// 将一个参与者无法再新获取的值交给回收器。
    /// 该值被标记为当前全局纪元，并在之后的清扫中、当所有已进入的守卫都观察到更新的纪元后被 drop。
    pub fn retire<T: Send + 'static>(&self, data: Box<T>) {
        let epoch = self.shared.global_epoch.load(Ordering::SeqCst);

        self.shared.retired.fetch_add(1, Ordering::Relaxed);
        self.shared.pending.push((epoch, RetiredObject::new(data)));

        if let Some(threshold) = self.shared.settings.auto_reclaim_threshold {
            if self.shared.pending.len() > threshold {
                self.advance_epoch();
            }
        }
    }

    /// Advance the global epoch and sweep the retired list.
    ///
    /// Every retired object tagged with an epoch strictly older than the minimum epoch
    /// observed by any entered guard (or older than the new epoch when nobody is
    /// entered) is dropped. Returns how many objects this call freed.
    ///
    /// If another thread is already sweeping, the epoch is still advanced but the
    /// sweep is left to that thread or the next call; this returns `0`.
    ///
    /// Ordering: `fetch_add(SeqCst)` on the epoch, drain of the pending queue, a
    /// `SeqCst` fence pairing with the fence in `LocalEpoch::enter`, then `Acquire`
    /// loads of every participant slot.
    ///
    /// 推进全局纪元并清扫已退休列表。
    /// 所有标签严格早于任一已进入守卫所观察到的最小纪元（无人进入时则早于新纪元）的对象都会被 drop。
    /// 若其他线程正在清扫，纪元仍会推进，但本次调用返回 `0`。
    pub fn advance_epoch(&self) -> usize {
        let new_epoch = self.shared.global_epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let Ok(mut garbage) = self.shared.garbage.try_lock() else {
            trace!(epoch = new_epoch, "sweep in progress elsewhere, deferring");
            return 0;
        };

        while let Some((epoch, node)) = self.shared.pending.pop() {
            garbage.add(node, epoch);
        }

        fence(Ordering::SeqCst);

        let settings = self.shared.settings;
        let sweep = garbage.next_sweep();
        let should_cleanup =
            settings.cleanup_interval > 0 && sweep % settings.cleanup_interval == 0;

        let mut min_active_epoch = new_epoch;
        let mut readers = self.shared.readers.lock();
        let mut dead_count = 0;

        for slot in readers.iter() {
            let epoch = slot.active_epoch.load(Ordering::Acquire);
            if epoch != INACTIVE_EPOCH {
                min_active_epoch = min_active_epoch.min(epoch);
            } else if should_cleanup && Arc::strong_count(slot) == 1 {
                // Only this Vec holds a reference, the LocalEpoch was dropped
                dead_count += 1;
            }
        }

        if dead_count > 0 {
            readers.retain(|slot| Arc::strong_count(slot) > 1);
            debug!(pruned = dead_count, remaining = readers.len(), "pruned dead participant slots");
        }

        drop(readers);

        let freed = garbage.collect(min_active_epoch);
        if freed > 0 {
            self.shared.retired.fetch_sub(freed, Ordering::Relaxed);
        }

        if garbage.should_warn(settings.growth_warning) {
            warn!(
                retired = garbage.len(),
                oldest_epoch = ?garbage.oldest_epoch(),
                min_active_epoch,
                epoch = new_epoch,
                "retired list keeps growing; a guard may be held across a stall"
            );
        }

        trace!(
            epoch = new_epoch,
            min_active_epoch,
            freed,
            remaining = garbage.len(),
            "epoch sweep"
        );

        freed
    }

    /// Current value of the global epoch.
    #[inline]
    pub fn epoch(&self) -> usize {
        self.shared.global_epoch.load(Ordering::Acquire)
    }

    /// Objects retired and not yet freed, whether swept already or still pending.
    ///
    /// 已退休但尚未释放的对象数量。
    #[inline]
    pub fn retired_count(&self) -> usize {
        self.shared.retired.load(Ordering::Acquire)
    }

    /// Participants whose `LocalEpoch` is still alive.
    pub fn participant_count(&self) -> usize {
        self.shared
            .readers
            .lock()
            .iter()
            .filter(|slot| Arc::strong_count(slot) > 1)
            .count()
    }
}

impl Default for EpochReclaimer {
    fn default() -> Self {
        Self::new()
    }
}
