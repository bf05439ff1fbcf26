use crate::garbage::{GarbageSet, RetiredObject};
use crate::sync::{Arc, AtomicUsize, CachePadded, Mutex, Ordering};
use crossbeam_queue::SegQueue;
use std::vec::Vec;

/// Default threshold for automatic reclamation (count of pending retired objects).
/// 自动回收的默认阈值（待处理的已退休对象数量）。
pub(crate) const AUTO_RECLAIM_THRESHOLD: usize = 64;

/// Default interval for pruning slots of dropped participants (in sweeps).
/// 清理已 drop 参与者槽位的默认间隔（以清扫次数为单位）。
pub(crate) const DEFAULT_CLEANUP_INTERVAL: usize = 16;

/// Default retired-list size above which a sweep warns about a stalled guard.
/// 已退休列表超过此大小时，清扫会警告可能存在停滞的守卫。
pub(crate) const DEFAULT_GROWTH_WARNING: usize = 4096;

/// Marks a participant that is not inside a critical section.
/// 表示参与者当前不在临界区内。
pub(crate) const INACTIVE_EPOCH: usize = usize::MAX;

/// Slot recording the epoch a participant observed when it entered.
///
/// Cache-aligned to prevent false sharing between participants.
///
/// 记录参与者进入时观察到的纪元的槽位。
/// 缓存对齐以防止参与者之间的伪共享。
#[derive(Debug)]
#[repr(align(64))]
pub(crate) struct ReaderSlot {
    /// The observed epoch, or `INACTIVE_EPOCH`.
    pub(crate) active_epoch: AtomicUsize,
}

/// Tunables fixed at construction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReclaimerSettings {
    pub(crate) auto_reclaim_threshold: Option<usize>,
    pub(crate) cleanup_interval: usize,
    pub(crate) growth_warning: usize,
}

/// State shared by every handle of one reclaimer.
///
/// 同一回收器所有句柄共享的状态。
pub(crate) struct SharedState {
    /// The global monotonic epoch counter.
    /// 全局单调纪元计数器。
    pub(crate) global_epoch: CachePadded<AtomicUsize>,
    /// Objects retired since the last sweep, tagged with their retirement epoch.
    /// Lock-free so that concurrent writers never wait on each other to retire.
    /// 自上次清扫以来退休的对象，带有退休纪元标签。
    pub(crate) pending: SegQueue<(usize, RetiredObject)>,
    /// Number of objects retired but not yet freed (pending plus swept-but-kept).
    pub(crate) retired: CachePadded<AtomicUsize>,
    /// Epoch-ordered retired list. Only the thread holding this lock sweeps.
    /// 按纪元排序的已退休列表。只有持有此锁的线程执行清扫。
    pub(crate) garbage: Mutex<GarbageSet>,
    /// All registered participant slots.
    /// 所有已注册参与者的槽位。
    pub(crate) readers: Mutex<Vec<Arc<ReaderSlot>>>,
    pub(crate) settings: ReclaimerSettings,
}

impl SharedState {
    pub(crate) fn new(settings: ReclaimerSettings) -> Self {
        Self {
            global_epoch: CachePadded::new(AtomicUsize::new(0)),
            pending: SegQueue::new(),
            retired: CachePadded::new(AtomicUsize::new(0)),
            garbage: Mutex::new(GarbageSet::new()),
            readers: Mutex::new(Vec::new()),
            settings,
        }
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("global_epoch", &self.global_epoch.load(Ordering::Relaxed))
            .field("retired", &self.retired.load(Ordering::Relaxed))
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
