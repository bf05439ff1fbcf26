mod concurrent_tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts its own drops, so tests can tell when the reclaimer actually freed something.
/// 统计自身被 drop 的次数，用于判断回收器是否真正释放了对象。
#[derive(Debug)]
pub(crate) struct DropCounter {
    drops: Arc<AtomicUsize>,
}

impl DropCounter {
    pub(crate) fn new(drops: &Arc<AtomicUsize>) -> Self {
        Self {
            drops: Arc::clone(drops),
        }
    }
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}
