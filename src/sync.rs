#[cfg(feature = "loom")]
pub use loom::cell::Cell;
#[cfg(not(feature = "loom"))]
pub use std::cell::Cell;

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering, fence};
#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering, fence};

#[cfg(feature = "loom")]
pub use loom::sync::Arc;
#[cfg(not(feature = "loom"))]
pub use std::sync::Arc;

#[cfg(not(feature = "loom"))]
pub use antidote::Mutex;

#[cfg(feature = "loom")]
pub use loom::cell::UnsafeCell;

#[cfg(feature = "loom")]
#[derive(Debug, Default)]
pub struct Mutex<T>(loom::sync::Mutex<T>);

#[cfg(feature = "loom")]
impl<T> Mutex<T> {
    pub fn new(t: T) -> Self {
        Self(loom::sync::Mutex::new(t))
    }

    pub fn lock(&self) -> loom::sync::MutexGuard<'_, T> {
        self.0.lock().unwrap()
    }

    pub fn try_lock(&self) -> Result<loom::sync::MutexGuard<'_, T>, ()> {
        self.0.try_lock().map_err(|_| ())
    }
}

/// `std` cell exposing the closure-based access API of `loom::cell::UnsafeCell`,
/// so slot code reads the same under both builds.
/// 提供与 `loom::cell::UnsafeCell` 相同闭包接口的 `std` 单元。
#[cfg(not(feature = "loom"))]
#[derive(Debug)]
pub struct UnsafeCell<T>(std::cell::UnsafeCell<T>);

#[cfg(not(feature = "loom"))]
impl<T> UnsafeCell<T> {
    #[inline]
    pub fn new(data: T) -> Self {
        Self(std::cell::UnsafeCell::new(data))
    }

    #[inline]
    pub fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
        f(self.0.get())
    }
}

pub use crossbeam_utils::CachePadded;

/// Wait for another thread to finish a step it has already committed to.
///
/// Under loom a plain spin would never let the other thread run, so the model
/// yields instead.
/// 等待另一个线程完成它已承诺的步骤。loom 下改为让出执行权。
#[cfg(not(feature = "loom"))]
#[inline]
pub fn wait_for_peer(backoff: &crossbeam_utils::Backoff) {
    backoff.snooze();
}

#[cfg(feature = "loom")]
#[inline]
pub fn wait_for_peer(_backoff: &crossbeam_utils::Backoff) {
    loom::thread::yield_now();
}
