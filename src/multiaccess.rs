use crate::error::Stale;
use crate::participant::{Guard, LocalEpoch};
use crate::reclaimer::EpochReclaimer;
use crate::sync::{AtomicPtr, Ordering};
use crate::Backoff;
use std::boxed::Box;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::{self, NonNull};

/// An immutable published value and its version.
struct Snapshot<T> {
    version: u64,
    value: T,
}

/// A read-mostly shared value with wait-free reads and versioned, non-blocking writes.
///
/// `MultiAccess<T>` holds an atomic pointer to the current immutable snapshot.
/// Readers dereference it inside an epoch guard; writers allocate a new snapshot,
/// install it with a single compare-and-swap, and hand the previous one to the
/// [`EpochReclaimer`], which frees it once no guard can still be looking at it.
///
/// **Safety Contract**:
/// - Every read happens through a [`Guard`] registered with this container's
///   reclaimer. The low-level [`load`](Self::load) checks this with an `assert!`.
/// - A published snapshot is never mutated. A reader observes either the old or
///   the new value of a concurrent write, never a mix.
/// - Versions start at `0` and increase by exactly one per published snapshot.
///
/// **Typical Usage**:
/// ```
/// use sprawl::MultiAccess;
///
/// let shared = MultiAccess::new(String::from("v0"));
///
/// // One accessor per thread.
/// let accessor = shared.accessor();
/// assert_eq!(&*accessor.read(), "v0");
///
/// let version = accessor.write(String::from("v1"));
/// assert_eq!(version, 1);
///
/// // Optimistic writes fail when someone published in between.
/// let stale = accessor.compare_and_write(0, String::from("lost")).unwrap_err();
/// assert_eq!(stale.current, 1);
/// assert_eq!(&*accessor.read(), "v1");
/// ```
///
/// 一个以读为主的共享值，读取无等待，写入带版本且非阻塞。
/// `MultiAccess<T>` 持有指向当前不可变快照的原子指针。读者在纪元守卫内解引用它；
/// 写者分配新快照，用一次 CAS 安装，并把旧快照交给 [`EpochReclaimer`]，
/// 后者在没有守卫还能看到它时才释放。
/// **安全合约**：
/// - 所有读取都必须通过注册到本容器回收器的 [`Guard`] 进行。
/// - 已发布的快照永不被修改。读者看到并发写入的旧值或新值，绝不会看到混合值。
/// - 版本号从 `0` 开始，每发布一个快照恰好加一。
pub struct MultiAccess<T> {
    current: AtomicPtr<Snapshot<T>>,
    reclaimer: EpochReclaimer,
    advance_on_write: bool,
    _marker: PhantomData<T>,
}

impl<T: Send + Sync + 'static> MultiAccess<T> {
    /// Create a container with its own reclaimer.
    /// 创建一个拥有独立回收器的容器。
    #[inline]
    pub fn new(value: T) -> Self {
        Self::with_reclaimer(value, EpochReclaimer::new())
    }

    /// Create a container that retires snapshots through `reclaimer`.
    ///
    /// Several containers may share one reclaimer; a single guard then protects
    /// reads from all of them.
    ///
    /// 创建一个通过 `reclaimer` 退休快照的容器。多个容器可以共享一个回收器。
    pub fn with_reclaimer(value: T, reclaimer: EpochReclaimer) -> Self {
        let snapshot = Box::new(Snapshot { version: 0, value });
        Self {
            current: AtomicPtr::new(Box::into_raw(snapshot)),
            reclaimer,
            advance_on_write: true,
            _marker: PhantomData,
        }
    }

    /// Whether [`Accessor`] writes advance the epoch after publishing.
    ///
    /// When disabled, old snapshots are swept only by the reclaimer's automatic
    /// threshold or by explicit `advance_epoch()` calls.
    ///
    /// Default: `true`
    #[inline]
    pub fn advance_on_write(mut self, enabled: bool) -> Self {
        self.advance_on_write = enabled;
        self
    }

    #[inline]
    pub fn reclaimer(&self) -> &EpochReclaimer {
        &self.reclaimer
    }

    /// Register the calling thread and return its handle to this container.
    ///
    /// 注册调用线程并返回其访问本容器的句柄。
    #[inline]
    pub fn accessor(&self) -> Accessor<'_, T> {
        Accessor {
            container: self,
            local: self.reclaimer.register(),
        }
    }

    #[inline]
    fn snapshot<'a>(&'a self, guard: &'a Guard<'_>) -> &'a Snapshot<T> {
        assert!(
            guard.local().belongs_to(self.reclaimer.shared()),
            "guard was entered on a different EpochReclaimer than this container uses"
        );
        let ptr = self.current.load(Ordering::Acquire);
        // SAFETY:
        // 1. `ptr` is never null while `self` is alive.
        // 2. `guard` is registered with our reclaimer and entered before this load, so
        //    the snapshot cannot be freed until the guard drops.
        // 3. The returned lifetime is bounded by both `self` and `guard`.
        unsafe { &*ptr }
    }

    /// Read the current value under `guard`.
    ///
    /// Wait-free: one `Acquire` load, pairing with the publishing CAS of the writer.
    ///
    /// # Panics
    /// If `guard` was entered on a different reclaimer.
    ///
    /// 在 `guard` 下读取当前值。无等待：一次 `Acquire` 加载。
    #[inline]
    pub fn load<'a>(&'a self, guard: &'a Guard<'_>) -> &'a T {
        &self.snapshot(guard).value
    }

    /// Version of the current snapshot.
    #[inline]
    pub fn version(&self, guard: &Guard<'_>) -> u64 {
        self.snapshot(guard).version
    }

    /// Publish `value` unconditionally (last writer wins) and retire the snapshot it replaces.
    /// Returns the new version.
    ///
    /// This does not advance the epoch itself; [`Accessor::write`] does, after
    /// releasing its guard.
    ///
    /// 无条件发布 `value`（最后写入者获胜）并退休被替换的快照。返回新版本号。
    pub fn store(&self, value: T, guard: &Guard<'_>) -> u64 {
        match self.publish(None, value, guard) {
            Ok(version) => version,
            Err(_) => unreachable!("unconditional publish cannot be stale"),
        }
    }

    /// Publish `value` only if the current snapshot still has version `expected`.
    ///
    /// 仅当当前快照版本仍为 `expected` 时才发布 `value`。
    pub fn compare_and_store(
        &self,
        expected: u64,
        value: T,
        guard: &Guard<'_>,
    ) -> Result<u64, Stale<T>> {
        self.publish(Some(expected), value, guard)
    }

    /// Shared CAS loop of `store` and `compare_and_store`.
    ///
    /// Ordering: success is `SeqCst` (release of the new snapshot's contents, and a
    /// total order with guard entry); failure reloads with `Acquire` because the
    /// observed snapshot is dereferenced for its version.
    fn publish(&self, expected: Option<u64>, value: T, guard: &Guard<'_>) -> Result<u64, Stale<T>> {
        let mut current: *mut Snapshot<T> = ptr::from_ref(self.snapshot(guard)).cast_mut();
        let new = Box::into_raw(Box::new(Snapshot { version: 0, value }));

        loop {
            // SAFETY: `current` was loaded while `guard` is entered.
            let current_version = unsafe { (*current).version };

            if let Some(expected) = expected {
                if current_version != expected {
                    // SAFETY: `new` was never published.
                    let snapshot = unsafe { Box::from_raw(new) };
                    return Err(Stale {
                        expected,
                        current: current_version,
                        value: snapshot.value,
                    });
                }
            }

            let version = current_version + 1;
            // SAFETY: `new` is still private to this thread.
            unsafe { (*new).version = version };

            match self.current.compare_exchange_weak(
                current,
                new,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(old) => {
                    // SAFETY: the CAS unlinked `old`; readers that already hold it are
                    // protected by their guards, and the reclaimer now owns it.
                    self.reclaimer.retire(unsafe { Box::from_raw(old) });
                    return Ok(version);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Consume the container and return the current value.
    pub fn into_inner(self) -> T {
        let ptr = self.current.swap(ptr::null_mut(), Ordering::Relaxed);
        // SAFETY: `self` is owned, so no reader holds a guard on it, and `Drop`
        // skips the now-null pointer.
        let snapshot = unsafe { Box::from_raw(ptr) };
        snapshot.value
    }
}

impl<T> Drop for MultiAccess<T> {
    /// At drop time no other thread can reach the container, so the current
    /// snapshot is freed directly. Retired ones stay with the reclaimer.
    ///
    /// 在 drop 时没有其他线程能访问容器，因此直接释放当前快照。已退休的快照仍由回收器负责。
    fn drop(&mut self) {
        let ptr = self.current.load(Ordering::Relaxed);
        if !ptr.is_null() {
            unsafe {
                drop(Box::from_raw(ptr));
            }
        }
    }
}

impl<T> fmt::Debug for MultiAccess<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiAccess")
            .field("reclaimer", &self.reclaimer)
            .field("advance_on_write", &self.advance_on_write)
            .finish_non_exhaustive()
    }
}

/// A thread's handle to a [`MultiAccess`] container.
///
/// Owns the thread's [`LocalEpoch`], so it is `Send` but `!Sync`: create one per
/// thread with [`MultiAccess::accessor`].
///
/// 线程访问 [`MultiAccess`] 容器的句柄。拥有线程的 [`LocalEpoch`]，因此是 `Send` 但 `!Sync` 的。
pub struct Accessor<'a, T> {
    container: &'a MultiAccess<T>,
    local: LocalEpoch,
}

impl<'a, T: Send + Sync + 'static> Accessor<'a, T> {
    /// Wait-free read of the current snapshot.
    ///
    /// The view keeps this thread's guard entered for as long as it lives, so
    /// long-lived views delay reclamation.
    ///
    /// 无等待地读取当前快照。视图存活期间会保持本线程的守卫处于进入状态。
    #[inline]
    pub fn read(&self) -> SharedView<'_, T> {
        let guard = self.local.enter();
        let snapshot = NonNull::from(self.container.snapshot(&guard));
        SharedView { guard, snapshot }
    }

    /// Publish `value` and return its version.
    ///
    /// Concurrent writers are ordered only by the CAS on the snapshot pointer: the
    /// last one to succeed is what later reads see.
    ///
    /// 发布 `value` 并返回其版本号。并发写者仅由快照指针上的 CAS 排序。
    pub fn write(&self, value: T) -> u64 {
        let version = {
            let guard = self.local.enter();
            self.container.store(value, &guard)
        };
        self.after_publish();
        version
    }

    /// Publish `value` only if the current version is `expected`.
    ///
    /// Fails with [`Stale`], handing `value` back, if another write landed first.
    ///
    /// 仅当当前版本为 `expected` 时发布 `value`。若其他写入先完成，返回携带 `value` 的 [`Stale`]。
    pub fn compare_and_write(&self, expected: u64, value: T) -> Result<u64, Stale<T>> {
        let result = {
            let guard = self.local.enter();
            self.container.compare_and_store(expected, value, &guard)
        };
        if result.is_ok() {
            self.after_publish();
        }
        result
    }

    /// Read-copy-update: derive the next value from the current one and publish it,
    /// retrying on [`Stale`] until it lands. Returns the published version.
    ///
    /// `f` may run more than once and must not have side effects that matter.
    pub fn update<F>(&self, mut f: F) -> u64
    where
        F: FnMut(&T) -> T,
    {
        let backoff = Backoff::new();
        loop {
            let (expected, next) = {
                let view = self.read();
                (view.version(), f(&view))
            };
            match self.compare_and_write(expected, next) {
                Ok(version) => return version,
                Err(_) => backoff.spin(),
            }
        }
    }

    /// The thread's epoch registration, for entering guards directly.
    #[inline]
    pub fn local(&self) -> &LocalEpoch {
        &self.local
    }

    #[inline]
    pub fn container(&self) -> &'a MultiAccess<T> {
        self.container
    }

    fn after_publish(&self) {
        if self.container.advance_on_write {
            self.container.reclaimer.advance_epoch();
        }
    }
}

impl<T> fmt::Debug for Accessor<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor").field("local", &self.local).finish()
    }
}

/// A read-only view of one snapshot, kept alive by the guard it carries.
///
/// Derefs to `T`. `!Send`: it must be dropped on the thread that read it.
///
/// 一个快照的只读视图，由其携带的守卫保持存活。
pub struct SharedView<'g, T> {
    guard: Guard<'g>,
    snapshot: NonNull<Snapshot<T>>,
}

impl<T> SharedView<'_, T> {
    /// Version of the snapshot this view reads.
    #[inline]
    pub fn version(&self) -> u64 {
        // SAFETY: `self.guard` keeps the snapshot alive.
        unsafe { self.snapshot.as_ref().version }
    }

    /// The guard protecting this view.
    #[inline]
    pub fn guard(&self) -> &Guard<'_> {
        &self.guard
    }
}

impl<T> Deref for SharedView<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: `self.guard` keeps the snapshot alive.
        unsafe { &self.snapshot.as_ref().value }
    }
}

impl<T> Clone for SharedView<'_, T> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
            snapshot: self.snapshot,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedView")
            .field("version", &self.version())
            .field("value", &**self)
            .finish()
    }
}
