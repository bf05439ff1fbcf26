//! Recoverable outcomes of the primitives, plus harness configuration errors.
//!
//! None of these are exceptional: callers are expected to branch on them.

use std::fmt;

/// `enqueue` found the queue at capacity. Carries the rejected value back.
///
/// 入队时队列已满。携带被拒绝的值返回。
#[derive(Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue is full")]
pub struct Full<T>(pub T);

impl<T> Full<T> {
    /// Recover the value that could not be enqueued.
    #[inline]
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Full").finish_non_exhaustive()
    }
}

/// `dequeue` found no published element.
///
/// 出队时没有已发布的元素。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue is empty")]
pub struct Empty;

/// `compare_and_write` lost a race: the current snapshot is not the expected version.
/// Carries the unpublished value back.
///
/// `compare_and_write` 竞争失败：当前快照不是预期版本。携带未发布的值返回。
#[derive(Clone, PartialEq, Eq, thiserror::Error)]
#[error("stale write: expected version {expected}, current version is {current}")]
pub struct Stale<T> {
    pub expected: u64,
    pub current: u64,
    pub value: T,
}

impl<T> Stale<T> {
    /// Recover the value that was not published.
    #[inline]
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> fmt::Debug for Stale<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stale")
            .field("expected", &self.expected)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

/// A queue was requested with a capacity of zero, or one too large to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid queue capacity {requested}")]
pub struct InvalidCapacity {
    pub requested: usize,
}

/// Failure to load a harness configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}
