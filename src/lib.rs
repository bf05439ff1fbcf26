//! Shared-memory coordination primitives.
//!
//! - [`BoundedQueue`]: a fixed-capacity lock-free MPMC ring buffer coordinated by
//!   per-slot lap stamps. `enqueue`/`dequeue` fail fast with [`Full`]/[`Empty`].
//! - [`UnboundedQueue`]: a growable MPMC queue made of linked blocks. Drained blocks
//!   are handed to an [`EpochReclaimer`] instead of being freed in place.
//! - [`EpochReclaimer`]: epoch-based deferred reclamation. Threads [`register`] once and
//!   [`enter`] around shared reads; writers [`retire`] unlinked memory, which is freed
//!   only after every entered guard has moved past the retirement epoch.
//! - [`MultiAccess`]: a read-mostly shared value. Reads are wait-free and always see a
//!   complete snapshot; writes publish a new snapshot with one CAS and retire the old
//!   one through the reclaimer.
//!
//! Retry policy is left to the caller; [`Backoff`] is provided for that. The
//! [`harness`] module drives all of the above under load and compares the queue
//! against a reference implementation.
//!
//! ```
//! use sprawl::{BoundedQueue, MultiAccess};
//! use std::thread;
//!
//! let queue = BoundedQueue::new(64).unwrap();
//! let config = MultiAccess::new(1u32);
//!
//! thread::scope(|s| {
//!     s.spawn(|| {
//!         let accessor = config.accessor();
//!         for i in 0..10 {
//!             queue.enqueue(*accessor.read() + i).unwrap();
//!         }
//!     });
//! });
//!
//! let mut total = 0;
//! while let Ok(value) = queue.dequeue() {
//!     total += value;
//! }
//! assert_eq!(total, 55);
//! ```
//!
//! [`register`]: EpochReclaimer::register
//! [`enter`]: LocalEpoch::enter
//! [`retire`]: EpochReclaimer::retire

pub mod config;
mod error;
mod garbage;
pub mod harness;
mod multiaccess;
mod participant;
mod queue;
mod reclaimer;
mod state;
mod sync;
mod unbounded;

pub use crossbeam_utils::Backoff;
pub use error::{ConfigError, Empty, Full, InvalidCapacity, Stale};
pub use multiaccess::{Accessor, MultiAccess, SharedView};
pub use participant::{Guard, LocalEpoch};
pub use queue::BoundedQueue;
pub use reclaimer::{EpochReclaimer, EpochReclaimerBuilder};
pub use unbounded::{QueueHandle, UnboundedQueue};

#[cfg(all(test, not(feature = "loom")))]
mod tests;
