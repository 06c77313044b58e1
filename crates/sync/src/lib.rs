//! Lock primitives used throughout the troupe runtime.
//!
//! * [`Spinlock`]: busy-waiting mutex for very short critical sections.
//! * [`CombinedLock`]: mutex plus condition variable whose waiters spin for a
//!   bounded period before parking. Demand queues are built on it.
//! * [`MutexPool`]: a fixed set of mutexes selected by key hash, used to shard
//!   dictionaries without one global lock.

#![warn(missing_docs)]

mod combined;
mod pool;
mod spinlock;

pub use combined::CombinedLock;
pub use parking_lot::MutexGuard;
pub use pool::MutexPool;
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};
