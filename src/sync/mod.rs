// Low-level synchronization primitives for driver threads.
//
// These are the building blocks under the memory subsystem: lock-free
// counters, an unfair test-and-set spinlock and a reader/writer
// spinlock. Blocking mutexes (parking_lot) stay on the cold paths; the
// primitives here are for critical sections measured in microseconds.

pub mod atomic;
pub mod rwlock;
pub mod spinlock;

pub use atomic::{AtomicCounter, AtomicCounter64};
pub use rwlock::{RwSpinlock, RwSpinlockReadGuard, RwSpinlockWriteGuard};
pub use spinlock::{Spinlock, SpinlockGuard};
