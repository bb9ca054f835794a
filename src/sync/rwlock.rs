// Reader/writer spinlock over a single 32-bit counter.
//
// State encoding: 0 = unlocked, n > 0 = n readers, -1 = writer.
// Writers spin until the counter is zero and CAS it to -1; readers spin
// while it is negative and CAS n -> n + 1. Neither side is fair.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::arch;

/// Reader/writer spinlock protecting `T`.
#[repr(align(64))]
pub struct RwSpinlock<T> {
    cnt: AtomicI32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwSpinlock<T> {}
unsafe impl<T: Send + Sync> Sync for RwSpinlock<T> {}

impl<T> RwSpinlock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            cnt: AtomicI32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Take a read lock, spinning while a writer holds the lock.
    pub fn read(&self) -> RwSpinlockReadGuard<'_, T> {
        loop {
            let x = self.cnt.load(Ordering::Acquire);
            if x < 0 {
                arch::pause();
                continue;
            }
            if self
                .cnt
                .compare_exchange_weak(x, x + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return RwSpinlockReadGuard { lock: self };
            }
        }
    }

    /// Take the write lock, spinning while any lock is held.
    pub fn write(&self) -> RwSpinlockWriteGuard<'_, T> {
        loop {
            let x = self.cnt.load(Ordering::Acquire);
            if x != 0 {
                arch::pause();
                continue;
            }
            if self
                .cnt
                .compare_exchange_weak(0, -1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return RwSpinlockWriteGuard { lock: self };
            }
        }
    }

    /// Current raw counter value, for diagnostics.
    pub fn reader_count(&self) -> i32 {
        self.cnt.load(Ordering::Relaxed)
    }
}

pub struct RwSpinlockReadGuard<'a, T> {
    lock: &'a RwSpinlock<T>,
}

impl<T> Deref for RwSpinlockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwSpinlockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.cnt.fetch_sub(1, Ordering::Release);
    }
}

pub struct RwSpinlockWriteGuard<'a, T> {
    lock: &'a RwSpinlock<T>,
}

impl<T> Deref for RwSpinlockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwSpinlockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwSpinlockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.cnt.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_multiple_readers() {
        let lock = RwSpinlock::new(42u32);
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(*r1, 42);
        assert_eq!(*r2, 42);
        assert_eq!(lock.reader_count(), 2);
        drop(r1);
        drop(r2);
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn test_writer_excludes() {
        let lock = RwSpinlock::new(0u32);
        {
            let mut w = lock.write();
            *w = 9;
            assert_eq!(lock.reader_count(), -1);
        }
        assert_eq!(*lock.read(), 9);
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let lock = Arc::new(RwSpinlock::new(0u64));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..2_000 {
                    *lock.write() += 1;
                }
            }));
        }
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                let mut last = 0;
                for _ in 0..2_000 {
                    let v = *lock.read();
                    // Writers only ever increment.
                    assert!(v >= last);
                    last = v;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.read(), 8_000);
    }
}
