// Sequentially-consistent atomic counters.
//
// Every operation carries full ordering with respect to other accesses
// on the same counter, so callers never have to reason about orderings
// on the statistics and reference counts these back.

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

/// 32-bit atomic counter.
#[derive(Debug, Default)]
pub struct AtomicCounter {
    cnt: AtomicI32,
}

impl AtomicCounter {
    /// A counter starting at zero.
    pub const fn new() -> Self {
        Self {
            cnt: AtomicI32::new(0),
        }
    }

    /// A counter starting at `val`.
    pub const fn with_value(val: i32) -> Self {
        Self {
            cnt: AtomicI32::new(val),
        }
    }

    pub fn read(&self) -> i32 {
        self.cnt.load(Ordering::SeqCst)
    }

    pub fn set(&self, val: i32) {
        self.cnt.store(val, Ordering::SeqCst);
    }

    pub fn add(&self, inc: i32) {
        self.cnt.fetch_add(inc, Ordering::SeqCst);
    }

    pub fn sub(&self, dec: i32) {
        self.cnt.fetch_sub(dec, Ordering::SeqCst);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn dec(&self) {
        self.sub(1);
    }

    /// Add and return the post-addition value.
    pub fn add_return(&self, inc: i32) -> i32 {
        self.cnt.fetch_add(inc, Ordering::SeqCst).wrapping_add(inc)
    }

    /// Subtract and return the post-subtraction value.
    pub fn sub_return(&self, dec: i32) -> i32 {
        self.cnt.fetch_sub(dec, Ordering::SeqCst).wrapping_sub(dec)
    }

    /// Increment; true iff the counter reached zero.
    pub fn inc_and_test(&self) -> bool {
        self.add_return(1) == 0
    }

    /// Decrement; true iff the counter reached zero.
    pub fn dec_and_test(&self) -> bool {
        self.sub_return(1) == 0
    }

    /// Atomically set 0 -> 1; true iff this call performed the
    /// transition.
    pub fn test_and_set(&self) -> bool {
        self.cnt
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn clear(&self) {
        self.set(0);
    }
}

/// 64-bit atomic counter.
///
/// On targets where plain 64-bit loads and stores are not single
/// instructions, `read` and `set` go through a compare-and-swap retry
/// loop instead.
#[derive(Debug, Default)]
pub struct AtomicCounter64 {
    cnt: AtomicI64,
}

impl AtomicCounter64 {
    /// A counter starting at zero.
    pub const fn new() -> Self {
        Self {
            cnt: AtomicI64::new(0),
        }
    }

    /// A counter starting at `val`.
    pub const fn with_value(val: i64) -> Self {
        Self {
            cnt: AtomicI64::new(val),
        }
    }

    pub fn read(&self) -> i64 {
        #[cfg(target_pointer_width = "64")]
        {
            self.cnt.load(Ordering::SeqCst)
        }
        #[cfg(not(target_pointer_width = "64"))]
        {
            // Replace the value with itself to get an atomic 8-byte read.
            loop {
                let cur = self.cnt.load(Ordering::SeqCst);
                if self
                    .cnt
                    .compare_exchange_weak(cur, cur, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return cur;
                }
            }
        }
    }

    pub fn set(&self, val: i64) {
        #[cfg(target_pointer_width = "64")]
        {
            self.cnt.store(val, Ordering::SeqCst);
        }
        #[cfg(not(target_pointer_width = "64"))]
        {
            loop {
                let cur = self.cnt.load(Ordering::SeqCst);
                if self
                    .cnt
                    .compare_exchange_weak(cur, val, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return;
                }
            }
        }
    }

    pub fn add(&self, inc: i64) {
        self.cnt.fetch_add(inc, Ordering::SeqCst);
    }

    pub fn sub(&self, dec: i64) {
        self.cnt.fetch_sub(dec, Ordering::SeqCst);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn dec(&self) {
        self.sub(1);
    }

    /// Add and return the post-addition value.
    pub fn add_return(&self, inc: i64) -> i64 {
        self.cnt.fetch_add(inc, Ordering::SeqCst).wrapping_add(inc)
    }

    /// Subtract and return the post-subtraction value.
    pub fn sub_return(&self, dec: i64) -> i64 {
        self.cnt.fetch_sub(dec, Ordering::SeqCst).wrapping_sub(dec)
    }

    /// Increment; true iff the counter reached zero.
    pub fn inc_and_test(&self) -> bool {
        self.add_return(1) == 0
    }

    /// Decrement; true iff the counter reached zero.
    pub fn dec_and_test(&self) -> bool {
        self.sub_return(1) == 0
    }

    /// Atomically set 0 -> 1; true iff this call performed the
    /// transition.
    pub fn test_and_set(&self) -> bool {
        self.cnt
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn clear(&self) {
        self.set(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counter_basics() {
        let c = AtomicCounter::new();
        assert_eq!(c.read(), 0);
        c.set(5);
        c.add(3);
        c.sub(2);
        assert_eq!(c.read(), 6);
        c.inc();
        c.dec();
        assert_eq!(c.read(), 6);
        assert_eq!(c.add_return(4), 10);
        assert_eq!(c.sub_return(10), 0);
        c.clear();
        assert_eq!(c.read(), 0);
    }

    #[test]
    fn test_counter_tests() {
        let c = AtomicCounter::with_value(-1);
        assert!(c.inc_and_test());
        assert!(!c.inc_and_test());

        let c = AtomicCounter::with_value(2);
        assert!(!c.dec_and_test());
        assert!(c.dec_and_test());

        let c = AtomicCounter::new();
        assert!(c.test_and_set());
        assert!(!c.test_and_set());
        c.clear();
        assert!(c.test_and_set());
    }

    #[test]
    fn test_counter64_basics() {
        let c = AtomicCounter64::with_value(1 << 40);
        c.add(1);
        assert_eq!(c.read(), (1 << 40) + 1);
        assert_eq!(c.sub_return(1), 1 << 40);
        assert!(c.test_and_set() == false);
        c.clear();
        assert!(c.test_and_set());
        assert_eq!(c.read(), 1);
    }

    #[test]
    fn test_counter_concurrent_inc() {
        let c = Arc::new(AtomicCounter64::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = Arc::clone(&c);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    c.inc();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.read(), 40_000);
    }
}
