// Cross-thread stress for the synchronization primitives.

use std::sync::Arc;

use rusty_nvme::sync::{AtomicCounter, AtomicCounter64, RwSpinlock, Spinlock};

#[test]
fn test_spinlock_mutual_exclusion() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 20_000;

    let lock = Arc::new(Spinlock::new((0u64, 0u64)));
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let lock = Arc::clone(&lock);
        handles.push(std::thread::spawn(move || {
            for _ in 0..ROUNDS {
                let mut guard = lock.lock();
                // Both halves mutate under the lock; a race would let
                // them drift apart.
                guard.0 += 1;
                guard.1 += 1;
                assert_eq!(guard.0, guard.1);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let guard = lock.lock();
    assert_eq!(guard.0, (THREADS * ROUNDS) as u64);
    assert_eq!(guard.1, (THREADS * ROUNDS) as u64);
}

#[test]
fn test_rwlock_readers_see_consistent_pairs() {
    const WRITERS: usize = 2;
    const READERS: usize = 6;
    const ROUNDS: usize = 10_000;

    let lock = Arc::new(RwSpinlock::new((0u64, 0u64)));
    let mut handles = Vec::new();

    for _ in 0..WRITERS {
        let lock = Arc::clone(&lock);
        handles.push(std::thread::spawn(move || {
            for _ in 0..ROUNDS {
                let mut guard = lock.write();
                guard.0 += 1;
                guard.1 += 2;
            }
        }));
    }
    for _ in 0..READERS {
        let lock = Arc::clone(&lock);
        handles.push(std::thread::spawn(move || {
            for _ in 0..ROUNDS {
                let guard = lock.read();
                assert_eq!(guard.1, guard.0 * 2);
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
    let guard = lock.read();
    assert_eq!(guard.0, (WRITERS * ROUNDS) as u64);
}

#[test]
fn test_counters_under_contention() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 25_000;

    let c32 = Arc::new(AtomicCounter::new());
    let c64 = Arc::new(AtomicCounter64::new());
    let gate = Arc::new(AtomicCounter::new());

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let c32 = Arc::clone(&c32);
        let c64 = Arc::clone(&c64);
        let gate = Arc::clone(&gate);
        handles.push(std::thread::spawn(move || {
            let mut wins = 0u32;
            for _ in 0..ROUNDS {
                c32.inc();
                c64.add(3);
                if gate.test_and_set() {
                    wins += 1;
                    gate.clear();
                }
            }
            wins
        }));
    }

    let mut total_wins = 0u32;
    for h in handles {
        total_wins += h.join().unwrap();
    }

    assert_eq!(c32.read(), (THREADS * ROUNDS) as i32);
    assert_eq!(c64.read(), (THREADS * ROUNDS * 3) as i64);
    // The gate is exclusive: every win was a real 0 -> 1 transition.
    assert!(total_wins > 0);
    assert_eq!(gate.read(), 0);
}
