/*!
A FIFO queue lock whose acquisition attempt is bounded by a duration.

Each `try_lock` call claims a fresh slot in an arena and swaps the slot's
index into the lock's shared tail, capturing the previous tail as its
predecessor.  The caller then spins on the predecessor's slot until it reads
the `AVAILABLE` marker (the predecessor released) or its patience runs out.
A waiter that gives up unlinks itself: it either swings the tail back to its
predecessor, or - if someone already queued behind it - publishes its
predecessor's index in its own slot so the successor's spin loop can skip
past it.

Admission is FIFO among waiters that do not time out; a timeout trades that
fairness for liveness.  No wait here is ever unbounded.

The slot index returned by the swap is the acquisition token.  It lives in
the `LockGuard`, so ownership of the lock is an explicit value with no
thread-local state behind it: a guard may be sent to another thread and
dropped there, and the release still works.
*/

use arena::Arena;
use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Slot marker: the attempt owning this slot has released the lock.
const AVAILABLE: usize = usize::MAX;
/// Slot marker: no predecessor recorded.  Also the tail value of a free lock.
const NONE: usize = usize::MAX - 1;

/// Spins on the predecessor slot between yields to the scheduler.
const SPINS_PER_YIELD: u32 = 64;

/// A mutual-exclusion lock with FIFO-ish admission and a bounded wait.
pub struct TimeoutLock {
    tail: AtomicUsize,
    slots: Arena<AtomicUsize>,
}

impl TimeoutLock {
    /// Creates a new, unheld lock.
    pub fn new() -> TimeoutLock {
        TimeoutLock {
            tail: AtomicUsize::new(NONE),
            slots: Arena::new(),
        }
    }

    /// Attempts to acquire the lock, giving up after `patience`.
    ///
    /// Returns the guard holding the acquisition token on success, `None` on
    /// timeout.  An immediately free lock is acquired even with a zero
    /// patience.
    pub fn try_lock(&self, patience: Duration) -> Option<LockGuard<'_>> {
        let start = Instant::now();
        let me = match self.slots.alloc(AtomicUsize::new(NONE)) {
            Some(index) => index,
            // Out of slots: report failure rather than wait on memory that
            // will never appear.
            None => return None,
        };
        let mut pred = self.tail.swap(me, Ordering::SeqCst);
        if pred == NONE {
            return Some(LockGuard { lock: self, node: me });
        }
        let mut spins: u32 = 0;
        loop {
            let ahead = self.slots.get(pred).load(Ordering::SeqCst);
            if ahead == AVAILABLE {
                return Some(LockGuard { lock: self, node: me });
            }
            if ahead != NONE {
                // Our predecessor gave up and left a forwarding index.
                pred = ahead;
                continue;
            }
            if start.elapsed() >= patience {
                break;
            }
            spins = spins.wrapping_add(1);
            if spins % SPINS_PER_YIELD == 0 {
                thread::yield_now();
            } else {
                hint::spin_loop();
            }
        }
        // Timed out.  If we are still the tail, unlink by swinging the tail
        // back to the last live predecessor we saw; otherwise someone queued
        // behind us, so leave them the forwarding index instead.
        if self
            .tail
            .compare_exchange(me, pred, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.slots.get(me).store(pred, Ordering::SeqCst);
        }
        None
    }
}

impl fmt::Debug for TimeoutLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let tail = self.tail.load(Ordering::SeqCst);
        f.debug_struct("TimeoutLock")
            .field("engaged", &(tail != NONE))
            .finish()
    }
}

/// An RAII guard doubling as the acquisition token.  Dropping it releases
/// the lock.
#[must_use]
pub struct LockGuard<'a> {
    lock: &'a TimeoutLock,
    node: usize,
}

impl<'a> Drop for LockGuard<'a> {
    fn drop(&mut self) {
        // If nobody queued behind us the tail still holds our token and the
        // CAS frees the lock outright.  Otherwise mark our slot so the
        // successor's spin loop sees the release.
        if self
            .lock
            .tail
            .compare_exchange(self.node, NONE, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.lock.slots.get(self.node).store(AVAILABLE, Ordering::SeqCst);
        }
    }
}

impl<'a> fmt::Debug for LockGuard<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockGuard").field("node", &self.node).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn uncontended_acquire_with_zero_patience() {
        let lock = TimeoutLock::new();
        let guard = lock.try_lock(Duration::new(0, 0)).unwrap();
        drop(guard);
        // Free again: a second zero-patience attempt must also succeed.
        assert!(lock.try_lock(Duration::new(0, 0)).is_some());
    }

    #[test]
    fn mutual_exclusion() {
        let lock = Arc::new(TimeoutLock::new());
        let in_critical = Arc::new(AtomicBool::new(false));
        let mut tids = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let in_critical = in_critical.clone();
            tids.push(thread::spawn(move || {
                for _ in 0..200 {
                    let guard = loop {
                        if let Some(guard) = lock.try_lock(Duration::from_millis(100)) {
                            break guard;
                        }
                    };
                    assert!(!in_critical.swap(true, Ordering::SeqCst), "two holders at once");
                    in_critical.store(false, Ordering::SeqCst);
                    drop(guard);
                }
            }));
        }
        for tid in tids {
            tid.join().unwrap();
        }
    }

    #[test]
    fn timeout_fires_within_bound() {
        let lock = Arc::new(TimeoutLock::new());
        let guard = lock.try_lock(Duration::from_millis(10)).unwrap();

        let contender = lock.clone();
        let waited = thread::spawn(move || {
            let start = Instant::now();
            let attempt = contender.try_lock(Duration::from_millis(50));
            assert!(attempt.is_none());
            start.elapsed()
        })
        .join()
        .unwrap();

        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_secs(5), "wait was not bounded");
        drop(guard);
    }

    #[test]
    fn release_hands_over_to_waiter() {
        let lock = Arc::new(TimeoutLock::new());
        let guard = lock.try_lock(Duration::from_millis(10)).unwrap();

        let contender = lock.clone();
        let waiter = thread::spawn(move || {
            contender.try_lock(Duration::from_secs(10)).is_some()
        });

        thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn abandoned_waiter_leaves_lock_usable() {
        let lock = Arc::new(TimeoutLock::new());
        let guard = lock.try_lock(Duration::from_millis(10)).unwrap();

        // This waiter queues behind the holder and then gives up.
        let contender = lock.clone();
        thread::spawn(move || {
            assert!(contender.try_lock(Duration::from_millis(20)).is_none());
        })
        .join()
        .unwrap();

        drop(guard);
        assert!(lock.try_lock(Duration::from_millis(100)).is_some());
    }

    #[test]
    fn abandonment_mid_queue_forwards_to_successor() {
        let lock = Arc::new(TimeoutLock::new());
        let guard = lock.try_lock(Duration::from_millis(10)).unwrap();

        // First waiter gives up quickly; second keeps waiting.  The second
        // waiter can only get in by chasing the forwarding index the first
        // one left behind.
        let quick = lock.clone();
        let quick_tid = thread::spawn(move || {
            assert!(quick.try_lock(Duration::from_millis(10)).is_none());
        });
        thread::sleep(Duration::from_millis(2));
        let patient = lock.clone();
        let patient_tid = thread::spawn(move || {
            patient.try_lock(Duration::from_secs(10)).is_some()
        });

        quick_tid.join().unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(patient_tid.join().unwrap());
    }

    #[test]
    fn guard_can_be_released_by_another_thread() {
        // The token is an explicit value, not thread identity: a guard sent
        // elsewhere still releases correctly.
        let lock: &'static TimeoutLock = Box::leak(Box::new(TimeoutLock::new()));
        let guard = lock.try_lock(Duration::from_millis(10)).unwrap();

        let (tx, rx) = mpsc::channel();
        tx.send(guard).unwrap();
        thread::spawn(move || {
            let guard = rx.recv().unwrap();
            drop(guard);
        })
        .join()
        .unwrap();

        assert!(lock.try_lock(Duration::from_millis(10)).is_some());
    }
}
