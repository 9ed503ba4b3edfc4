/*!
The coarse-grained queue: one timeout lock around a sorted linked list.

Every `insert` and `extract_min` is a single critical section under one
`TimeoutLock`, so the operations are totally ordered by lock admission and
the sortedness of the list is immediate.  This is the baseline the
fine-grained queue is measured against.
*/

use lock::TimeoutLock;
use std::cell::UnsafeCell;
use std::fmt;
use std::time::Duration;
use types::{PriorityQueue, TimeoutError};

/// Lock timeouts `snapshot` tolerates before returning an empty listing.
const SNAPSHOT_ATTEMPTS: u32 = 5;

/// A value-ordered singly linked list guarded end-to-end by one lock.
pub struct CoarseQueue {
    lock: TimeoutLock,
    patience: Duration,
    // Touched only between a successful `try_lock` and the drop of its
    // guard; see Note [List access].
    head: UnsafeCell<Option<Box<Node>>>,
}

struct Node {
    value: i64,
    next: Option<Box<Node>>,
}

/* Note [List access]

`head` is read and written exclusively while holding `lock`, so each unsafe
dereference below has exclusive access for as long as the guard on the same
call path is alive.  `with_priorities` also writes `head` without the lock,
but it still owns the queue at that point and nothing else can observe it.
*/

unsafe impl Send for CoarseQueue {}
unsafe impl Sync for CoarseQueue {}

impl CoarseQueue {
    /// Creates an empty queue whose lock acquisitions give up after
    /// `patience`.
    pub fn new(patience: Duration) -> CoarseQueue {
        CoarseQueue {
            lock: TimeoutLock::new(),
            patience: patience,
            head: UnsafeCell::new(None),
        }
    }

    /// Creates a queue pre-populated with the priorities `1..=count`.
    pub fn with_priorities(count: u64, patience: Duration) -> CoarseQueue {
        let queue = CoarseQueue::new(patience);
        {
            let head = unsafe { &mut *queue.head.get() };
            for value in (1..count + 1).rev() {
                let next = head.take();
                *head = Some(Box::new(Node { value: value as i64, next: next }));
            }
        }
        queue
    }

    /// Inserts `value` at its sorted position.  `value` must be
    /// non-negative.
    pub fn insert(&self, value: i64) -> Result<(), TimeoutError> {
        debug_assert!(value >= 0, "negative values are reserved");
        let guard = self.lock.try_lock(self.patience).ok_or(TimeoutError)?;
        {
            let mut cursor = unsafe { &mut *self.head.get() };
            while cursor.as_ref().map_or(false, |node| node.value < value) {
                cursor = &mut cursor.as_mut().unwrap().next;
            }
            let next = cursor.take();
            *cursor = Some(Box::new(Node { value: value, next: next }));
        }
        drop(guard);
        Ok(())
    }

    /// Removes and returns the minimum value, or `None` if the queue is
    /// empty.
    pub fn extract_min(&self) -> Result<Option<i64>, TimeoutError> {
        let guard = self.lock.try_lock(self.patience).ok_or(TimeoutError)?;
        let result = {
            let head = unsafe { &mut *self.head.get() };
            match head.take() {
                Some(node) => {
                    let Node { value, next } = *node;
                    *head = next;
                    Some(value)
                }
                None => None,
            }
        };
        drop(guard);
        Ok(result)
    }

    /// Diagnostic listing of the current values, head to tail.
    ///
    /// Retries past a few lock timeouts, then gives up and returns an empty
    /// listing: no wait in this crate is unbounded, the diagnostics
    /// included.  Meant for tests and tracing only.
    pub fn snapshot(&self) -> Vec<i64> {
        let mut attempts = 0;
        let guard = loop {
            if let Some(guard) = self.lock.try_lock(self.patience) {
                break guard;
            }
            attempts += 1;
            if attempts == SNAPSHOT_ATTEMPTS {
                return Vec::new();
            }
        };
        let mut values = Vec::new();
        {
            let mut cursor = unsafe { &*self.head.get() };
            while let Some(ref node) = *cursor {
                values.push(node.value);
                cursor = &node.next;
            }
        }
        drop(guard);
        values
    }
}

impl PriorityQueue for CoarseQueue {
    fn insert(&self, value: i64) -> Result<(), TimeoutError> {
        CoarseQueue::insert(self, value)
    }

    fn extract_min(&self) -> Result<Option<i64>, TimeoutError> {
        CoarseQueue::extract_min(self)
    }

    fn snapshot(&self) -> Vec<i64> {
        CoarseQueue::snapshot(self)
    }
}

impl fmt::Debug for CoarseQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.snapshot()).finish()
    }
}
