/*!
The fine-grained queue: per-node locks, optimistic traversal, lazy deletion.

Every node carries its own `TimeoutLock`, so operations touching disjoint
stretches of the list can run concurrently.  Traversal takes no locks at
all; an operation locks only the one or two nodes it is about to change and
then *revalidates* the assumptions the unlocked walk made, retrying from the
top if the list moved underneath it.  Removal is lazy: the minimum is
tombstoned under its own lock, the head pointer is advanced past it, and
only then is the lock released - so a reader that still holds an index to
the dead node can tell it has been removed.

The queue keeps a resident head node.  An empty queue is the head node
holding the `EMPTY` marker; the first insert fills that node in place
instead of allocating, and extracting the last value resets it.  This keeps
the head pointer always valid and spares the empty/non-empty transitions a
structural relink.

The head pointer is the one piece of shared state that every operation must
re-read after taking a lock: it can move between an unlocked read and the
lock grant.  Only a thread holding the (old) head's lock ever advances it.

Timeout failures propagate to the caller immediately; only validation
failures are retried internally.
*/

use arena::Arena;
use lock::{LockGuard, TimeoutLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use types::{PriorityQueue, TimeoutError};

/// Value held by the resident head node while the queue is empty.
const EMPTY: i64 = -1;
/// `next` of the last node in the list.
const NIL: usize = usize::MAX;

/// A value-ordered singly linked list with one timeout lock per node.
pub struct FineQueue {
    /// Arena index of the current head node.  Always points at a node; an
    /// empty queue is the head node holding `EMPTY`.
    head: AtomicUsize,
    nodes: Arena<Node>,
    patience: Duration,
}

struct Node {
    value: AtomicI64,
    next: AtomicUsize,
    deleted: AtomicBool,
    lock: TimeoutLock,
}

impl Node {
    fn new(value: i64) -> Node {
        Node {
            value: AtomicI64::new(value),
            next: AtomicUsize::new(NIL),
            deleted: AtomicBool::new(false),
            lock: TimeoutLock::new(),
        }
    }
}

fn lock_or_timeout<'a>(
    lock: &'a TimeoutLock,
    patience: Duration,
) -> Result<LockGuard<'a>, TimeoutError> {
    lock.try_lock(patience).ok_or(TimeoutError)
}

impl FineQueue {
    /// Creates an empty queue whose lock acquisitions give up after
    /// `patience`.
    pub fn new(patience: Duration) -> FineQueue {
        let nodes = Arena::new();
        let head = nodes
            .alloc(Node::new(EMPTY))
            .expect("a fresh arena cannot be exhausted");
        FineQueue {
            head: AtomicUsize::new(head),
            nodes: nodes,
            patience: patience,
        }
    }

    /// Creates a queue pre-populated with the priorities `1..=count`.
    pub fn with_priorities(count: u64, patience: Duration) -> FineQueue {
        let queue = FineQueue::new(patience);
        let mut tail = queue.head.load(Ordering::SeqCst);
        for value in 1..count + 1 {
            if value == 1 {
                // First priority goes into the resident head node.
                queue.nodes.get(tail).value.store(1, Ordering::SeqCst);
            } else {
                let node = queue
                    .nodes
                    .alloc(Node::new(value as i64))
                    .expect("a fresh arena cannot be exhausted");
                queue.nodes.get(tail).next.store(node, Ordering::SeqCst);
                tail = node;
            }
        }
        queue
    }

    /// Inserts `value` at its sorted position.  `value` must be
    /// non-negative.
    ///
    /// Retries internally as long as validation keeps failing; a lock
    /// timeout is reported to the caller at once.
    pub fn insert(&self, value: i64) -> Result<(), TimeoutError> {
        debug_assert!(value >= 0, "negative values are reserved");
        loop {
            let head_index = self.head.load(Ordering::SeqCst);
            let head = self.nodes.get(head_index);
            let head_value = head.value.load(Ordering::SeqCst);

            if head_value == EMPTY {
                // Case 1: the queue looks empty.  Fill the resident head
                // node in place; no allocation.
                let guard = lock_or_timeout(&head.lock, self.patience)?;
                if self.head.load(Ordering::SeqCst) != head_index {
                    drop(guard);
                    continue;
                }
                if head.value.load(Ordering::SeqCst) != EMPTY {
                    // Someone filled it between our read and the lock grant.
                    drop(guard);
                    continue;
                }
                head.value.store(value, Ordering::SeqCst);
                return Ok(());
            }

            if head_value >= value {
                // Case 2: the value is the new minimum.  Link a fresh node
                // in front of the head and promote it.
                let guard = lock_or_timeout(&head.lock, self.patience)?;
                if self.head.load(Ordering::SeqCst) != head_index {
                    drop(guard);
                    continue;
                }
                if head.deleted.load(Ordering::SeqCst)
                    || head.value.load(Ordering::SeqCst) < value
                {
                    drop(guard);
                    continue;
                }
                let new_index = self.alloc_node(value)?;
                self.nodes.get(new_index).next.store(head_index, Ordering::SeqCst);
                self.head.store(new_index, Ordering::SeqCst);
                // Release the displaced head.
                drop(guard);
                return Ok(());
            }

            // Case 3: interior insertion.  The fresh node is locked while it
            // is still private, so that acquisition cannot contend; it stays
            // locked until the splice is done.
            let new_index = self.alloc_node(value)?;
            let new = self.nodes.get(new_index);
            let new_guard = lock_or_timeout(&new.lock, self.patience)?;

            let (prev_index, next_index) = self.search(value);
            let prev = self.nodes.get(prev_index);
            let prev_guard = lock_or_timeout(&prev.lock, self.patience)?;
            let next_guard = if next_index != NIL {
                Some(lock_or_timeout(
                    &self.nodes.get(next_index).lock,
                    self.patience,
                )?)
            } else {
                None
            };

            if self.validate(prev_index, next_index, value) {
                new.next.store(next_index, Ordering::SeqCst);
                prev.next.store(new_index, Ordering::SeqCst);
                drop(next_guard);
                drop(prev_guard);
                drop(new_guard);
                return Ok(());
            }
            // The neighbourhood changed before we got the locks; release
            // everything and restart from an unlocked read of the head.  The
            // abandoned node is never published, so it stays unreachable.
            drop(next_guard);
            drop(prev_guard);
            drop(new_guard);
        }
    }

    /// Removes and returns the minimum value, or `None` if the queue is
    /// empty.
    pub fn extract_min(&self) -> Result<Option<i64>, TimeoutError> {
        loop {
            let head_index = self.head.load(Ordering::SeqCst);
            let head = self.nodes.get(head_index);
            let guard = lock_or_timeout(&head.lock, self.patience)?;
            if self.head.load(Ordering::SeqCst) != head_index {
                // The head moved between the read and the lock grant.
                drop(guard);
                continue;
            }
            let value = head.value.load(Ordering::SeqCst);
            if value == EMPTY {
                return Ok(None);
            }
            if head.deleted.load(Ordering::SeqCst) {
                // A racing extractor tombstoned the node we just locked.
                // The tombstone and the head advance happen under the same
                // lock, so this should not be observable; retry and log in
                // case the protocol is ever broken.
                debug!("extract_min: locked head {} is tombstoned, retrying", head_index);
                drop(guard);
                continue;
            }
            let next_index = head.next.load(Ordering::SeqCst);
            if next_index == NIL {
                // Sole remaining value: reset the resident head in place
                // rather than unlinking it.
                head.value.store(EMPTY, Ordering::SeqCst);
                return Ok(Some(value));
            }
            head.deleted.store(true, Ordering::SeqCst);
            self.head.store(next_index, Ordering::SeqCst);
            // Release the tombstoned, now-unreachable node.
            drop(guard);
            return Ok(Some(value));
        }
    }

    /// Diagnostic listing of the reachable, non-tombstoned values, head to
    /// tail.  Takes no locks; under concurrent mutation this may observe a
    /// transient state.
    pub fn snapshot(&self) -> Vec<i64> {
        let mut values = Vec::new();
        let mut index = self.head.load(Ordering::SeqCst);
        while index != NIL {
            let node = self.nodes.get(index);
            let value = node.value.load(Ordering::SeqCst);
            if !node.deleted.load(Ordering::SeqCst) && value != EMPTY {
                values.push(value);
            }
            index = node.next.load(Ordering::SeqCst);
        }
        values
    }

    /// Optimistic walk: finds the adjacent pair `(prev, next)` the value
    /// belongs between.  Runs without locks; the caller locks the pair and
    /// then `validate`s it.
    fn search(&self, value: i64) -> (usize, usize) {
        let mut prev = self.head.load(Ordering::SeqCst);
        let mut next = self.nodes.get(prev).next.load(Ordering::SeqCst);
        while next != NIL && self.nodes.get(next).value.load(Ordering::SeqCst) < value {
            prev = next;
            next = self.nodes.get(prev).next.load(Ordering::SeqCst);
        }
        (prev, next)
    }

    /// Re-checks, with both locks held, the assumptions `search` made: the
    /// pair is still adjacent, neither side is tombstoned, and `value` still
    /// sorts between them.  The value checks also reject a `prev` that has
    /// been drained back to the `EMPTY` marker, which would otherwise let a
    /// splice trail values behind an empty head.
    fn validate(&self, prev_index: usize, next_index: usize, value: i64) -> bool {
        let prev = self.nodes.get(prev_index);
        if prev.deleted.load(Ordering::SeqCst) {
            return false;
        }
        let prev_value = prev.value.load(Ordering::SeqCst);
        if prev_value == EMPTY || prev_value >= value {
            return false;
        }
        if prev.next.load(Ordering::SeqCst) != next_index {
            return false;
        }
        if next_index == NIL {
            return true;
        }
        let next = self.nodes.get(next_index);
        !next.deleted.load(Ordering::SeqCst)
            && next.value.load(Ordering::SeqCst) >= value
    }

    fn alloc_node(&self, value: i64) -> Result<usize, TimeoutError> {
        // Arena exhaustion surfaces like a timeout: the operation fails
        // instead of waiting on slots that will never appear.
        self.nodes.alloc(Node::new(value)).ok_or(TimeoutError)
    }
}

impl PriorityQueue for FineQueue {
    fn insert(&self, value: i64) -> Result<(), TimeoutError> {
        FineQueue::insert(self, value)
    }

    fn extract_min(&self) -> Result<Option<i64>, TimeoutError> {
        FineQueue::extract_min(self)
    }

    fn snapshot(&self) -> Vec<i64> {
        FineQueue::snapshot(self)
    }
}

impl fmt::Debug for FineQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.snapshot()).finish()
    }
}
