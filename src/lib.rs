/*!
Concurrent priority queues built on a time-bounded FIFO queue lock.

The crate contains three pieces:

* `TimeoutLock` - a queue lock with FIFO-ish admission whose acquisition
  attempt is bounded by a caller-supplied duration.  A waiter that runs out of
  patience unlinks itself from the queue and reports failure instead of
  blocking forever.
* `CoarseQueue` - a sorted singly linked list guarded end-to-end by a single
  `TimeoutLock`.  No concurrency between operations, but trivially correct:
  the total order of operations is the lock admission order.
* `FineQueue` - a sorted singly linked list where every node carries its own
  `TimeoutLock`.  Operations traverse optimistically without locks, lock only
  the nodes they are about to touch, revalidate, and retry if the list changed
  underneath them.  Removal tombstones a node before unlinking it.

Both queues implement the same `PriorityQueue` contract, so they can be driven
interchangeably by the same tests and benchmarks.

```
use prioqueue::FineQueue;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

let queue = Arc::new(FineQueue::new(Duration::from_millis(500)));

let mut workers = Vec::new();
for value in 0..4 {
    let queue = queue.clone();
    workers.push(thread::spawn(move || queue.insert(value).unwrap()));
}
for worker in workers { worker.join().unwrap(); }

let mut drained = Vec::new();
while let Some(value) = queue.extract_min().unwrap() {
    drained.push(value);
}
assert_eq!(drained, vec![0, 1, 2, 3]);
```

## Timeouts

Every operation that needs a lock can fail with `TimeoutError` if the lock is
not granted within the queue's configured patience.  Timeouts are never
retried internally; the retry policy belongs to the caller.  The fine queue
*does* retry internally, but only around validation failures, where the list
changed between the optimistic traversal and the lock grant.

## Poisoning

As with the locks this crate grew out of, there is no poisoning: a thread
panicking while holding a lock leaves the protected data as it was, and the
lock is released by the guard's destructor as usual.
*/

#[macro_use]
extern crate log;
#[cfg(test)]
extern crate rand;

mod arena;
mod types;

pub mod coarse;
pub mod fine;
pub mod lock;

pub use coarse::CoarseQueue;
pub use fine::FineQueue;
pub use lock::{LockGuard, TimeoutLock};
pub use types::{PriorityQueue, TimeoutError};
