use std::error::Error;
use std::fmt;

/// The contract shared by both queue implementations.
///
/// Values are non-negative integer priorities; `-1` is reserved internally as
/// the "nothing here" marker.  Duplicates are permitted and not coalesced.
pub trait PriorityQueue {
    /// Inserts `value` at its sorted position.
    ///
    /// Fails with `TimeoutError` if a required lock was not granted within
    /// the queue's patience.
    fn insert(&self, value: i64) -> Result<(), TimeoutError>;

    /// Removes and returns the minimum value, or `None` if the queue is
    /// empty.
    ///
    /// Fails with `TimeoutError` if a required lock was not granted within
    /// the queue's patience.
    fn extract_min(&self) -> Result<Option<i64>, TimeoutError>;

    /// Diagnostic listing of the values currently in the queue, in head-to-
    /// tail order.  Not part of the correctness contract: under concurrent
    /// mutation it may observe a transient state.
    fn snapshot(&self) -> Vec<i64>;
}

/// A lock was not granted within its patience bound.
///
/// The operation that reports this has released every lock it acquired and
/// has not modified the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutError;

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("timed out waiting for the queue lock")
    }
}

impl Error for TimeoutError {}
