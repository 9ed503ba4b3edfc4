/*!
An append-only slot arena.

Both the timeout lock and the fine-grained queue refer to their nodes by
index rather than by pointer.  Indices come from a single monotone counter,
so they double as generation numbers: an index is never handed out twice
while the arena is alive, which makes index-keyed compare-and-swap immune to
ABA.  Abandoned slots (a lock attempt that timed out, a tombstoned queue
node) simply stay in the arena until it is dropped.
*/

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Number of segments.  Segment `k` holds `FIRST_SEGMENT << k` slots.
const SEGMENTS: usize = 24;
/// Slots in segment 0.
const FIRST_SEGMENT: usize = 32;

/// Total number of slots an arena can hand out.
pub const CAPACITY: usize = FIRST_SEGMENT * ((1 << SEGMENTS) - 1);

/// A table of slots with stable addresses, growable without moving anything.
///
/// Storage is a fixed spine of geometrically sized segments, installed on
/// demand; a slot, once written, stays at the same address for the arena's
/// whole lifetime, so `get` can return plain shared references.
pub struct Arena<T> {
    segments: Box<[AtomicPtr<Slot<T>>]>,
    next: AtomicUsize,
}

struct Slot<T>(UnsafeCell<Option<T>>);

/* Note [Slot publication]

`alloc` claims an index with a fetch_add, writes the slot non-atomically, and
only then returns the index to the caller.  Callers may share that index with
other threads exclusively through an atomic store (the lock's tail, a queue
node's `next` pointer, the queue head).  A thread calling `get` therefore
obtained the index through an atomic load that synchronises with the store
publishing it, which makes the slot write visible.  After publication the
slot is never written again through the `UnsafeCell`; all further mutation
goes through the atomics (or locks) inside `T` itself.

Indices claimed past `CAPACITY` are reported as exhaustion (`None`), never
as a panic: callers translate this into their ordinary failure path.
*/

unsafe impl<T: Send> Send for Arena<T> {}
unsafe impl<T: Send + Sync> Sync for Arena<T> {}

impl<T> Arena<T> {
    pub fn new() -> Arena<T> {
        let mut segments = Vec::with_capacity(SEGMENTS);
        for _ in 0..SEGMENTS {
            segments.push(AtomicPtr::new(ptr::null_mut()));
        }
        Arena {
            segments: segments.into_boxed_slice(),
            next: AtomicUsize::new(0),
        }
    }

    /// Stores `value` in a fresh slot and returns its index, or `None` if the
    /// arena is out of slots.
    pub fn alloc(&self, value: T) -> Option<usize> {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        if index >= CAPACITY {
            return None;
        }
        let (segment, offset) = locate(index);
        let base = self.segment(segment);
        // The fetch_add made `index` ours alone; see Note [Slot publication].
        unsafe {
            *(*base.add(offset)).0.get() = Some(value);
        }
        Some(index)
    }

    /// Returns the slot at `index`, which must have come from `alloc` on this
    /// arena (directly, or through an atomic that published it).
    pub fn get(&self, index: usize) -> &T {
        debug_assert!(index < CAPACITY);
        let (segment, offset) = locate(index);
        let base = self.segments[segment].load(Ordering::Acquire);
        debug_assert!(!base.is_null());
        unsafe {
            match *(*base.add(offset)).0.get() {
                Some(ref value) => value,
                None => panic!("arena: slot {} read before it was written", index),
            }
        }
    }

    /// Returns the segment base pointer, installing the segment first if no
    /// thread has yet.
    fn segment(&self, segment: usize) -> *mut Slot<T> {
        let installed = self.segments[segment].load(Ordering::Acquire);
        if !installed.is_null() {
            return installed;
        }
        let fresh = new_segment::<T>(segment_len(segment));
        match self.segments[segment].compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => fresh,
            Err(winner) => {
                // Lost the install race; nothing was written into our copy.
                unsafe {
                    drop(Vec::from_raw_parts(fresh, segment_len(segment), segment_len(segment)));
                }
                winner
            }
        }
    }
}

impl<T> Drop for Arena<T> {
    fn drop(&mut self) {
        for segment in 0..SEGMENTS {
            let base = *self.segments[segment].get_mut();
            if !base.is_null() {
                unsafe {
                    drop(Vec::from_raw_parts(base, segment_len(segment), segment_len(segment)));
                }
            }
        }
    }
}

fn new_segment<T>(len: usize) -> *mut Slot<T> {
    let mut slots: Vec<Slot<T>> = Vec::with_capacity(len);
    for _ in 0..len {
        slots.push(Slot(UnsafeCell::new(None)));
    }
    Box::into_raw(slots.into_boxed_slice()) as *mut Slot<T>
}

fn segment_len(segment: usize) -> usize {
    FIRST_SEGMENT << segment
}

/// Maps an index to its (segment, offset) pair.  Segment `k` covers indices
/// `FIRST_SEGMENT * (2^k - 1) ..`, so the segment number is the floored log of
/// the shifted index.
fn locate(index: usize) -> (usize, usize) {
    let shifted = index / FIRST_SEGMENT + 1;
    let bits = mem::size_of::<usize>() * 8;
    let segment = bits - 1 - shifted.leading_zeros() as usize;
    let offset = index - FIRST_SEGMENT * ((1 << segment) - 1);
    (segment, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn locate_covers_segment_boundaries() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(FIRST_SEGMENT - 1), (0, FIRST_SEGMENT - 1));
        assert_eq!(locate(FIRST_SEGMENT), (1, 0));
        assert_eq!(locate(3 * FIRST_SEGMENT - 1), (1, 2 * FIRST_SEGMENT - 1));
        assert_eq!(locate(3 * FIRST_SEGMENT), (2, 0));
    }

    #[test]
    fn alloc_and_get_round_trip() {
        let arena: Arena<u64> = Arena::new();
        let mut indices = Vec::new();
        // Enough to spill into the third segment.
        for value in 0..(4 * FIRST_SEGMENT as u64) {
            indices.push(arena.alloc(value).unwrap());
        }
        for (value, &index) in indices.iter().enumerate() {
            assert_eq!(*arena.get(index), value as u64);
        }
    }

    #[test]
    fn indices_are_never_reused() {
        let arena: Arena<u8> = Arena::new();
        let a = arena.alloc(0).unwrap();
        let b = arena.alloc(0).unwrap();
        let c = arena.alloc(0).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn concurrent_alloc_yields_distinct_slots() {
        let arena: Arc<Arena<usize>> = Arc::new(Arena::new());
        let mut tids = Vec::new();
        for t in 0..8 {
            let arena = arena.clone();
            tids.push(thread::spawn(move || {
                let mut mine = Vec::new();
                for i in 0..500 {
                    let index = arena.alloc(t * 1000 + i).unwrap();
                    mine.push((index, t * 1000 + i));
                }
                mine
            }));
        }
        let mut all = Vec::new();
        for tid in tids {
            all.extend(tid.join().unwrap());
        }
        all.sort();
        for window in all.windows(2) {
            assert_ne!(window[0].0, window[1].0, "index handed out twice");
        }
        for &(index, value) in &all {
            assert_eq!(*arena.get(index), value);
        }
    }
}
