// The MIT License (MIT)

// Copyright (c) 2015 Rustcc developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! A stale-tolerant min-heap of `(deadline, owner)` pairs.
//!
//! Two independent instances of this type exist in the running scheduler: one
//! owned by `scheduler` for `suspend(timeout)` sleeps, one owned by `notifier`
//! for per-socket operation timeouts. They are kept separate rather than
//! merged into one priority queue, since unifying sleep and I/O-timeout
//! ordering would change which fires first when both land on the same turn.
//!
//! A heap entry becomes *stale* when its owner's authoritative deadline has
//! moved on since the entry was pushed (the owner was resumed, or a new
//! timeout superseded the old one). Rather than reach into the heap to
//! remove the old entry, callers simply drop stale entries when they are
//! popped off the front: `drain_expired` hands back every entry whose
//! deadline has passed, and it is the caller's job (via `is_current`) to
//! recognize and discard the stale ones.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

struct Entry<K> {
    deadline: Instant,
    owner: K,
}

impl<K> PartialEq for Entry<K> {
    fn eq(&self, other: &Entry<K>) -> bool {
        self.deadline == other.deadline
    }
}

impl<K> Eq for Entry<K> {}

impl<K> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Entry<K>) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Entry<K> {
    // Reversed so that `BinaryHeap`, a max-heap, pops the *earliest* deadline
    // first.
    fn cmp(&self, other: &Entry<K>) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

/// A min-heap of `(deadline, owner)` timer entries, tolerant of stale pops.
pub(crate) struct TimerHeap<K> {
    heap: BinaryHeap<Entry<K>>,
}

impl<K> TimerHeap<K> {
    pub(crate) fn new() -> TimerHeap<K> {
        TimerHeap { heap: BinaryHeap::new() }
    }

    /// Install a new timer entry. Does not attempt to find and replace any
    /// existing entry for the same owner; the old one is left to be
    /// recognized as stale and discarded when it is eventually popped.
    pub(crate) fn insert(&mut self, deadline: Instant, owner: K) {
        self.heap.push(Entry { deadline, owner });
    }

    /// The earliest deadline still queued, if any (used by the scheduler loop
    /// to bound how long the next `notifier.poll` may block).
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pop every entry whose deadline is `<= now`, in deadline order. The
    /// caller is responsible for discarding entries whose owner's
    /// authoritative deadline no longer matches the popped deadline.
    pub(crate) fn drain_expired(&mut self, now: Instant) -> Vec<(K, Instant)> {
        let mut expired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let Entry { deadline, owner } = self.heap.pop().unwrap();
            expired.push((owner, deadline));
        }
        expired
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pops_in_deadline_order() {
        let base = Instant::now();
        let mut heap: TimerHeap<u32> = TimerHeap::new();
        heap.insert(base + Duration::from_millis(30), 3);
        heap.insert(base + Duration::from_millis(10), 1);
        heap.insert(base + Duration::from_millis(20), 2);

        let expired = heap.drain_expired(base + Duration::from_millis(25));
        let owners: Vec<u32> = expired.into_iter().map(|(k, _)| k).collect();
        assert_eq!(owners, vec![1, 2]);
        assert_eq!(heap.next_deadline(), Some(base + Duration::from_millis(30)));
    }

    #[test]
    fn empty_heap_has_no_next_deadline() {
        let heap: TimerHeap<u32> = TimerHeap::new();
        assert!(heap.is_empty());
        assert_eq!(heap.next_deadline(), None);
    }

    #[test]
    fn stale_entries_are_still_handed_back_for_the_caller_to_discard() {
        // Two entries for the same owner: the second supersedes the first,
        // but the heap itself does not know that. Both come back from
        // `drain_expired`; recognizing the first as stale is the caller's
        // job.
        let base = Instant::now();
        let mut heap: TimerHeap<u32> = TimerHeap::new();
        heap.insert(base + Duration::from_millis(10), 1);
        heap.insert(base + Duration::from_millis(11), 1);

        let expired = heap.drain_expired(base + Duration::from_millis(20));
        assert_eq!(expired.len(), 2);
    }
}
