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

//! Cooperative synchronization primitives.
//!
//! Because the scheduler never preempts a running coroutine, `Lock` and
//! `Condition` do not need to serialize anything — at most one coroutine is
//! ever inside a critical section at a time regardless of whether one is
//! used. They exist purely as structured-invariant checkers: misuse (double
//! acquire, releasing a lock you don't hold) is a logic error and panics
//! rather than silently doing the wrong thing.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use crate::coroutine::{current_coroutine, CoroId};
use crate::scheduler;

/// A cooperative lock with a single owner. See the module docs: this is a
/// checker, not a mutex.
pub struct Lock {
    owner: Cell<Option<CoroId>>,
}

impl Lock {
    pub fn new() -> Lock {
        Lock { owner: Cell::new(None) }
    }

    /// Must be called from a coroutine while the lock is unheld.
    pub fn acquire(&self) {
        let id = current_coroutine().expect("Lock::acquire called outside a coroutine");
        if self.owner.get().is_some() {
            panic!("Lock::acquire: already held by another coroutine");
        }
        self.owner.set(Some(id));
    }

    /// Must be called by the coroutine currently holding the lock.
    pub fn release(&self) {
        let id = current_coroutine().expect("Lock::release called outside a coroutine");
        match self.owner.get() {
            Some(owner) if owner == id => self.owner.set(None),
            Some(_) => panic!("Lock::release: caller does not hold this lock"),
            None => panic!("Lock::release: lock is not held"),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.owner.get().is_some()
    }
}

impl Default for Lock {
    fn default() -> Lock {
        Lock::new()
    }
}

// `Lock` is meant to be shared between coroutines via `Arc`, since it is a
// primitive keyed on coroutine IDs: more than one coroutine holds a reference
// to the same instance. Its fields are plain `Cell`s, which are `!Sync`,
// because every method that touches them first
// calls `current_coroutine().expect(...)` — a call that panics unless it
// runs on the single scheduler thread. Real concurrent access never
// happens regardless of how many OS threads hold an `Arc<Lock>`, for the
// same reason `Scheduler` itself is `unsafe impl Sync` below its own
// non-`Sync` fields.
unsafe impl Sync for Lock {}

/// A cooperative condition variable: an edge-triggered `notified` flag plus
/// a FIFO queue of waiters.
pub struct Condition {
    notified: Cell<bool>,
    queue: RefCell<VecDeque<CoroId>>,
}

impl Condition {
    pub fn new() -> Condition {
        Condition {
            notified: Cell::new(false),
            queue: RefCell::new(VecDeque::new()),
        }
    }

    /// Block until `notify()` is observed. If the flag is already set, it is
    /// consumed and this returns immediately without suspending (`false`);
    /// otherwise the caller joins the wait queue, suspends, and re-enters
    /// this same check on every resume until the flag is set (`true`).
    pub fn wait(&self) -> bool {
        let id = current_coroutine().expect("Condition::wait called outside a coroutine");
        let mut suspended_at_least_once = false;
        loop {
            if self.notified.get() {
                self.notified.set(false);
                return suspended_at_least_once;
            }
            self.queue.borrow_mut().push_back(id);
            suspended_at_least_once = true;
            scheduler::suspend(None).expect("Condition::wait: suspend failed unexpectedly");
        }
    }

    /// Set the flag and, if anyone is waiting, wake the head of the queue.
    pub fn notify(&self) {
        self.notified.set(true);
        if let Some(head) = self.queue.borrow_mut().pop_front() {
            scheduler::resume(head, Box::new(()));
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.queue.borrow().is_empty()
    }
}

impl Default for Condition {
    fn default() -> Condition {
        Condition::new()
    }
}

// See the matching comment on `Lock` above: every method here is gated by
// `current_coroutine()`, so sharing a `Condition` across coroutines via
// `Arc` never results in concurrent access to its `Cell`/`RefCell` fields.
unsafe impl Sync for Condition {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lock_round_trip_inside_a_single_coroutine() {
        let lock = Lock::new();
        let handle = scheduler::spawn(move || {
            lock.acquire();
            assert!(lock.is_locked());
            lock.release();
            assert!(!lock.is_locked());
        });
        handle.value();
    }

    #[test]
    #[should_panic(expected = "already held")]
    fn double_acquire_panics() {
        let lock = Lock::new();
        let handle = scheduler::spawn(move || {
            lock.acquire();
            lock.acquire();
        });
        handle.value();
    }
}
