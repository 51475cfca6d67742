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

//! The OS-event pump.
//!
//! A thin wrapper over a single concrete backend, `mio::Poll` — the same
//! choice the scheduler's ancestor made when it wrapped a mio 0.5
//! `EventLoop`/`Handler` pair instead of hand-rolling epoll/kqueue/select
//! itself. mio already picks the best available kernel mechanism; this
//! module only needs to turn its readiness events into calls to the
//! continuation (`task`) a socket registered.
//!
//! Two timeout concerns live one level up from mio: the socket-timeout heap
//! (owned here) and the coroutine-sleep heap (owned by `scheduler`). They are
//! kept as two independent heaps rather than folded into one.

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use log::{debug, trace};
use mio::{Evented, Events, Poll, PollOpt, Ready, Token};
use slab::Slab;

use crate::timer::TimerHeap;

/// A registered continuation, invoked with no arguments whenever its socket
/// becomes readable/writable/hung-up/errored. It is
/// an `FnMut` rather than `FnOnce` because a single registration can fire
/// repeatedly (e.g. a `WouldBlock` retry) before the owning operation clears
/// its interest.
type Task = Box<dyn FnMut() + Send>;

/// Singleton OS-event pump. Owned by the scheduler; never
/// shared with user code directly.
pub(crate) struct Notifier {
    poll: Poll,
    events: Events,
    tasks: Slab<Task>,

    timeout_heap: TimerHeap<Token>,
    /// The deadline currently in force for a token, used to recognize stale
    /// heap pops.
    timeout_deadlines: HashMap<Token, Instant>,
    timeout_tasks: HashMap<Token, Box<dyn FnOnce() + Send>>,
}

impl Notifier {
    pub(crate) fn new() -> io::Result<Notifier> {
        Ok(Notifier {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            tasks: Slab::with_capacity(1024),
            timeout_heap: TimerHeap::new(),
            timeout_deadlines: HashMap::new(),
            timeout_tasks: HashMap::new(),
        })
    }

    /// Register `io` for `interest`, storing `task` as its continuation.
    /// Returns the token the caller must present to every later
    /// `reregister`/`unregister`/timeout call for this socket.
    pub(crate) fn register<E: Evented>(
        &mut self,
        io: &E,
        interest: Ready,
        task: Task,
    ) -> io::Result<Token> {
        let key = self.tasks.insert(task);
        let token = Token(key);
        if let Err(err) = self.poll.register(io, token, interest, PollOpt::edge()) {
            self.tasks.remove(key);
            return Err(err);
        }
        trace!("notifier: registered token {:?} for {:?}", token, interest);
        Ok(token)
    }

    /// Change the registered interest for an already-registered socket.
    /// `interest == Ready::empty()` removes interest without unregistering.
    pub(crate) fn reregister<E: Evented>(
        &mut self,
        io: &E,
        token: Token,
        interest: Ready,
    ) -> io::Result<()> {
        trace!("notifier: reregistering token {:?} for {:?}", token, interest);
        self.poll.reregister(io, token, interest, PollOpt::edge())
    }

    /// Replace the stored continuation for an already-registered token,
    /// without touching its mio registration. Needed whenever a new
    /// operation re-arms a socket's existing token: the task closes over the
    /// coroutine id to resume, which must track whichever coroutine issued
    /// this call, not whichever one first registered the token.
    pub(crate) fn rebind(&mut self, token: Token, task: Task) {
        if let Some(slot) = self.tasks.get_mut(token.0) {
            *slot = task;
        }
    }

    /// Drop a socket's registration and its stored continuation.
    pub(crate) fn unregister<E: Evented>(&mut self, io: &E, token: Token) -> io::Result<()> {
        trace!("notifier: unregistering token {:?}", token);
        if self.tasks.contains(token.0) {
            self.tasks.remove(token.0);
        }
        self.timeout_deadlines.remove(&token);
        self.timeout_tasks.remove(&token);
        self.poll.deregister(io)
    }

    /// Install (or replace) the per-operation timeout for `token`. Replacing
    /// an existing timeout does not touch the heap entry already queued for
    /// it; that entry becomes stale and is discarded when popped, per the
    /// tolerate-then-discard policy.
    pub(crate) fn add_timeout(&mut self, token: Token, deadline: Instant, on_timeout: Box<dyn FnOnce() + Send>) {
        self.timeout_deadlines.insert(token, deadline);
        self.timeout_tasks.insert(token, on_timeout);
        self.timeout_heap.insert(deadline, token);
    }

    pub(crate) fn next_timeout_deadline(&self) -> Option<Instant> {
        self.timeout_heap.next_deadline()
    }

    /// Run one poll iteration. `timeout` bounds how long to block; the
    /// scheduler further clamps it against its own sleep heap before
    /// calling in. Readiness events invoke their
    /// socket's stored task directly; expired, non-stale timeouts invoke
    /// their `timed_out` continuation.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let n = self.poll.poll(&mut self.events, timeout)?;

        let mut ready_tokens = Vec::with_capacity(n);
        for event in self.events.iter() {
            ready_tokens.push(event.token());
        }
        for token in ready_tokens {
            if let Some(task) = self.tasks.get_mut(token.0) {
                task();
            }
        }

        self.fire_expired_timeouts(Instant::now());
        Ok(n)
    }

    fn fire_expired_timeouts(&mut self, now: Instant) {
        for (token, deadline) in self.timeout_heap.drain_expired(now) {
            let current = self.timeout_deadlines.get(&token).copied();
            if current != Some(deadline) {
                trace!("notifier: discarding stale timeout for {:?}", token);
                continue;
            }
            self.timeout_deadlines.remove(&token);
            if let Some(task) = self.timeout_tasks.remove(&token) {
                trace!("notifier: firing timeout for {:?}", token);
                task();
            }
        }
    }

    /// Torn down by the scheduler during `shutdown()`; `Poll`/`Slab` clean
    /// themselves up on drop, this just logs the boundary.
    pub(crate) fn terminate(&mut self) {
        debug!("notifier: terminating with {} live registrations", self.tasks.len());
        self.tasks.clear();
        self.timeout_deadlines.clear();
        self.timeout_tasks.clear();
    }
}
