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

//! Global coroutine scheduler.
//!
//! A single background OS thread drives every coroutine cooperatively: the
//! coroutine table, the ready/suspended sets and the sleep-timer heap are
//! guarded by one mutex (`STATE`), while the notifier lives behind a second,
//! separate mutex (`NOTIFIER`). The split exists because a readiness event
//! fired during `notifier.poll()` may run a socket's task, which calls back
//! into `resume`/`throw` on this very thread — if the turn loop still held
//! `STATE` across the `poll()` call, that callback would try to lock a mutex
//! this thread already holds and deadlock. Foreign threads only ever take
//! one lock at a time for the same reason.

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use linked_hash_map::LinkedHashMap;
use log::{debug, error, trace};
use mio::unix::EventedFd;
use mio::Ready;

use crate::coroutine::{self, CoroError, CoroId, Coroutine, Resumption, StepOutcome};
use crate::notifier::Notifier;
use crate::options::Options;

/// A slack window tolerated when deciding whether a sleep timer has expired.
const SLEEP_SLACK: Duration = Duration::from_millis(1);

/// One-shot finalizer run exactly when a coroutine reaches `Done`, regardless
/// of whether it finished normally, panicked, or was cancelled. Used to
/// deliver the coroutine's result to its `JoinHandle` without making
/// `SchedulerState` generic over every spawned closure's return type.
type Finalizer = Box<dyn FnOnce(StepOutcome, Option<Box<dyn Any + Send>>) + Send>;

struct SchedulerState {
    // Boxed so a coroutine's address is stable across map inserts/removals
    // elsewhere; `run_one` briefly holds a raw pointer to one across a lock
    // release (see its comment).
    table: LinkedHashMap<CoroId, Box<Coroutine>>,
    finalizers: LinkedHashMap<CoroId, Finalizer>,
    ready: VecDeque<CoroId>,
    suspended: HashSet<CoroId>,
    sleep_heap: crate::timer::TimerHeap<CoroId>,
}

impl SchedulerState {
    fn new() -> SchedulerState {
        SchedulerState {
            table: LinkedHashMap::new(),
            finalizers: LinkedHashMap::new(),
            ready: VecDeque::new(),
            suspended: HashSet::new(),
            sleep_heap: crate::timer::TimerHeap::new(),
        }
    }
}

/// The self-pipe used to wake the notifier from a foreign thread: a
/// self-pipe is the correct cross-platform primitive for this.
struct ControlPipe {
    read_fd: libc::c_int,
    write_fd: libc::c_int,
}

impl ControlPipe {
    fn new() -> io::Result<ControlPipe> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        for &fd in &fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        Ok(ControlPipe { read_fd: fds[0], write_fd: fds[1] })
    }

    /// Wake the notifier with a single byte; any byte will do.
    fn wake(&self) {
        let byte = [1u8];
        unsafe {
            let _ = libc::write(self.write_fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    /// Drain up to 128 bytes, absorbing wakeups with a no-op task.
    fn drain(&self) {
        let mut buf = [0u8; 128];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for ControlPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

pub struct Scheduler {
    state: Mutex<SchedulerState>,
    notifier: Mutex<Notifier>,
    control: ControlPipe,
    start: Once,
    shutting_down: AtomicBool,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    default_options: Mutex<Options>,
}

lazy_static! {
    static ref SCHEDULER: Scheduler = Scheduler::new();
}

impl Scheduler {
    fn new() -> Scheduler {
        let notifier = Notifier::new().expect("failed to create notifier");
        let control = ControlPipe::new().expect("failed to create control pipe");

        Scheduler {
            state: Mutex::new(SchedulerState::new()),
            notifier: Mutex::new(notifier),
            control,
            start: Once::new(),
            shutting_down: AtomicBool::new(false),
            thread: Mutex::new(None),
            default_options: Mutex::new(Options::default()),
        }
    }

    /// Lazily starts the single background scheduler thread: process-wide
    /// state is initialized on first `spawn`. Safe to call repeatedly; only
    /// the first call has any effect.
    fn ensure_started(&'static self) {
        let this = self;
        self.start.call_once(move || {
            {
                let mut notifier = this.notifier.lock().unwrap();
                notifier
                    .register(&EventedFd(&this.control.read_fd), Ready::readable(), Box::new(|| {}))
                    .expect("failed to register control pipe");
            }
            debug!("scheduler: starting background thread");
            let handle = thread::Builder::new()
                .name("asyncoro-scheduler".to_owned())
                .spawn(move || this.run_loop())
                .expect("failed to spawn scheduler thread");
            *this.thread.lock().unwrap() = Some(handle);
        });
    }

    fn run_loop(&'static self) {
        debug!("scheduler: turn loop started");
        while !self.shutting_down.load(Ordering::SeqCst) {
            self.turn();
        }
        debug!("scheduler: turn loop exiting, closing remaining coroutines");
        self.close_all_remaining();
        self.notifier.lock().unwrap().terminate();
    }

    fn turn(&'static self) {
        // Step 1: nonblocking drain.
        {
            let mut notifier = self.notifier.lock().unwrap();
            let _ = notifier.poll(Some(Duration::from_secs(0)));
        }

        // Step 2: if nothing is ready, block up to the next deadline.
        let ready_empty = self.state.lock().unwrap().ready.is_empty();
        if ready_empty {
            let deadline = self.next_deadline();
            let mut notifier = self.notifier.lock().unwrap();
            let _ = notifier.poll(deadline);
        }
        self.control.drain();

        // Step 3: drain expired sleep timers.
        self.drain_sleep_timers();

        // Step 4: snapshot ready, run each coroutine once.
        let batch: Vec<CoroId> = {
            let mut state = self.state.lock().unwrap();
            state.ready.drain(..).collect()
        };
        for id in batch {
            self.run_one(id);
        }
    }

    fn next_deadline(&'static self) -> Option<Duration> {
        let sleep_deadline = self.state.lock().unwrap().sleep_heap.next_deadline();
        let io_deadline = self.notifier.lock().unwrap().next_timeout_deadline();
        let earliest = match (sleep_deadline, io_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        earliest.map(|deadline| {
            let now = Instant::now();
            if deadline > now { deadline - now } else { Duration::from_secs(0) }
        })
    }

    fn drain_sleep_timers(&'static self) {
        let now = Instant::now() + SLEEP_SLACK;
        let mut state = self.state.lock().unwrap();
        let expired = state.sleep_heap.drain_expired(now);
        for (id, deadline) in expired {
            if let Some(coro) = state.table.get(&id) {
                if coro.deadline() != Some(deadline) {
                    trace!("scheduler: discarding stale sleep timer for {:?}", id);
                    continue;
                }
                coro.set_deadline(None);
                if state.suspended.remove(&id) {
                    trace!("scheduler: waking sleeping coroutine {:?}", id);
                    coro.stage(Resumption::Value(Box::new(())));
                    state.ready.push_back(id);
                }
            }
        }
    }

    fn run_one(&'static self, id: CoroId) {
        // `enter()` must not run with `state` locked: it switches onto the
        // coroutine's stack, and that coroutine may call back into
        // `suspend`, which needs the same lock. Take a raw pointer to the
        // (heap-stable, boxed) coroutine, release the lock, then step it.
        // Sound because only this thread ever removes table entries, and it
        // does so only after this call returns.
        let coro_ptr: *const Coroutine = {
            let state = self.state.lock().unwrap();
            match state.table.get(&id) {
                Some(coro) => coro.as_ref() as *const Coroutine,
                None => return,
            }
        };

        trace!("scheduler: running {:?}", id);
        let outcome = unsafe { (*coro_ptr).enter() };

        let mut state = self.state.lock().unwrap();
        let coro = match state.table.get(&id) {
            Some(c) => c,
            None => return,
        };

        match outcome {
            StepOutcome::Suspended => {
                // `suspend`/an async op already moved this coroutine into
                // `suspended` (or, in the case of `Condition::notify`,
                // straight back into `ready`) before yielding; nothing to
                // do here unless it is still marked `Running`, which means
                // it yielded without calling `suspend` at all (a logic
                // error in a primitive) — treat that defensively as ready.
                if coro.state() == crate::coroutine::State::Running {
                    coro.set_state(crate::coroutine::State::Scheduled);
                    state.ready.push_back(id);
                }
            }
            StepOutcome::Finished | StepOutcome::Panicked => {
                let panic_payload = if outcome == StepOutcome::Panicked {
                    coro.take_panic_payload()
                } else {
                    None
                };
                if outcome == StepOutcome::Panicked {
                    if panic_payload
                        .as_ref()
                        .map(|p| p.downcast_ref::<crate::coroutine::Exit>().is_some())
                        .unwrap_or(false)
                    {
                        debug!("scheduler: {:?} terminated via cancellation", id);
                    } else {
                        error!("scheduler: {:?} panicked and was dropped", id);
                    }
                }
                let complete = coro.complete.clone();
                state.suspended.remove(&id);
                state.table.remove(&id);
                if let Some(finalizer) = state.finalizers.remove(&id) {
                    finalizer(outcome, panic_payload);
                }
                complete.raise();
            }
        }
    }

    fn close_all_remaining(&'static self) {
        let ids: Vec<CoroId> = self.state.lock().unwrap().table.keys().cloned().collect();
        for id in ids {
            self.throw(id, CoroError::InvalidUse("scheduler shutting down"));
        }
        // Give every coroutine one more turn to unwind via the thrown
        // exception / `Exit`.
        loop {
            let batch: Vec<CoroId> = {
                let mut state = self.state.lock().unwrap();
                state.ready.drain(..).collect()
            };
            if batch.is_empty() {
                break;
            }
            for id in batch {
                self.run_one(id);
            }
        }
    }

    /// Insert a freshly constructed coroutine, wake the loop if it was
    /// idle, and arrange for `finalizer` to run exactly once this coroutine
    /// reaches `Done`.
    fn spawn_coroutine(&'static self, coro: Coroutine, finalizer: Finalizer) {
        self.ensure_started();
        let id = coro.id();
        let mut state = self.state.lock().unwrap();
        let was_empty = state.ready.is_empty();
        state.table.insert(id, Box::new(coro));
        state.finalizers.insert(id, finalizer);
        state.ready.push_back(id);
        drop(state);
        if was_empty {
            self.control.wake();
        }
    }

    /// Suspend coroutine `id`, optionally with a wake-up deadline. Must be
    /// called from the coroutine itself; enforced by the caller
    /// (`crate::suspend`) via `current_coroutine`.
    fn suspend(&'static self, id: CoroId, timeout: Option<Duration>) {
        let mut state = self.state.lock().unwrap();
        if let Some(coro) = state.table.get(&id) {
            debug_assert_eq!(coro.state(), crate::coroutine::State::Running);
            coro.set_state(crate::coroutine::State::Suspended);
            if let Some(timeout) = timeout {
                let deadline = Instant::now() + timeout;
                coro.set_deadline(Some(deadline));
                state.sleep_heap.insert(deadline, id);
            }
            state.suspended.insert(id);
        }
    }

    /// Move `id` from `suspended` to `ready`, staging `value` as the next
    /// delivery.
    pub(crate) fn resume(&'static self, id: CoroId, value: Box<dyn Any + Send>) {
        let mut state = self.state.lock().unwrap();
        let was_empty = state.ready.is_empty();
        let mut woke = false;
        if let Some(coro) = state.table.get(&id) {
            if state.suspended.remove(&id) {
                coro.set_deadline(None);
                coro.set_state(crate::coroutine::State::Scheduled);
                coro.stage(Resumption::Value(value));
                state.ready.push_back(id);
                woke = true;
            } else if coro.has_pending_exception() {
                // Race: I/O completed just as a timeout was posted. The
                // resume cancels the pending exception.
                coro.stage(Resumption::Value(value));
                woke = true;
            }
        }
        drop(state);
        if woke && was_empty {
            self.control.wake();
        }
    }

    /// Stage `err` to be injected into `id`'s next step, waking it if
    /// suspended.
    pub(crate) fn throw(&'static self, id: CoroId, err: CoroError) {
        let mut state = self.state.lock().unwrap();
        let was_empty = state.ready.is_empty();
        let mut woke = false;
        if let Some(coro) = state.table.get(&id) {
            coro.stage(Resumption::Exception(err));
            if state.suspended.remove(&id) {
                coro.set_deadline(None);
                coro.set_state(crate::coroutine::State::Scheduled);
                state.ready.push_back(id);
                woke = true;
            }
        }
        drop(state);
        if woke && was_empty {
            self.control.wake();
        }
    }

    /// Equivalent to throwing a distinguished `Exit` exception.
    pub(crate) fn terminate(&'static self, id: CoroId) {
        let mut state = self.state.lock().unwrap();
        let was_empty = state.ready.is_empty();
        let mut woke = false;
        if let Some(coro) = state.table.get(&id) {
            coro.stage(Resumption::Exit);
            if state.suspended.remove(&id) {
                coro.set_deadline(None);
                coro.set_state(crate::coroutine::State::Scheduled);
                state.ready.push_back(id);
                woke = true;
            }
        }
        drop(state);
        if woke && was_empty {
            self.control.wake();
        }
    }

    /// Set the terminate flag and wake the loop.
    pub fn shutdown() {
        debug!("scheduler: shutdown requested");
        SCHEDULER.shutting_down.store(true, Ordering::SeqCst);
        SCHEDULER.control.wake();
    }

    /// Blocks the calling (non-scheduler) thread until the background
    /// thread exits.
    pub fn join() {
        let handle = SCHEDULER.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

unsafe impl Sync for Scheduler {}
unsafe impl Send for Scheduler {}

/// Blocking value/panic carrier behind a `JoinHandle`.
enum JoinResult<T> {
    Pending,
    Value(T),
    Panicked(Box<dyn Any + Send>),
    Cancelled,
}

/// Handle returned by `spawn`: the caller's view of a coroutine, letting a
/// foreign thread resume/throw/terminate it and block for its return value.
pub struct JoinHandle<T> {
    id: CoroId,
    complete: Arc<coroutine::CompleteSignal>,
    result: Arc<Mutex<JoinResult<T>>>,
}

impl<T: Send + 'static> JoinHandle<T> {
    /// The id this handle refers to.
    pub fn id(&self) -> CoroId {
        self.id
    }

    /// Deliver `value` to the coroutine's next step, waking it if it is
    /// suspended.
    pub fn resume(&self, value: Box<dyn Any + Send>) {
        SCHEDULER.resume(self.id, value);
    }

    /// Stage an exception to be injected at the coroutine's next step.
    pub fn throw(&self, err: CoroError) {
        SCHEDULER.throw(self.id, err);
    }

    /// Cooperative cancellation via the reserved `Exit` exception.
    pub fn terminate(&self) {
        SCHEDULER.terminate(self.id);
    }

    /// Block the calling thread (coroutine or not) until the spawned
    /// coroutine finishes, then return its value — or resume its panic, or
    /// panic with a cancellation message if it was `terminate()`d first.
    pub fn value(&self) -> T {
        self.complete.wait();
        match std::mem::replace(&mut *self.result.lock().unwrap(), JoinResult::Pending) {
            JoinResult::Value(v) => v,
            JoinResult::Panicked(payload) => std::panic::resume_unwind(payload),
            JoinResult::Cancelled => panic!("coroutine was terminated before completing"),
            JoinResult::Pending => unreachable!("complete signalled with no result recorded"),
        }
    }
}

/// Spawn a coroutine running `f` with default options.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let opts = SCHEDULER.default_options.lock().unwrap().clone();
    spawn_opts(f, opts)
}

/// Spawn a coroutine running `f` with explicit `Options`.
pub fn spawn_opts<F, T>(f: F, opts: Options) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let result = Arc::new(Mutex::new(JoinResult::Pending));
    let result2 = result.clone();

    let entry: Box<dyn FnOnce() + Send> = Box::new(move || {
        let v = f();
        *result2.lock().unwrap() = JoinResult::Value(v);
    });

    let coro = Coroutine::spawn(entry, &opts);
    let id = coro.id();
    let complete = coro.complete.clone();

    let result3 = result.clone();
    let finalizer: Box<dyn FnOnce(StepOutcome, Option<Box<dyn Any + Send>>) + Send> =
        Box::new(move |outcome, payload| {
            if outcome == StepOutcome::Panicked {
                let mut slot = result3.lock().unwrap();
                if matches!(*slot, JoinResult::Pending) {
                    *slot = match payload {
                        Some(p) if p.downcast_ref::<crate::coroutine::Exit>().is_some() => {
                            JoinResult::Cancelled
                        }
                        Some(p) => JoinResult::Panicked(p),
                        None => JoinResult::Panicked(Box::new("coroutine panicked")),
                    };
                }
            }
        });

    SCHEDULER.spawn_coroutine(coro, finalizer);

    JoinHandle { id, complete, result }
}

/// Suspend the calling coroutine, with an optional timeout, and block until
/// resumed.
pub(crate) fn suspend(timeout: Option<Duration>) -> Result<Box<dyn Any + Send>, CoroError> {
    let id = coroutine::current_coroutine().expect("suspend() called outside a coroutine");
    SCHEDULER.suspend(id, timeout);
    coroutine::yield_to_scheduler()
}

/// `sleep(t)`, an alias of `suspend(t)`: delay the calling coroutine without
/// expecting a delivered value back.
pub fn sleep(timeout: Duration) -> Result<(), CoroError> {
    suspend(Some(timeout)).map(|_| ())
}

pub(crate) fn resume(id: CoroId, value: Box<dyn Any + Send>) {
    SCHEDULER.resume(id, value);
}

pub(crate) fn throw(id: CoroId, err: CoroError) {
    SCHEDULER.throw(id, err);
}

pub(crate) fn terminate_coroutine(id: CoroId) {
    SCHEDULER.terminate(id);
}

/// Register a socket's interest with the process-wide notifier (used by
/// `crate::net`). Exposed at crate-internal visibility; the socket layer
/// never touches `NOTIFIER`/`STATE` directly.
pub(crate) fn with_notifier<R>(f: impl FnOnce(&mut Notifier) -> R) -> R {
    SCHEDULER.ensure_started();
    let mut notifier = SCHEDULER.notifier.lock().unwrap();
    f(&mut notifier)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn spawn_and_value_round_trip() {
        let handle = spawn(|| 1 + 1);
        assert_eq!(handle.value(), 2);
    }

    #[test]
    fn sleep_fan_out_completes() {
        let handles: Vec<_> = (0..20)
            .map(|_| {
                spawn(|| {
                    suspend(Some(Duration::from_millis(20))).unwrap();
                    true
                })
            })
            .collect();
        for h in handles {
            assert!(h.value());
        }
    }
}
