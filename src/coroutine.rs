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

//! The single coroutine abstraction the scheduler drives.
//!
//! Every coroutine gets a real stack (`context::stack::ProtectedFixedSizeStack`)
//! and is switched to and from with the `context` crate, exactly the way
//! `coroutine-rs`/`coio-rs` do it. Because the scheduler never runs more than
//! one coroutine at a time and never hands a coroutine's stack to a second OS
//! thread, nested suspension (a socket op calling `suspend` several frames deep)
//! unwinds and resumes through the coroutine's own native call stack; there is
//! no hand-maintained `caller_stack` structure to keep in sync.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};

use crate::options::Options;

/// Monotonic 64-bit coroutine id.
pub type CoroId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> CoroId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Coroutine lifecycle state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    Scheduled,
    Running,
    Suspended,
    Done,
}

/// Error kinds that can be thrown into a blocked coroutine.
/// `Exit` is deliberately not a variant here: cancellation bypasses this type
/// entirely (see `Exit` below) because user code must not be able to catch it.
#[derive(Debug)]
pub enum CoroError {
    /// OS-reported I/O failure.
    Io(std::io::Error),
    /// A per-operation deadline elapsed.
    TimedOut,
    /// Locks/condition variables used outside their documented protocol.
    InvalidUse(&'static str),
}

impl fmt::Display for CoroError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoroError::Io(e) => write!(f, "socket error: {}", e),
            CoroError::TimedOut => write!(f, "operation timed out"),
            CoroError::InvalidUse(msg) => write!(f, "invalid use of synchronization primitive: {}", msg),
        }
    }
}

impl std::error::Error for CoroError {}

impl From<std::io::Error> for CoroError {
    fn from(e: std::io::Error) -> CoroError {
        CoroError::Io(e)
    }
}

/// The reserved, non-catchable cancellation signal raised by
/// `terminate_coroutine`. It is never wrapped in `CoroError`
/// and is not `pub`: user code can observe a terminated coroutine only
/// through `State::Done`, never by downcasting the panic payload.
pub(crate) struct Exit;

/// What is staged to be delivered on a coroutine's next step: the
/// value/exception pair, unified into one enum.
pub(crate) enum Resumption {
    Value(Box<dyn Any + Send>),
    Exception(CoroError),
    Exit,
}

/// What the coroutine reports back to the scheduler after a context switch.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum StepOutcome {
    /// Yielded via `suspend`; still resumable.
    Suspended,
    /// The entry function returned normally.
    Finished,
    /// The entry function panicked (including via `Exit`).
    Panicked,
}

const TAG_SUSPENDED: usize = 0;
const TAG_FINISHED: usize = 1;
const TAG_PANICKED: usize = 2;

thread_local! {
    /// The context to `.resume()` in order to yield control back to whichever
    /// scheduler call switched into the coroutine currently running on this OS
    /// thread. There is at most one live value because the scheduler is
    /// single-threaded and runs one coroutine at a time.
    static YIELD_POINT: Cell<Option<Context>> = Cell::new(None);

    /// Raw pointer to the `Coroutine` currently executing on this OS thread,
    /// so that free functions (`suspend`, `current_coroutine`) can reach it
    /// without threading a handle through every call site.
    static CURRENT: Cell<Option<*const Coroutine>> = Cell::new(None);
}

/// A one-shot "done" signal a foreign thread can block on, used by
/// `JoinHandle`/`value()`: a small `Mutex<bool>` + `Condvar` barrier.
pub(crate) struct CompleteSignal {
    lock: Mutex<bool>,
    condvar: Condvar,
}

impl CompleteSignal {
    pub(crate) fn new() -> Arc<CompleteSignal> {
        Arc::new(CompleteSignal {
            lock: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    pub(crate) fn raise(&self) {
        let mut done = self.lock.lock().unwrap();
        *done = true;
        self.condvar.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.lock.lock().unwrap();
        while !*done {
            done = self.condvar.wait(done).unwrap();
        }
    }
}

/// A coroutine's entry function, boxed for one-shot use by the trampoline.
type Entry = Box<dyn FnOnce() + Send>;

/// The scheduler-owned coroutine object.
pub struct Coroutine {
    id: CoroId,
    name: Option<String>,
    state: Cell<State>,

    /// Value/exception to deliver on the next resumption.
    inbox: RefCell<Option<Resumption>>,
    /// Panic payload stashed by the trampoline just before its final switch.
    panic_payload: Cell<Option<Box<dyn Any + Send>>>,

    /// The boxed entry closure, taken by `enter` on the first step.
    entry: RefCell<Option<Entry>>,
    /// Set once the first `enter` has consumed `entry`.
    started: Cell<bool>,

    /// Absolute wake time while `Suspended` via a timed `suspend`;
    /// non-null only while `state == Suspended`.
    deadline: Cell<Option<Instant>>,

    /// Edge-triggered completion signal raised exactly once.
    pub(crate) complete: Arc<CompleteSignal>,

    /// The context to resume execution of this coroutine; `None` while
    /// `Running` or `Done`.
    context: Cell<Option<Context>>,
    /// Backing stack memory; kept alive as long as the coroutine might still
    /// be resumed.
    _stack: ProtectedFixedSizeStack,
}

unsafe impl Send for Coroutine {}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Coroutine(#{}, {:?})", self.id, self.name)
    }
}

/// Smuggled through the very first context switch: a fat pointer to the
/// boxed entry closure, leaked until the trampoline reclaims it.
struct InitialPayload {
    entry: Entry,
}

extern "C" fn trampoline(t: Transfer) -> ! {
    // `t.context` is the scheduler's resume call site: the place we must jump
    // back to in order to yield. Stash it before doing anything else.
    YIELD_POINT.with(|y| y.set(Some(t.context)));

    let payload = unsafe { Box::from_raw(t.data as *mut InitialPayload) };
    let entry = payload.entry;

    let result = panic::catch_unwind(AssertUnwindSafe(entry));

    let coro = CURRENT.with(|c| c.get()).expect("trampoline running without CURRENT set");
    let tag = match result {
        Ok(()) => TAG_FINISHED,
        Err(payload) => {
            unsafe { &*coro }.panic_payload.set(Some(payload));
            TAG_PANICKED
        }
    };

    // Yield back to the scheduler for the last time. The scheduler never
    // resumes a `Done` coroutine again, but the trampoline must still satisfy
    // `-> !`: if it ever were resumed by mistake we treat it as a logic error
    // and keep bouncing control back rather than executing past the end of
    // the user's stack frame.
    let yield_ctx = YIELD_POINT.with(|y| y.take()).expect("yield point missing");
    let mut t = unsafe { yield_ctx.resume(tag) };
    loop {
        t = unsafe { t.context.resume(tag) };
    }
}

impl Coroutine {
    /// Construct a not-yet-started coroutine around `f`.
    pub(crate) fn spawn<F>(f: F, opts: &Options) -> Coroutine
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = ProtectedFixedSizeStack::new(opts.stack_size)
            .expect("failed to allocate coroutine stack");
        let context = unsafe { Context::new(&stack, trampoline) };

        Coroutine {
            id: next_id(),
            name: opts.name.clone(),
            state: Cell::new(State::Scheduled),
            inbox: RefCell::new(None),
            panic_payload: Cell::new(None),
            entry: RefCell::new(Some(Box::new(f))),
            started: Cell::new(false),
            deadline: Cell::new(None),
            complete: CompleteSignal::new(),
            context: Cell::new(Some(context)),
            _stack: stack,
        }
    }

    #[inline]
    pub fn id(&self) -> CoroId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state.get()
    }

    #[inline]
    pub(crate) fn set_state(&self, s: State) {
        self.state.set(s);
    }

    #[inline]
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline.get()
    }

    #[inline]
    pub(crate) fn set_deadline(&self, d: Option<Instant>) {
        self.deadline.set(d);
    }

    #[inline]
    pub(crate) fn stage(&self, r: Resumption) {
        *self.inbox.borrow_mut() = Some(r);
    }

    /// Non-consuming peek used by `Scheduler::resume`'s race-cancellation
    /// rule: a resume arriving while a non-terminal exception
    /// is already staged must cancel that exception rather than queue both.
    #[inline]
    pub(crate) fn has_pending_exception(&self) -> bool {
        matches!(*self.inbox.borrow(), Some(Resumption::Exception(_)))
    }

    /// Run (or resume) the coroutine exactly one step. Must only be called by
    /// the scheduler, with the coroutine already removed from every set.
    pub(crate) fn enter(&self) -> StepOutcome {
        debug_assert_ne!(self.state.get(), State::Done);
        self.state.set(State::Running);

        let first = !self.started.get();
        self.started.set(true);

        CURRENT.with(|c| c.set(Some(self as *const Coroutine)));

        let ctx = self.context.take().expect("coroutine context missing on enter");
        let transfer = if first {
            let entry = self
                .entry
                .borrow_mut()
                .take()
                .expect("entry missing on first enter");
            let payload = Box::new(InitialPayload { entry });
            let data = Box::into_raw(payload) as usize;
            unsafe { ctx.resume(data) }
        } else {
            unsafe { ctx.resume(0) }
        };

        CURRENT.with(|c| c.set(None));

        match transfer.data {
            TAG_SUSPENDED => {
                self.context.set(Some(transfer.context));
                StepOutcome::Suspended
            }
            TAG_FINISHED => {
                self.context.set(Some(transfer.context));
                StepOutcome::Finished
            }
            TAG_PANICKED => {
                self.context.set(Some(transfer.context));
                StepOutcome::Panicked
            }
            other => panic!("coroutine yielded with unknown tag {}", other),
        }
    }

    /// Take the stashed panic payload after a `Panicked` step.
    pub(crate) fn take_panic_payload(&self) -> Option<Box<dyn Any + Send>> {
        self.panic_payload.take()
    }
}

/// Get the id of the coroutine currently executing on this OS thread, if any.
pub fn current_coroutine() -> Option<CoroId> {
    CURRENT.with(|c| c.get()).map(|p| unsafe { (*p).id() })
}

/// Suspend the coroutine currently executing on this OS thread and switch
/// back to the scheduler. Panics if called outside a coroutine.
///
/// This is the sole suspension primitive: `Scheduler::suspend`, every async
/// socket operation, and the cooperative condition variable all funnel
/// through it. The scheduler is responsible for eventually calling
/// `Coroutine::enter` again, at which point this function returns with
/// whatever was staged via `stage()`.
pub(crate) fn yield_to_scheduler() -> Result<Box<dyn Any + Send>, CoroError> {
    let coro_ptr = CURRENT
        .with(|c| c.get())
        .expect("suspend() called outside a running coroutine");
    let coro = unsafe { &*coro_ptr };

    let yield_ctx = YIELD_POINT
        .with(|y| y.take())
        .expect("yield point missing; not inside a coroutine stack");

    let transfer = unsafe { yield_ctx.resume(TAG_SUSPENDED) };
    YIELD_POINT.with(|y| y.set(Some(transfer.context)));

    match coro.inbox.borrow_mut().take() {
        Some(Resumption::Value(v)) => Ok(v),
        Some(Resumption::Exception(e)) => Err(e),
        Some(Resumption::Exit) => std::panic::panic_any(Exit),
        None => Ok(Box::new(())),
    }
}
