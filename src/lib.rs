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

//! A single-process cooperative coroutine runtime with an integrated
//! asynchronous socket layer.
//!
//! Application code is written as ordinary, blocking-shaped functions:
//!
//! ```no_run
//! use asyncoro::net::TcpStream;
//! use asyncoro::CoroError;
//! use std::net::SocketAddr;
//!
//! let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
//! let handle = asyncoro::spawn(move || -> Result<(), CoroError> {
//!     let stream = TcpStream::connect(&addr)?;
//!     stream.sendall(b"hello world")?;
//!     Ok(())
//! });
//! handle.value().unwrap();
//! ```
//!
//! `spawn` hands the closure to the process-wide [`Scheduler`], which runs it
//! cooperatively alongside every other live coroutine on one background OS
//! thread; `TcpStream::connect`/`recv`/`send` suspend that one coroutine
//! rather than blocking the thread, by registering with the [`Notifier`] and
//! yielding back to the scheduler until the socket is ready.

mod coroutine;
mod notifier;
mod options;
mod scheduler;
mod sync;
mod timer;

pub mod net;

pub use crate::coroutine::{current_coroutine, CoroError, CoroId};
pub use crate::options::Options;
pub use crate::scheduler::{sleep, spawn, spawn_opts, JoinHandle, Scheduler};
pub use crate::sync::{Condition, Lock};
