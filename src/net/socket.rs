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

//! `TcpStream`/`TcpListener`/`UdpSocket`: the socket façade, each wrapping
//! an OS socket in both an asynchronous and a true-blocking form. In async
//! mode (the default) every blocking-looking call here is really "attempt
//! the non-blocking syscall; on `WouldBlock`, register with the notifier
//! and suspend; retry on wake", funneled through the single `perform`
//! helper below. `set_blocking(true)` flips the underlying fd's
//! `O_NONBLOCK` flag back off, at which point the same calls perform real
//! OS-blocking syscalls directly; `perform`'s `WouldBlock` arm simply never
//! triggers in that mode, so no separate blocking-mode code path is needed.

use std::cell::Cell;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::trace;
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream, UdpSocket as MioUdpSocket};
use mio::{Evented, Ready, Token};

use crate::coroutine::{current_coroutine, CoroError};
use crate::scheduler;

lazy_static! {
    /// Process-wide default per-operation timeout, applied to every newly
    /// constructed async socket that hasn't called `set_timeout` itself.
    /// `None` until `set_default_timeout` is called.
    static ref DEFAULT_TIMEOUT: Mutex<Option<Duration>> = Mutex::new(None);
}

/// Read the process-wide default socket timeout.
pub fn default_timeout() -> Option<Duration> {
    *DEFAULT_TIMEOUT.lock().unwrap()
}

/// Set the process-wide default socket timeout applied to sockets
/// constructed from this point on; does not retroactively change sockets
/// that already exist.
pub fn set_default_timeout(timeout: Option<Duration>) {
    *DEFAULT_TIMEOUT.lock().unwrap() = timeout;
}

/// Registration + per-operation timeout bookkeeping shared by every async
/// socket wrapper.
struct IoState {
    token: Cell<Option<Token>>,
    timeout: Cell<Option<Duration>>,
    /// `false` (the default) means every operation goes through `perform`'s
    /// non-blocking-attempt-then-suspend dance; `true` means the fd itself
    /// is OS-blocking and operations block the calling OS thread directly.
    blocking: Cell<bool>,
}

impl IoState {
    fn new() -> IoState {
        IoState {
            token: Cell::new(None),
            timeout: Cell::new(default_timeout()),
            blocking: Cell::new(false),
        }
    }
}

/// Toggle `io`'s `O_NONBLOCK` flag to match `blocking`. Switching into
/// blocking mode drops any notifier registration first, since a blocking fd
/// can never produce the `WouldBlock` a registration exists to wait out.
fn set_io_blocking<E: Evented + AsRawFd>(io: &E, state: &IoState, blocking: bool) -> io::Result<()> {
    if state.blocking.get() == blocking {
        return Ok(());
    }
    if blocking {
        if let Some(token) = state.token.take() {
            scheduler::with_notifier(|n| {
                let _ = n.unregister(io, token);
            });
        }
    }
    set_fd_nonblocking(io.as_raw_fd(), !blocking)?;
    state.blocking.set(blocking);
    Ok(())
}

fn set_fd_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let updated = if nonblocking { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
        if libc::fcntl(fd, libc::F_SETFL, updated) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Drive one async primitive to completion against `io`: try the
/// non-blocking operation; on `WouldBlock`, arm `interest` on the notifier
/// (reusing `state`'s token if this socket already has one registered) and
/// suspend the calling coroutine until the notifier's task resumes it or
/// its own timeout throws `CoroError::TimedOut` into it; on wake, retry.
/// This is the single generic pattern underneath every
/// `recv`/`send`/`accept`/`connect`.
fn perform<E, T, F>(io: &E, state: &IoState, interest: Ready, mut attempt: F) -> Result<T, CoroError>
where
    E: Evented,
    F: FnMut() -> io::Result<T>,
{
    loop {
        match attempt() {
            Ok(v) => {
                // Fully unregister rather than just clearing interest: a socket
                // idle between operations must carry neither a stale `task`
                // nor a stale `token`, so that whichever coroutine issues the
                // next operation gets a fresh registration of its own.
                if let Some(token) = state.token.take() {
                    scheduler::with_notifier(|n| {
                        let _ = n.unregister(io, token);
                    });
                }
                return Ok(v);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                let id = current_coroutine().expect("async socket operation called outside a coroutine");
                let task: Box<dyn FnMut() + Send> = Box::new(move || scheduler::resume(id, Box::new(())));
                let token = match state.token.get() {
                    Some(t) => {
                        scheduler::with_notifier(|n| {
                            n.rebind(t, task);
                            n.reregister(io, t, interest)
                        })?;
                        t
                    }
                    None => {
                        let t = scheduler::with_notifier(|n| n.register(io, interest, task))?;
                        state.token.set(Some(t));
                        t
                    }
                };
                if let Some(timeout) = state.timeout.get() {
                    let deadline = Instant::now() + timeout;
                    scheduler::with_notifier(|n| {
                        n.add_timeout(token, deadline, Box::new(move || scheduler::throw(id, CoroError::TimedOut)));
                    });
                }
                trace!("socket: suspending coroutine on {:?} for {:?}", token, interest);
                scheduler::suspend(None)?;
            }
            Err(e) => return Err(CoroError::Io(e)),
        }
    }
}

fn unregister<E: Evented>(io: &E, state: &IoState) {
    if let Some(token) = state.token.take() {
        scheduler::with_notifier(|n| {
            let _ = n.unregister(io, token);
        });
    }
}

/// An asynchronous TCP connection.
pub struct TcpStream {
    inner: MioTcpStream,
    state: IoState,
}

impl TcpStream {
    fn from_mio(inner: MioTcpStream) -> TcpStream {
        TcpStream { inner, state: IoState::new() }
    }

    /// Connect to `addr`, suspending the calling coroutine until the
    /// three-way handshake completes (or fails, or times out).
    pub fn connect(addr: &SocketAddr) -> Result<TcpStream, CoroError> {
        let inner = MioTcpStream::connect(addr)?;
        let state = IoState::new();

        let mut first_poll = true;
        perform(&inner, &state, Ready::writable(), || {
            if first_poll {
                first_poll = false;
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            match inner.take_error()? {
                None => Ok(()),
                Some(e) => Err(e),
            }
        })?;

        Ok(TcpStream { inner, state })
    }

    /// Bound per-operation timeout; `None`
    /// (the default) means "wait forever".
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.state.timeout.set(timeout);
    }

    /// Switch between asynchronous (default) and blocking I/O. `connect`
    /// itself always completes through the async suspend path, since it
    /// constructs the instance `set_blocking` would otherwise be called on;
    /// every operation from this point on — `recv`/`send`/`recvall`/
    /// `sendall`/`recv_message`/`send_message` — honors whichever mode is
    /// current.
    pub fn set_blocking(&self, blocking: bool) -> io::Result<()> {
        set_io_blocking(&self.inner, &self.state, blocking)
    }

    /// Arm `interest` on the notifier for this socket and suspend the
    /// calling coroutine until it fires once, without retrying any syscall
    /// itself. `perform` above folds this into its own loop for the plain
    /// recv/send/accept/connect primitives; the TLS handshake driver
    /// (`net::tls`) needs the bare wait because it must re-enter
    /// `openssl`'s own state machine between wakeups instead of retrying a
    /// fixed closure.
    pub(crate) fn wait_ready(&self, interest: Ready) -> Result<(), CoroError> {
        let id = current_coroutine().expect("wait_ready called outside a coroutine");
        let task: Box<dyn FnMut() + Send> = Box::new(move || scheduler::resume(id, Box::new(())));
        let token = match self.state.token.get() {
            Some(t) => {
                scheduler::with_notifier(|n| {
                    n.rebind(t, task);
                    n.reregister(&self.inner, t, interest)
                })?;
                t
            }
            None => {
                let t = scheduler::with_notifier(|n| n.register(&self.inner, interest, task))?;
                self.state.token.set(Some(t));
                t
            }
        };
        if let Some(timeout) = self.state.timeout.get() {
            let deadline = Instant::now() + timeout;
            scheduler::with_notifier(|n| {
                n.add_timeout(token, deadline, Box::new(move || scheduler::throw(id, CoroError::TimedOut)));
            });
        }
        scheduler::suspend(None)?;
        Ok(())
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// One non-blocking `read(2)`, suspending on `WouldBlock`. A `0`-length
    /// result means the peer has shut down its write half.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, CoroError> {
        perform(&self.inner, &self.state, Ready::readable(), || (&self.inner).read(buf))
    }

    pub fn send(&self, buf: &[u8]) -> Result<usize, CoroError> {
        perform(&self.inner, &self.state, Ready::writable(), || (&self.inner).write(buf))
    }

    /// Fill `buf` completely or fail; a `0`-length `recv` before `buf` is
    /// full is treated as the peer disconnecting mid-message.
    pub fn recvall(&self, buf: &mut [u8]) -> Result<(), CoroError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.recv(&mut buf[filled..])?;
            if n == 0 {
                return Err(CoroError::Io(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "peer closed connection before recvall completed",
                )));
            }
            filled += n;
        }
        Ok(())
    }

    /// Write all of `buf`, retrying short writes.
    pub fn sendall(&self, buf: &[u8]) -> Result<(), CoroError> {
        let mut sent = 0;
        while sent < buf.len() {
            sent += self.send(&buf[sent..])?;
        }
        Ok(())
    }

    /// Receive one length-prefixed (4-byte big-endian) message. A short read
    /// of either the header or the body (the peer closed mid-message) yields
    /// `Ok(None)` rather than an error.
    pub fn recv_message(&self) -> Result<Option<Vec<u8>>, CoroError> {
        let mut header = [0u8; 4];
        if !self.recvall_or_disconnect(&mut header)? {
            return Ok(None);
        }
        let len = u32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; len];
        if !self.recvall_or_disconnect(&mut body)? {
            return Ok(None);
        }
        Ok(Some(body))
    }

    /// Like `recvall`, but a `0`-length read before `buf` is full is reported
    /// as `Ok(false)` (disconnected) instead of `Err`. Used by `recv_message`;
    /// plain `recvall` keeps treating a short read as a hard error for
    /// callers (e.g. `recvall` conservation tests) that expect exactly `N`
    /// bytes and have no framing-level "disconnected" sentinel to fall back
    /// to.
    fn recvall_or_disconnect(&self, buf: &mut [u8]) -> Result<bool, CoroError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.recv(&mut buf[filled..])?;
            if n == 0 {
                return Ok(false);
            }
            filled += n;
        }
        Ok(true)
    }

    /// Send one length-prefixed (4-byte big-endian) message.
    pub fn send_message(&self, body: &[u8]) -> Result<(), CoroError> {
        let header = (body.len() as u32).to_be_bytes();
        self.sendall(&header)?;
        self.sendall(body)
    }

    pub fn shutdown(&self, how: std::net::Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }

    pub fn close(self) {
        unregister(&self.inner, &self.state);
    }

    pub(crate) fn inner(&self) -> &MioTcpStream {
        &self.inner
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        unregister(&self.inner, &self.state);
    }
}

/// Raw, non-suspending `Read`/`Write` over the underlying non-blocking
/// socket. Exists only so `openssl::ssl::SslStream<TcpStream>` (see
/// `net::tls`) can drive its own record-layer state machine directly against
/// the fd; ordinary application code must go through `recv`/`send`, which
/// suspend on `WouldBlock` instead of reporting it.
impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.inner).flush()
    }
}

/// A listening TCP socket, accepting connections asynchronously.
pub struct TcpListener {
    inner: MioTcpListener,
    state: IoState,
}

impl TcpListener {
    pub fn bind(addr: &SocketAddr) -> Result<TcpListener, CoroError> {
        let inner = MioTcpListener::bind(addr)?;
        Ok(TcpListener { inner, state: IoState::new() })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Switch between asynchronous (default) and blocking `accept`.
    pub fn set_blocking(&self, blocking: bool) -> io::Result<()> {
        set_io_blocking(&self.inner, &self.state, blocking)
    }

    /// Accept one pending connection, suspending until one arrives (or, in
    /// blocking mode, blocking the OS thread until one arrives). The
    /// accepted `TcpStream` always starts out in async mode regardless of
    /// the listener's own mode; call `set_blocking` on it separately.
    pub fn accept(&self) -> Result<(TcpStream, SocketAddr), CoroError> {
        let (stream, addr) = perform(&self.inner, &self.state, Ready::readable(), || self.inner.accept())?;
        Ok((TcpStream::from_mio(stream), addr))
    }

    pub fn close(self) {
        unregister(&self.inner, &self.state);
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        unregister(&self.inner, &self.state);
    }
}

/// An asynchronous UDP socket.
pub struct UdpSocket {
    inner: MioUdpSocket,
    state: IoState,
}

impl UdpSocket {
    pub fn bind(addr: &SocketAddr) -> Result<UdpSocket, CoroError> {
        let inner = MioUdpSocket::bind(addr)?;
        Ok(UdpSocket { inner, state: IoState::new() })
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.state.timeout.set(timeout);
    }

    /// Switch between asynchronous (default) and blocking `recvfrom`/`sendto`.
    pub fn set_blocking(&self, blocking: bool) -> io::Result<()> {
        set_io_blocking(&self.inner, &self.state, blocking)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn recvfrom(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), CoroError> {
        perform(&self.inner, &self.state, Ready::readable(), || self.inner.recv_from(buf))
    }

    pub fn sendto(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize, CoroError> {
        perform(&self.inner, &self.state, Ready::writable(), || self.inner.send_to(buf, addr))
    }

    pub fn close(self) {
        unregister(&self.inner, &self.state);
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        unregister(&self.inner, &self.state);
    }
}

impl From<io::Error> for CoroError {
    fn from(e: io::Error) -> CoroError {
        CoroError::Io(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_timeout_round_trips_and_is_picked_up_by_new_sockets() {
        assert_eq!(default_timeout(), None);
        set_default_timeout(Some(Duration::from_millis(250)));
        assert_eq!(default_timeout(), Some(Duration::from_millis(250)));

        let state = IoState::new();
        assert_eq!(state.timeout.get(), Some(Duration::from_millis(250)));

        set_default_timeout(None);
        assert_eq!(default_timeout(), None);
    }

    #[test]
    fn set_blocking_toggles_the_underlying_fd_flag_and_clears_registration_state() {
        let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).expect("bind failed");
        assert!(!listener.state.blocking.get());
        let flags = unsafe { libc::fcntl(listener.inner.as_raw_fd(), libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, libc::O_NONBLOCK);

        listener.set_blocking(true).expect("set_blocking(true) failed");
        assert!(listener.state.blocking.get());
        assert!(listener.state.token.get().is_none());
        let flags = unsafe { libc::fcntl(listener.inner.as_raw_fd(), libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        listener.set_blocking(false).expect("set_blocking(false) failed");
        assert!(!listener.state.blocking.get());
        let flags = unsafe { libc::fcntl(listener.inner.as_raw_fd(), libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, libc::O_NONBLOCK);
    }
}
