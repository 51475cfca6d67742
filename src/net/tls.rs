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

//! TLS-wrapped async sockets, upgrading an accepted or connected
//! `TcpStream` to an encrypted `TlsStream`.
//!
//! The handshake itself is the only place a `WouldBlock` is handled by
//! re-entering someone else's state machine instead of retrying our own
//! closure: `openssl::ssl::{SslAcceptor, SslConnector}::{accept, connect}`
//! return a `MidHandshakeSslStream` on `HandshakeError::WouldBlock`, and the
//! only way to make progress is to call `.handshake()` on *that* value again.
//! We mirror the same `SSLWantReadError`/`SSLWantWriteError` dance with
//! `TcpStream::wait_ready` supplying the suspend.
//!
//! Once established, a `TlsStream` looks exactly like a `TcpStream` to
//! application code: `recv`/`send`/`recvall`/`sendall`/`recv_message`/
//! `send_message`, all funnelled through one retry loop around the
//! underlying `SslStream`.

use std::io::{self, Read, Write};
use std::path::Path;

use mio::Ready;
use openssl::error::ErrorStack;
use openssl::ssl::{
    HandshakeError, SslAcceptor, SslConnector, SslFiletype, SslMethod, SslStream, SslVerifyMode,
};

use crate::coroutine::CoroError;
use crate::net::socket::TcpStream;

impl From<ErrorStack> for CoroError {
    fn from(e: ErrorStack) -> CoroError {
        CoroError::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

/// Server-side TLS configuration (`tls_state` keyfile/certfile
/// bundle), built once and reused to upgrade every accepted connection.
pub struct TlsAcceptor {
    inner: SslAcceptor,
}

impl TlsAcceptor {
    /// Build an acceptor from a PEM certificate chain and private key.
    pub fn new(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor, CoroError> {
        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
        builder.set_private_key_file(key_file, SslFiletype::PEM)?;
        builder.set_certificate_chain_file(cert_file)?;
        builder.check_private_key()?;
        Ok(TlsAcceptor { inner: builder.build() })
    }

    /// Upgrade an already-accepted plain `TcpStream` to TLS, suspending
    /// through as many `WouldBlock`s as the handshake needs: on
    /// `WantRead`/`WantWrite` it re-arms the socket's readiness interest and
    /// re-enters the handshake continuation.
    pub fn accept(&self, stream: TcpStream) -> Result<TlsStream, CoroError> {
        match self.inner.accept(stream) {
            Ok(stream) => Ok(TlsStream { inner: stream }),
            Err(HandshakeError::WouldBlock(mut mid)) => loop {
                let interest = handshake_interest(&mid);
                mid.get_ref().wait_ready(interest)?;
                match mid.handshake() {
                    Ok(stream) => return Ok(TlsStream { inner: stream }),
                    Err(HandshakeError::WouldBlock(next)) => mid = next,
                    Err(other) => return Err(handshake_error(other)),
                }
            },
            Err(other) => Err(handshake_error(other)),
        }
    }
}

/// Client-side TLS configuration.
pub struct TlsConnector {
    inner: SslConnector,
}

impl TlsConnector {
    /// Build a connector. `verify_peer = false` mirrors a test/self-signed
    /// setup where there is no trusted chain to validate against, exercising
    /// the handshake/record path rather than certificate validation policy.
    pub fn new(verify_peer: bool) -> Result<TlsConnector, CoroError> {
        let mut builder = SslConnector::builder(SslMethod::tls())?;
        if !verify_peer {
            builder.set_verify(SslVerifyMode::NONE);
        }
        Ok(TlsConnector { inner: builder.build() })
    }

    /// Begin a client handshake against `domain` over an already-connected
    /// plain `TcpStream`.
    pub fn connect(&self, domain: &str, stream: TcpStream) -> Result<TlsStream, CoroError> {
        match self.inner.connect(domain, stream) {
            Ok(stream) => Ok(TlsStream { inner: stream }),
            Err(HandshakeError::WouldBlock(mut mid)) => loop {
                let interest = handshake_interest(&mid);
                mid.get_ref().wait_ready(interest)?;
                match mid.handshake() {
                    Ok(stream) => return Ok(TlsStream { inner: stream }),
                    Err(HandshakeError::WouldBlock(next)) => mid = next,
                    Err(other) => return Err(handshake_error(other)),
                }
            },
            Err(other) => Err(handshake_error(other)),
        }
    }
}

fn handshake_interest(mid: &openssl::ssl::MidHandshakeSslStream<TcpStream>) -> Ready {
    use openssl::ssl::ErrorCode;
    if mid.error().code() == ErrorCode::WANT_WRITE {
        Ready::writable()
    } else {
        Ready::readable()
    }
}

fn handshake_error(err: HandshakeError<TcpStream>) -> CoroError {
    match err {
        HandshakeError::SetupFailure(e) => {
            CoroError::Io(io::Error::new(io::ErrorKind::Other, format!("TLS setup failed: {}", e)))
        }
        HandshakeError::Failure(mid) => CoroError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("TLS handshake failed: {}", mid.error()),
        )),
        HandshakeError::WouldBlock(_) => unreachable!("WouldBlock handled by the retry loop"),
    }
}

/// An established TLS connection, API-compatible with `TcpStream`'s
/// recv/send/recvall/sendall/message-framing surface.
pub struct TlsStream {
    inner: SslStream<TcpStream>,
}

impl TlsStream {
    /// Retry `attempt` against the underlying `SslStream` until it succeeds
    /// or fails with something other than `WouldBlock`. We re-arm the same
    /// `interest` the caller passed in rather than inspecting the SSL error
    /// code on every read/write retry (unlike the handshake driver above,
    /// which must): ordinary post-handshake reads/writes only need the
    /// opposite direction during a renegotiation, which never happens here.
    fn perform<T>(
        &mut self,
        interest: Ready,
        mut attempt: impl FnMut(&mut SslStream<TcpStream>) -> io::Result<T>,
    ) -> Result<T, CoroError> {
        loop {
            match attempt(&mut self.inner) {
                Ok(v) => return Ok(v),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.inner.get_ref().wait_ready(interest)?;
                }
                Err(e) => return Err(CoroError::Io(e)),
            }
        }
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, CoroError> {
        self.perform(Ready::readable(), |s| s.read(buf))
    }

    pub fn send(&mut self, buf: &[u8]) -> Result<usize, CoroError> {
        self.perform(Ready::writable(), |s| s.write(buf))
    }

    fn recvall_or_disconnect(&mut self, buf: &mut [u8]) -> Result<bool, CoroError> {
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

    pub fn recvall(&mut self, buf: &mut [u8]) -> Result<(), CoroError> {
        if !self.recvall_or_disconnect(buf)? {
            return Err(CoroError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed connection before recvall completed",
            )));
        }
        Ok(())
    }

    pub fn sendall(&mut self, buf: &[u8]) -> Result<(), CoroError> {
        let mut sent = 0;
        while sent < buf.len() {
            sent += self.send(&buf[sent..])?;
        }
        Ok(())
    }

    pub fn recv_message(&mut self) -> Result<Option<Vec<u8>>, CoroError> {
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

    pub fn send_message(&mut self, body: &[u8]) -> Result<(), CoroError> {
        let header = (body.len() as u32).to_be_bytes();
        self.sendall(&header)?;
        self.sendall(body)
    }
}
