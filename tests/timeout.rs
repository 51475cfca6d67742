//! Per-operation socket timeouts, including the race between an arriving
//! resume and an in-flight timeout.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use asyncoro::net::{TcpListener, TcpStream};
use asyncoro::CoroError;

fn local_addr(listener: &TcpListener) -> SocketAddr {
    listener.local_addr().expect("listener has no local address")
}

fn init_logging() {
    let _ = env_logger::try_init();
}

#[test]
fn recv_times_out_when_the_peer_never_replies() {
    init_logging();
    let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).expect("bind failed");
    let addr = local_addr(&listener);

    // Accepts and then just holds the connection open without ever writing
    // to it.
    let server = asyncoro::spawn(move || {
        let (conn, _peer) = listener.accept().expect("accept failed");
        asyncoro::sleep(Duration::from_millis(500)).ok();
        drop(conn);
    });

    let client = asyncoro::spawn(move || {
        let conn = TcpStream::connect(&addr).expect("connect failed");
        conn.set_timeout(Some(Duration::from_millis(50)));
        let started = Instant::now();
        let mut buf = [0u8; 1];
        let result = conn.recv(&mut buf);
        let elapsed = started.elapsed();
        (result, elapsed)
    });

    let (result, elapsed) = client.value();
    assert!(matches!(result, Err(CoroError::TimedOut)), "expected TimedOut, got {:?}", result.err());
    assert!(elapsed >= Duration::from_millis(50), "fired too early: {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(150), "fired too late: {:?}", elapsed);

    server.value();
}

#[test]
fn io_completion_racing_a_timeout_always_resolves_to_exactly_one_outcome() {
    init_logging();
    // A coroutine is suspended with a short per-op timeout while the peer's
    // write lands at roughly the same instant. Every trial must resolve to
    // either the data or `TimedOut`, never a hang and never both.
    const TRIALS: u32 = 20;
    const TIMEOUT: Duration = Duration::from_millis(20);

    for trial in 0..TRIALS {
        let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).expect("bind failed");
        let addr = local_addr(&listener);

        // Stagger the server's write around the client's deadline so some
        // trials land before it, some after.
        let offset_ms = (trial % 5) as i64 * 10 - 20; // -20..=20ms around TIMEOUT
        let server = asyncoro::spawn(move || {
            let (conn, _peer) = listener.accept().expect("accept failed");
            let delay = (TIMEOUT.as_millis() as i64 + offset_ms).max(0) as u64;
            asyncoro::sleep(Duration::from_millis(delay)).ok();
            let _ = conn.send(b"!");
        });

        let client = asyncoro::spawn(move || {
            let conn = TcpStream::connect(&addr).expect("connect failed");
            conn.set_timeout(Some(TIMEOUT));
            let mut buf = [0u8; 1];
            conn.recv(&mut buf)
        });

        let result = client.value();
        match result {
            Ok(n) => assert_eq!(n, 1, "trial {trial}: partial read should not happen for a 1-byte send"),
            Err(CoroError::TimedOut) => {}
            Err(other) => panic!("trial {trial}: unexpected error {:?}", other),
        }
        server.value();
    }
}
