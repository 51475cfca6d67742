//! Length-prefixed message framing: a 4-byte big-endian length header
//! followed by the payload, and graceful-disconnect handling for short reads.

use std::io::Write;
use std::net::{SocketAddr, TcpStream as StdTcpStream};

use asyncoro::net::{TcpListener, TcpStream};

fn local_addr(listener: &TcpListener) -> SocketAddr {
    listener.local_addr().expect("listener has no local address")
}

fn init_logging() {
    let _ = env_logger::try_init();
}

#[test]
fn recv_message_round_trips_send_message() {
    init_logging();
    let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).expect("bind failed");
    let addr = local_addr(&listener);

    let payloads: Vec<Vec<u8>> = vec![
        b"x".to_vec(),
        b"hello world".to_vec(),
        vec![0xABu8; 70_000], // exercises a body larger than one read(2)
    ];
    let expected = payloads.clone();

    let server = asyncoro::spawn(move || {
        let (conn, _peer) = listener.accept().expect("accept failed");
        let mut received = Vec::new();
        for _ in 0..payloads.len() {
            let msg = conn.recv_message().expect("recv_message failed");
            received.push(msg.expect("expected a message, got disconnect"));
        }
        received
    });

    let client = asyncoro::spawn(move || {
        let conn = TcpStream::connect(&addr).expect("connect failed");
        for payload in &expected {
            conn.send_message(payload).expect("send_message failed");
        }
    });

    client.value();
    let received = server.value();
    assert_eq!(received, payloads);
}

#[test]
fn recv_message_returns_none_on_short_header() {
    init_logging();
    // A peer that announces a 100-byte body and then closes without ever
    // sending it must look like a graceful disconnect, not an error.
    let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).expect("bind failed");
    let addr = local_addr(&listener);

    let server = asyncoro::spawn(move || {
        let (conn, _peer) = listener.accept().expect("accept failed");
        conn.recv_message().expect("recv_message should not error on disconnect")
    });

    // Use a plain std (blocking) socket on the client side: the scenario is
    // about what the *receiver* observes, not about exercising the async
    // connect path a second time.
    let mut client = StdTcpStream::connect(addr).expect("connect failed");
    client.write_all(&100u32.to_be_bytes()).expect("write failed");
    drop(client); // close before sending the promised 100-byte body

    let result = server.value();
    assert!(result.is_none());
}
