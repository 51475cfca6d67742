//! End-to-end echo scenario: a server coroutine accepts one connection,
//! reads exactly 11 bytes, echoes them back, and closes; a client coroutine
//! connects, writes "hello world", reads the echo, and asserts it
//! round-tripped.

use std::net::SocketAddr;

use asyncoro::net::{TcpListener, TcpStream};

fn local_addr(listener: &TcpListener) -> SocketAddr {
    listener.local_addr().expect("listener has no local address")
}

fn init_logging() {
    let _ = env_logger::try_init();
}

#[test]
fn echo_round_trips_and_both_sides_complete() {
    init_logging();
    let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).expect("bind failed");
    let addr = local_addr(&listener);

    let server = asyncoro::spawn(move || {
        let (conn, _peer) = listener.accept().expect("accept failed");
        let mut buf = [0u8; 11];
        conn.recvall(&mut buf).expect("recvall failed");
        conn.sendall(&buf).expect("sendall failed");
        conn.close();
    });

    let client = asyncoro::spawn(move || {
        let conn = TcpStream::connect(&addr).expect("connect failed");
        conn.sendall(b"hello world").expect("sendall failed");
        let mut buf = [0u8; 11];
        conn.recvall(&mut buf).expect("recvall failed");
        assert_eq!(&buf, b"hello world");
    });

    server.value();
    client.value();
}

#[test]
fn sendall_recvall_conserve_bytes_across_many_small_writes() {
    init_logging();
    let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).expect("bind failed");
    let addr = local_addr(&listener);

    const CHUNKS: usize = 64;
    const CHUNK_LEN: usize = 997; // deliberately not a multiple of any buffer size
    let total = CHUNKS * CHUNK_LEN;

    let server = asyncoro::spawn(move || {
        let (conn, _peer) = listener.accept().expect("accept failed");
        let mut buf = vec![0u8; total];
        conn.recvall(&mut buf).expect("recvall failed");
        buf
    });

    let client = asyncoro::spawn(move || {
        let conn = TcpStream::connect(&addr).expect("connect failed");
        for i in 0..CHUNKS {
            let chunk = vec![(i % 251) as u8; CHUNK_LEN];
            conn.sendall(&chunk).expect("sendall failed");
        }
    });

    client.value();
    let received = server.value();
    assert_eq!(received.len(), total);
    for (i, chunk) in received.chunks(CHUNK_LEN).enumerate() {
        assert!(chunk.iter().all(|&b| b == (i % 251) as u8));
    }
}
