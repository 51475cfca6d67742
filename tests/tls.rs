//! TLS-wrapped echo: same shape as the plain echo test, but the server
//! presents a cert/key pair and the client completes a handshake before
//! exchanging any application data.

use std::fs::File;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509NameBuilder, X509};

use asyncoro::net::{TcpListener, TcpStream, TlsAcceptor, TlsConnector};

/// Generate a throwaway self-signed certificate/key pair for "localhost" and
/// write them out as PEM files under the OS temp dir, returning their paths.
/// Real deployments load an operator-provisioned cert; tests have no such
/// thing to load, so we mint one on the fly exactly the way the `openssl`
/// crate's own test suites do.
fn self_signed_cert(tag: &str) -> (PathBuf, PathBuf) {
    let rsa = Rsa::generate(2048).expect("rsa keygen failed");
    let pkey = PKey::from_rsa(rsa).expect("pkey wrap failed");

    let mut name_builder = X509NameBuilder::new().expect("name builder failed");
    name_builder.append_entry_by_text("CN", "localhost").unwrap();
    let name = name_builder.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = X509::builder().expect("x509 builder failed");
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    let mut cert_path = std::env::temp_dir();
    cert_path.push(format!("asyncoro-test-{}-cert.pem", tag));
    File::create(&cert_path)
        .unwrap()
        .write_all(&cert.to_pem().unwrap())
        .unwrap();

    let mut key_path = std::env::temp_dir();
    key_path.push(format!("asyncoro-test-{}-key.pem", tag));
    File::create(&key_path)
        .unwrap()
        .write_all(&pkey.private_key_to_pem_pkcs8().unwrap())
        .unwrap();

    (cert_path, key_path)
}

fn local_addr(listener: &TcpListener) -> SocketAddr {
    listener.local_addr().expect("listener has no local address")
}

fn init_logging() {
    let _ = env_logger::try_init();
}

#[test]
fn tls_echo_round_trips_after_handshake() {
    init_logging();
    let (cert_path, key_path) = self_signed_cert("echo");

    let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).expect("bind failed");
    let addr = local_addr(&listener);

    let server = asyncoro::spawn(move || {
        let acceptor = TlsAcceptor::new(&cert_path, &key_path).expect("acceptor build failed");
        let (conn, _peer) = listener.accept().expect("accept failed");
        let mut tls = acceptor.accept(conn).expect("server handshake failed");
        let mut buf = [0u8; 11];
        tls.recvall(&mut buf).expect("recvall failed");
        tls.sendall(&buf).expect("sendall failed");
    });

    let client = asyncoro::spawn(move || {
        // `verify_peer = false`: the self-signed cert minted above has no
        // chain to a trusted root, so this exercises the handshake/record
        // path rather than certificate validation policy (out of scope).
        let connector = TlsConnector::new(false).expect("connector build failed");
        let conn = TcpStream::connect(&addr).expect("connect failed");
        let mut tls = connector.connect("localhost", conn).expect("client handshake failed");
        tls.sendall(b"hello world").expect("sendall failed");
        let mut buf = [0u8; 11];
        tls.recvall(&mut buf).expect("recvall failed");
        assert_eq!(&buf, b"hello world");
    });

    server.value();
    client.value();
}
