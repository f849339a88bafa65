//! End-to-end sessions over localhost UDP.

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use arq256::{
    dial, dial_with_options, listen, listen_with_options, protocol, stats, Command, Error,
    SegmentHeader, Session,
};

fn tune(sess: &Session) {
    sess.set_nodelay(true, 10, 2, true);
    sess.set_window_size(1024, 1024);
}

#[test]
fn echo_one_hundred_messages() {
    let listener = listen("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let sess = listener.accept().unwrap();
        tune(&sess);
        let mut buf = [0u8; 256];
        for _ in 0..100 {
            let n = sess.read(&mut buf).unwrap();
            sess.write(&buf[..n]).unwrap();
        }
    });

    let sess = dial(addr).unwrap();
    tune(&sess);
    sess.set_read_deadline(Some(Instant::now() + Duration::from_secs(10)));

    let mut buf = [0u8; 256];
    for i in 0..100u64 {
        sess.write(&i.to_le_bytes()).unwrap();
        let n = sess.read(&mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(u64::from_le_bytes(buf[..8].try_into().unwrap()), i);
    }

    server.join().unwrap();
    sess.close().unwrap();
}

#[test]
fn echo_with_fec_enabled() {
    let listener = listen_with_options("127.0.0.1:0", 10, 3).unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let sess = listener.accept().unwrap();
        tune(&sess);
        let mut buf = [0u8; 256];
        for _ in 0..50 {
            let n = sess.read(&mut buf).unwrap();
            sess.write(&buf[..n]).unwrap();
        }
    });

    let sess = dial_with_options(addr, 10, 3).unwrap();
    tune(&sess);
    sess.set_read_deadline(Some(Instant::now() + Duration::from_secs(10)));

    let mut buf = [0u8; 256];
    for i in 0..50u64 {
        sess.write(&i.to_le_bytes()).unwrap();
        let n = sess.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &i.to_le_bytes());
    }

    server.join().unwrap();
    sess.close().unwrap();
}

#[test]
fn stream_transfer_is_byte_identical() {
    const TOTAL: usize = 4 * 1024 * 1024;

    let listener = listen("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || -> Vec<u8> {
        let sess = listener.accept().unwrap();
        tune(&sess);
        sess.set_stream_mode(true);
        sess.set_read_deadline(Some(Instant::now() + Duration::from_secs(60)));
        let mut received = Vec::with_capacity(TOTAL);
        let mut buf = [0u8; 64 * 1024];
        while received.len() < TOTAL {
            let n = sess.read(&mut buf).unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        received
    });

    let payload: Vec<u8> = (0..TOTAL).map(|i| (i * 31 % 251) as u8).collect();

    let sess = dial(addr).unwrap();
    tune(&sess);
    sess.set_stream_mode(true);
    sess.set_write_deadline(Some(Instant::now() + Duration::from_secs(60)));
    for chunk in payload.chunks(64 * 1024) {
        sess.write(chunk).unwrap();
    }

    let received = server.join().unwrap();
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
    sess.close().unwrap();
}

#[test]
fn close_is_idempotent() {
    let listener = listen("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let sess = dial(addr).unwrap();
    assert!(sess.close().is_ok());
    assert!(matches!(sess.close(), Err(Error::BrokenPipe)));

    let mut buf = [0u8; 16];
    assert!(matches!(sess.read(&mut buf), Err(Error::BrokenPipe)));
    assert!(matches!(sess.write(b"x"), Err(Error::BrokenPipe)));
    listener.close().unwrap();
}

#[test]
fn read_deadline_is_honoured() {
    let listener = listen("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let sess = dial(addr).unwrap();

    // A live deadline expires within one flush interval of schedule.
    sess.set_read_deadline(Some(Instant::now() + Duration::from_secs(1)));
    let start = Instant::now();
    let mut buf = [0u8; 16];
    let err = sess.read(&mut buf).unwrap_err();
    assert!(err.is_timeout());
    assert!(err.is_temporary());
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "woke early: {:?}", elapsed);
    assert!(
        elapsed < Duration::from_millis(1500),
        "woke late: {:?}",
        elapsed
    );

    // A deadline already in the past fails immediately.
    sess.set_read_deadline(Some(Instant::now() - Duration::from_secs(1)));
    let start = Instant::now();
    assert!(matches!(sess.read(&mut buf), Err(Error::Timeout)));
    assert!(start.elapsed() < Duration::from_millis(100));

    sess.close().unwrap();
    listener.close().unwrap();
}

#[test]
fn write_deadline_fires_when_window_is_full() {
    // Peer that swallows every datagram without ever acking.
    let blackhole = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = blackhole.local_addr().unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let sess = Session::client(socket, addr, 42, 0, 0).unwrap();
    sess.set_nodelay(true, 10, 0, true);
    sess.set_write_deadline(Some(Instant::now() + Duration::from_millis(500)));

    let msg = [0u8; 32];
    let mut hit_deadline = false;
    for _ in 0..256 {
        match sess.write(&msg) {
            Ok(_) => continue,
            Err(Error::Timeout) => {
                hit_deadline = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(hit_deadline, "window never filled against a silent peer");
    sess.close().unwrap();
}

#[test]
fn foreign_conversation_is_rejected() {
    // Hand-rolled peer socket the session will treat as its remote.
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let sess = Session::client(socket, peer_addr, 1, 0, 0).unwrap();
    let local = sess.local_addr().unwrap();

    let errors_before = stats().snapshot().input_errors;

    let mut dgram = [0u8; protocol::OVERHEAD];
    SegmentHeader {
        conv: 0xDEAD_BEEF,
        cmd: Command::Push as u8,
        wnd: 64,
        ..Default::default()
    }
    .encode(&mut dgram);
    peer.send_to(&dgram, local).unwrap();

    // Nothing is delivered and the error counter moves.
    sess.set_read_deadline(Some(Instant::now() + Duration::from_millis(400)));
    let mut buf = [0u8; 64];
    assert!(matches!(sess.read(&mut buf), Err(Error::Timeout)));
    assert!(stats().snapshot().input_errors > errors_before);
    sess.close().unwrap();
}

#[test]
fn accept_honours_deadline() {
    let listener = listen("127.0.0.1:0").unwrap();
    listener.set_deadline(Some(Instant::now() + Duration::from_millis(300)));
    let start = Instant::now();
    assert!(matches!(listener.accept(), Err(Error::Timeout)));
    assert!(start.elapsed() >= Duration::from_millis(300));
    listener.close().unwrap();
}

#[test]
fn closing_listener_unblocks_accept() {
    let listener = listen("127.0.0.1:0").unwrap();
    let waiter = {
        let listener = std::sync::Arc::new(listener);
        let l = listener.clone();
        let h = std::thread::spawn(move || l.accept());
        std::thread::sleep(Duration::from_millis(100));
        listener.close().unwrap();
        assert!(matches!(listener.accept(), Err(Error::BrokenPipe)));
        h
    };
    assert!(matches!(waiter.join().unwrap(), Err(Error::BrokenPipe)));
}

#[test]
fn duplicated_datagrams_deliver_once() {
    let listener = listen("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let sess = listener.accept().unwrap();
        tune(&sess);
        sess.set_read_deadline(Some(Instant::now() + Duration::from_secs(5)));
        let mut buf = [0u8; 64];
        let mut got = Vec::new();
        for _ in 0..10 {
            let n = sess.read(&mut buf).unwrap();
            got.push(buf[..n].to_vec());
        }
        // No eleventh message may surface from the duplicates.
        sess.set_read_deadline(Some(Instant::now() + Duration::from_millis(300)));
        assert!(matches!(sess.read(&mut buf), Err(Error::Timeout)));
        got
    });

    let sess = dial(addr).unwrap();
    tune(&sess);
    sess.set_dup(1);
    for i in 0..10u32 {
        sess.write(&i.to_le_bytes()).unwrap();
    }

    let got = server.join().unwrap();
    assert_eq!(got.len(), 10);
    for (i, msg) in got.iter().enumerate() {
        assert_eq!(msg.as_slice(), (i as u32).to_le_bytes());
    }
    sess.close().unwrap();
}

#[test]
fn sessions_expose_addresses_and_conv() {
    let listener = listen("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let sess = listener.accept().unwrap();
        let conv = sess.conv();
        let mut buf = [0u8; 16];
        let n = sess.read(&mut buf).unwrap();
        (conv, buf[..n].to_vec())
    });

    let sess = dial(addr).unwrap();
    assert_eq!(sess.peer_addr(), addr);
    sess.write(b"ping").unwrap();

    let (server_conv, payload) = server.join().unwrap();
    assert_eq!(server_conv, sess.conv());
    assert_eq!(payload, b"ping");
    sess.close().unwrap();
}

#[test]
fn socket_setters_require_ownership() {
    let listener = listen("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let sess = listener.accept().unwrap();
        // Server-side sessions share the listener's socket.
        assert!(matches!(sess.set_dscp(10), Err(Error::InvalidOperation)));
        assert!(matches!(
            sess.set_read_buffer(64 * 1024),
            Err(Error::InvalidOperation)
        ));
        let mut buf = [0u8; 16];
        let n = sess.read(&mut buf).unwrap();
        n
    });

    let sess = dial(addr).unwrap();
    // Client sessions own theirs.
    sess.set_dscp(10).unwrap();
    sess.set_read_buffer(64 * 1024).unwrap();
    sess.set_write_buffer(64 * 1024).unwrap();
    sess.write(b"ok").unwrap();

    assert_eq!(server.join().unwrap(), 2);
    sess.close().unwrap();
}
