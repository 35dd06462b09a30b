use evport::{Error, EventPort, EventPortBuilder, OpKind, TcpChannel};

use bytes::{Bytes, BytesMut};
use std::io::Write;
use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Connects a channel to a std stream over loopback.
fn connected_pair(port: &Arc<EventPort>) -> (Arc<TcpChannel>, StdTcpStream) {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let target = listener.local_addr().unwrap();

    let channel = TcpChannel::open(port).unwrap();
    let future = channel.connect(target);
    let (peer, _) = listener.accept().unwrap();
    future.get().expect("connect should succeed");

    (channel, peer)
}

#[test]
fn test_pending_read_completes_when_data_arrives() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, mut peer) = connected_pair(&port);

    let future = channel.read(BytesMut::with_capacity(64), None);

    peer.write_all(b"hello").unwrap();
    peer.flush().unwrap();

    let (n, buf) = future.get().expect("read should complete");
    assert_eq!(n, 5);
    assert_eq!(&buf[..], b"hello");

    channel.close();
}

#[test]
fn test_second_read_fails_with_already_pending() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, mut peer) = connected_pair(&port);

    let first = channel.read(BytesMut::with_capacity(64), None);
    let second = channel.read(BytesMut::with_capacity(64), None);

    assert!(
        matches!(second.get(), Err(Error::AlreadyPending(OpKind::Read))),
        "second read must fail fast"
    );

    peer.write_all(b"data").unwrap();
    let (n, _) = first.get().expect("first read should still complete");
    assert_eq!(n, 4);

    channel.close();
}

#[test]
fn test_write_completes() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, mut peer) = connected_pair(&port);

    let future = channel.write(Bytes::from_static(b"payload"), None);
    let n = future.get().expect("write should complete");
    assert_eq!(n, 7);

    let mut received = [0u8; 7];
    std::io::Read::read_exact(&mut peer, &mut received).unwrap();
    assert_eq!(&received, b"payload");

    channel.close();
}

#[test]
fn test_scattering_read_completes_synchronously() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, mut peer) = connected_pair(&port);

    // Make 300 bytes available before the read is issued.
    let data = vec![0xABu8; 300];
    peer.write_all(&data).unwrap();
    peer.flush().unwrap();
    thread::sleep(Duration::from_millis(200));

    let bufs = vec![
        BytesMut::with_capacity(100),
        BytesMut::with_capacity(100),
        BytesMut::with_capacity(100),
    ];
    let future = channel.read_vectored(bufs, None);
    assert!(
        future.completed_synchronously(),
        "data was available; no pending state should be created"
    );

    let (total, bufs) = future.get().expect("scattering read should complete");
    assert_eq!(total, 300u64);
    for buf in &bufs {
        assert_eq!(buf.len(), 100);
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    channel.close();
}

#[test]
fn test_handler_receives_outcome_and_attachment() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, mut peer) = connected_pair(&port);

    let (sender, receiver) = mpsc::channel();
    let future = channel.read_with(
        BytesMut::with_capacity(64),
        None,
        42usize,
        move |outcome, attachment| {
            let n = outcome.map(|(n, _)| n);
            sender.send((n, attachment)).unwrap();
        },
    );

    peer.write_all(b"xyz").unwrap();

    let (outcome, attachment) = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(outcome.unwrap(), 3);
    assert_eq!(attachment, 42);

    // With a handler attached the pull path is off limits.
    assert!(matches!(future.get(), Err(Error::InvalidInput(_))));

    channel.close();
}

#[test]
fn test_second_write_fails_while_first_is_pending() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, peer) = connected_pair(&port);

    // Fill the socket buffer until a write parks.
    let chunk = Bytes::from(vec![0u8; 1 << 20]);
    let mut pending = None;
    for _ in 0..64 {
        let future = channel.write(chunk.clone(), None);
        if !future.completed_synchronously() {
            pending = Some(future);
            break;
        }
        future.get().unwrap();
    }
    let pending = pending.expect("socket buffer should fill and park a write");

    let second = channel.write(Bytes::from_static(b"x"), None);
    assert!(
        matches!(second.get(), Err(Error::AlreadyPending(OpKind::Write))),
        "second write must fail fast while the first is pending"
    );

    // Drain the peer so the parked write can complete.
    let mut peer_reader = peer.try_clone().unwrap();
    let drain = thread::spawn(move || {
        let mut sink = [0u8; 64 * 1024];
        loop {
            match std::io::Read::read(&mut peer_reader, &mut sink) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let n = pending.get().expect("first write should eventually complete");
    assert!(n > 0);

    channel.close();
    drop(peer);
    drain.join().unwrap();
}

#[test]
fn test_reads_and_writes_are_independent() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, mut peer) = connected_pair(&port);

    // A pending read does not block a write on the same channel.
    let read_future = channel.read(BytesMut::with_capacity(64), None);
    let write_future = channel.write(Bytes::from_static(b"ping"), None);

    assert_eq!(write_future.get().unwrap(), 4);

    peer.write_all(b"pong").unwrap();
    let (n, buf) = read_future.get().unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf[..], b"pong");

    channel.close();
}
