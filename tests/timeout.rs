use evport::{Error, EventPort, EventPortBuilder, TcpChannel};

use bytes::BytesMut;
use std::io::Write;
use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

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
fn test_read_times_out() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, peer) = connected_pair(&port);

    let started = Instant::now();
    let future = channel.read(BytesMut::with_capacity(64), Some(Duration::from_millis(100)));
    let error = future.get().unwrap_err();

    assert!(matches!(error, Error::TimedOut), "unexpected error: {error}");
    assert!(
        started.elapsed() >= Duration::from_millis(100),
        "timeout fired early"
    );
    assert!(channel.is_open(), "timeout must not close the channel");

    drop(peer);
    channel.close();
}

#[test]
fn test_read_after_timeout_succeeds() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, mut peer) = connected_pair(&port);

    let timed_out = channel.read(BytesMut::with_capacity(64), Some(Duration::from_millis(50)));
    assert!(matches!(timed_out.get(), Err(Error::TimedOut)));

    // The timed-out operation released its slot and interest; an unrelated
    // read on the same channel works.
    peer.write_all(b"later").unwrap();
    let (n, buf) = channel
        .read(BytesMut::with_capacity(64), None)
        .get()
        .expect("subsequent read should succeed");
    assert_eq!(n, 5);
    assert_eq!(&buf[..], b"later");

    channel.close();
}

#[test]
fn test_completed_read_cancels_timer() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, mut peer) = connected_pair(&port);

    let future = channel.read(BytesMut::with_capacity(64), Some(Duration::from_secs(5)));
    peer.write_all(b"fast").unwrap();

    let (n, _) = future.get().expect("read should beat the timeout");
    assert_eq!(n, 4);

    channel.close();
}

#[test]
fn test_get_timeout_leaves_operation_pending() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, mut peer) = connected_pair(&port);

    // No operation timeout: the pull wait elapses but the read stays parked.
    let future = channel.read(BytesMut::with_capacity(64), None);
    assert!(matches!(
        future.get_timeout(Duration::from_millis(50)),
        Err(Error::TimedOut)
    ));
    assert!(!future.is_done(), "pull timeout must not settle the read");

    peer.write_all(b"eventually").unwrap();
    let (n, _) = future.get().expect("read should still complete");
    assert_eq!(n, 10);

    channel.close();
}
