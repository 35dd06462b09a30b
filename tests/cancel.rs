use evport::{Error, EventPort, EventPortBuilder, TcpChannel};

use bytes::BytesMut;
use std::io::Write;
use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

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
fn test_cancel_pending_read() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, mut peer) = connected_pair(&port);

    let (sender, receiver) = mpsc::channel();
    let future = channel.read_with(
        BytesMut::with_capacity(64),
        None,
        (),
        move |outcome, _| {
            sender.send(outcome.map(|(n, _)| n)).unwrap();
        },
    );

    assert!(future.cancel(), "cancel should win against an idle read");
    assert!(future.is_cancelled());
    assert!(!future.cancel(), "second cancel is a no-op");

    let outcome = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(outcome, Err(Error::Cancelled)));

    // The channel survives a cancelled read.
    peer.write_all(b"after").unwrap();
    let (n, _) = channel
        .read(BytesMut::with_capacity(64), None)
        .get()
        .expect("read after cancel should succeed");
    assert_eq!(n, 5);

    channel.close();
}

#[test]
fn test_cancel_after_completion_returns_false() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, mut peer) = connected_pair(&port);

    let future = channel.read(BytesMut::with_capacity(64), None);
    peer.write_all(b"done").unwrap();

    let (n, _) = future.get().unwrap();
    assert_eq!(n, 4);
    assert!(!future.cancel(), "completed operation cannot be cancelled");
    assert!(!future.is_cancelled());

    channel.close();
}

#[test]
fn test_cancel_racing_timeout_settles_exactly_once() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, _peer) = connected_pair(&port);

    let invocations = Arc::new(AtomicUsize::new(0));
    let (sender, receiver) = mpsc::channel();
    let counter = invocations.clone();
    let future = channel.read_with(
        BytesMut::with_capacity(64),
        Some(Duration::from_millis(50)),
        (),
        move |outcome, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            sender.send(outcome.map(|(n, _)| n)).unwrap();
        },
    );

    // Race the explicit cancel against the timeout firing.
    thread::sleep(Duration::from_millis(50));
    future.cancel();

    let outcome = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(
        matches!(outcome, Err(Error::Cancelled) | Err(Error::TimedOut)),
        "outcome must come from one of the racing completers"
    );

    // Give any duplicate dispatch a chance to surface, then check once-only.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    channel.close();
}

#[test]
fn test_cancelled_connect_closes_channel() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();

    // A listener with a saturated backlog keeps the connect pending long
    // enough to cancel it. If the connect still completes first, cancel
    // simply reports false.
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let target = listener.local_addr().unwrap();

    let channel = TcpChannel::open(&port).unwrap();
    let future = channel.connect(target);
    if future.cancel() {
        assert!(matches!(future.get(), Err(Error::Cancelled)));
        assert!(!channel.is_open(), "cancelled connect closes the channel");
    } else {
        future.get().expect("connect completed before the cancel");
        channel.close();
    }
}
