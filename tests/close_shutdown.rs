use evport::{Error, EventPort, EventPortBuilder, TcpChannel, TcpListener};

use bytes::BytesMut;
use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::Arc;
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
fn test_close_fails_pending_read() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, _peer) = connected_pair(&port);

    let future = channel.read(BytesMut::with_capacity(64), None);
    channel.close();

    assert!(
        matches!(future.get(), Err(Error::Closed)),
        "pending read must observe the close"
    );
    assert!(!channel.is_open());
}

#[test]
fn test_operations_on_closed_channel_fail_immediately() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, _peer) = connected_pair(&port);
    channel.close();

    assert!(matches!(
        channel.read(BytesMut::with_capacity(64), None).get(),
        Err(Error::Closed)
    ));
    assert!(matches!(
        channel
            .write(bytes::Bytes::from_static(b"x"), None)
            .get(),
        Err(Error::Closed)
    ));
}

#[test]
fn test_shutdown_rejects_new_channels() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    port.shutdown();

    assert!(port.is_shutdown());
    assert!(matches!(TcpChannel::open(&port), Err(Error::Shutdown)));
    assert!(
        port.await_termination(Duration::from_secs(5)),
        "an empty group terminates as soon as shutdown is requested"
    );
}

#[test]
fn test_graceful_shutdown_waits_for_last_channel() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (channel, _peer) = connected_pair(&port);

    port.shutdown();
    assert!(port.is_shutdown());
    assert!(
        !port.is_terminated(),
        "group must wait for the open channel"
    );

    channel.close();
    assert!(
        port.await_termination(Duration::from_secs(5)),
        "closing the last channel terminates the group"
    );
}

#[test]
fn test_shutdown_now_fails_all_pending_operations() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let (first, _peer_a) = connected_pair(&port);
    let (second, _peer_b) = connected_pair(&port);

    let read_a = first.read(BytesMut::with_capacity(64), None);
    let read_b = second.read(BytesMut::with_capacity(64), None);

    port.shutdown_now();

    assert!(matches!(read_a.get(), Err(Error::Closed)));
    assert!(matches!(read_b.get(), Err(Error::Closed)));
    assert!(!first.is_open());
    assert!(!second.is_open());
    assert!(port.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_close_listener_fails_pending_accept() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let listener = TcpListener::bind(&port, "127.0.0.1:0".parse().unwrap()).unwrap();

    let future = listener.accept();
    listener.close();

    assert!(matches!(future.get(), Err(Error::Closed)));
}
