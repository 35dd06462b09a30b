use evport::{Error, EventPortBuilder, OpKind, UdpChannel};

use bytes::{Bytes, BytesMut};
use std::net::UdpSocket as StdUdpSocket;
use std::time::Duration;

#[test]
fn test_pending_receive_completes_on_datagram() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let channel = UdpChannel::bind(&port, "127.0.0.1:0".parse().unwrap()).unwrap();

    let future = channel.receive(BytesMut::with_capacity(64), None);

    let sender = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"datagram", channel.local_addr()).unwrap();

    let (n, peer, buf) = future.get().expect("receive should complete");
    assert_eq!(n, 8);
    assert_eq!(&buf[..], b"datagram");
    assert_eq!(Some(peer), sender.local_addr().ok());

    channel.close();
}

#[test]
fn test_second_receive_fails_with_already_pending() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let channel = UdpChannel::bind(&port, "127.0.0.1:0".parse().unwrap()).unwrap();

    let first = channel.receive(BytesMut::with_capacity(64), None);
    let second = channel.receive(BytesMut::with_capacity(64), None);
    assert!(matches!(
        second.get(),
        Err(Error::AlreadyPending(OpKind::Receive))
    ));

    let sender = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"x", channel.local_addr()).unwrap();
    let (n, _, _) = first.get().unwrap();
    assert_eq!(n, 1);

    channel.close();
}

#[test]
fn test_receive_times_out() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let channel = UdpChannel::bind(&port, "127.0.0.1:0".parse().unwrap()).unwrap();

    let future = channel.receive(
        BytesMut::with_capacity(64),
        Some(Duration::from_millis(100)),
    );
    assert!(matches!(future.get(), Err(Error::TimedOut)));

    // The channel stays usable after a timed-out receive.
    let sender = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"late", channel.local_addr()).unwrap();
    let (n, _, _) = channel
        .receive(BytesMut::with_capacity(64), None)
        .get()
        .unwrap();
    assert_eq!(n, 4);

    channel.close();
}

#[test]
fn test_send_completes_synchronously() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let channel = UdpChannel::bind(&port, "127.0.0.1:0".parse().unwrap()).unwrap();

    let receiver = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    let future = channel.send(
        Bytes::from_static(b"outbound"),
        receiver.local_addr().unwrap(),
    );
    assert!(future.completed_synchronously());
    assert_eq!(future.get().unwrap(), 8);

    let mut buf = [0u8; 16];
    let (n, _) = receiver.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"outbound");

    channel.close();
}
