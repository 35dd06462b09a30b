use evport::{Error, EventPortBuilder, TcpChannel};

use std::net::TcpListener as StdTcpListener;

#[test]
fn test_connect_to_listening_socket() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let target = listener.local_addr().unwrap();

    let channel = TcpChannel::open(&port).unwrap();
    let future = channel.connect(target);
    future.get().expect("connect should succeed");

    assert!(channel.is_connected());
    assert_eq!(channel.remote_addr(), Some(target));
    assert!(channel.local_addr().is_some(), "local address populated");

    let (_peer, peer_addr) = listener.accept().unwrap();
    assert_eq!(Some(peer_addr), channel.local_addr());

    channel.close();
}

#[test]
fn test_second_connect_fails_fast() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let target = listener.local_addr().unwrap();

    let channel = TcpChannel::open(&port).unwrap();
    let first = channel.connect(target);
    let second = channel.connect(target);

    // Whichever stage the first connect reached, the second must fail fast.
    let error = second.get().unwrap_err();
    assert!(
        matches!(error, Error::ConnectionPending | Error::AlreadyConnected),
        "unexpected error: {error}"
    );

    first.get().expect("first connect should succeed");
    channel.close();
}

#[test]
fn test_connect_on_closed_channel() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let channel = TcpChannel::open(&port).unwrap();
    channel.close();

    let future = channel.connect("127.0.0.1:1".parse().unwrap());
    assert!(matches!(future.get(), Err(Error::Closed)));
}

#[test]
fn test_connect_to_refusing_address_fails() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();

    // Bind a listener to grab a free port, then close it so the connect is
    // refused.
    let target = {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let channel = TcpChannel::open(&port).unwrap();
    let future = channel.connect(target);
    assert!(future.get().is_err(), "connect to closed port should fail");
    assert!(!channel.is_open(), "failed connect closes the channel");
}
