use evport::{Error, EventPortBuilder, OpKind, TcpListener};

use bytes::BytesMut;
use std::io::Write;
use std::net::TcpStream as StdTcpStream;

#[test]
fn test_pending_accept_completes_on_connection() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let listener = TcpListener::bind(&port, "127.0.0.1:0".parse().unwrap()).unwrap();
    let target = listener.local_addr();

    let future = listener.accept();

    let mut client = StdTcpStream::connect(target).unwrap();
    let (channel, peer_addr) = future.get().expect("accept should complete");
    assert_eq!(Some(peer_addr), client.local_addr().ok());
    assert!(channel.is_connected());

    // The accepted channel reads what the client writes.
    client.write_all(b"hi").unwrap();
    let (n, buf) = channel
        .read(BytesMut::with_capacity(16), None)
        .get()
        .unwrap();
    assert_eq!(n, 2);
    assert_eq!(&buf[..], b"hi");

    channel.close();
    listener.close();
}

#[test]
fn test_second_accept_fails_with_already_pending() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let listener = TcpListener::bind(&port, "127.0.0.1:0".parse().unwrap()).unwrap();

    let first = listener.accept();
    let second = listener.accept();
    assert!(matches!(
        second.get(),
        Err(Error::AlreadyPending(OpKind::Accept))
    ));

    let _client = StdTcpStream::connect(listener.local_addr()).unwrap();
    let (channel, _) = first.get().expect("first accept should complete");

    channel.close();
    listener.close();
}

#[test]
fn test_ready_accept_completes_synchronously() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let listener = TcpListener::bind(&port, "127.0.0.1:0".parse().unwrap()).unwrap();

    let _client = StdTcpStream::connect(listener.local_addr()).unwrap();
    // Give the connection time to land in the accept queue.
    std::thread::sleep(std::time::Duration::from_millis(200));

    let future = listener.accept();
    assert!(future.completed_synchronously());
    let (channel, _) = future.get().unwrap();

    channel.close();
    listener.close();
}
