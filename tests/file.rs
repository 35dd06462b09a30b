use evport::{Error, EventPortBuilder, FileChannel};

use bytes::{Bytes, BytesMut};
use std::fs;

fn temp_path(name: &str) -> String {
    std::env::temp_dir()
        .join(format!("evport-{}-{}", name, std::process::id()))
        .to_string_lossy()
        .into_owned()
}

#[test]
fn test_write_then_read_roundtrip() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let path = temp_path("roundtrip");

    let writer = FileChannel::create(&port, &path).unwrap();
    let written = writer
        .write_at(Bytes::from_static(b"hello file"), 0)
        .get()
        .expect("write should complete");
    assert_eq!(written, 10);
    assert_eq!(writer.size().unwrap(), 10);
    writer.close();

    let reader = FileChannel::open(&port, &path).unwrap();
    let (n, buf) = reader
        .read_at(BytesMut::with_capacity(64), 0)
        .get()
        .expect("read should complete");
    assert_eq!(n, 10);
    assert_eq!(&buf[..], b"hello file");
    reader.close();

    fs::remove_file(&path).ok();
}

#[test]
fn test_positional_read() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let path = temp_path("positional");

    let channel = FileChannel::open_rw(&port, &path).unwrap();
    channel
        .write_at(Bytes::from_static(b"0123456789"), 0)
        .get()
        .unwrap();

    let (n, buf) = channel.read_at(BytesMut::with_capacity(4), 5).get().unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf[..], b"5678");

    channel.close();
    fs::remove_file(&path).ok();
}

#[test]
fn test_read_on_closed_file_fails() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let path = temp_path("closed");

    let channel = FileChannel::open_rw(&port, &path).unwrap();
    channel.close();

    let future = channel.read_at(BytesMut::with_capacity(16), 0);
    assert!(matches!(future.get(), Err(Error::Closed)));

    fs::remove_file(&path).ok();
}

#[test]
fn test_write_on_read_only_channel_fails() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let path = temp_path("readonly");
    fs::write(&path, b"content").unwrap();

    let channel = FileChannel::open(&port, &path).unwrap();
    let future = channel.write_at(Bytes::from_static(b"x"), 0);
    assert!(matches!(future.get(), Err(Error::InvalidInput(_))));

    channel.close();
    fs::remove_file(&path).ok();
}

#[test]
fn test_handler_delivery_on_pool_thread() {
    let port = EventPortBuilder::new().cached_pool(2).build().unwrap();
    let path = temp_path("handler");

    let channel = FileChannel::open_rw(&port, &path).unwrap();
    let (sender, receiver) = std::sync::mpsc::channel();
    channel.write_at_with(
        Bytes::from_static(b"abc"),
        0,
        "tag",
        move |outcome, attachment| {
            sender.send((outcome.unwrap(), attachment)).unwrap();
        },
    );

    let (n, attachment) = receiver
        .recv_timeout(std::time::Duration::from_secs(5))
        .unwrap();
    assert_eq!(n, 3);
    assert_eq!(attachment, "tag");

    channel.close();
    fs::remove_file(&path).ok();
}
