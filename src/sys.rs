//! Thin non-blocking syscall wrappers.
//!
//! Everything the channels need from the operating system funnels through
//! this module: socket setup, the try-style read/write/connect/accept calls
//! whose `WouldBlock` outcome drives the pending-operation machinery, and
//! address conversions between `SocketAddr` and the raw sockaddr types.

use bytes::{Bytes, BytesMut};
use bytes::buf::BufMut;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;

/// Default amount of spare capacity reserved when a read buffer is full.
const READ_CHUNK: usize = 4 * 1024;

/// Outcome of a non-blocking attempt.
pub(crate) enum IoOutcome<T> {
    /// The syscall completed.
    Done(T),
    /// The descriptor was not ready; the operation must be parked.
    WouldBlock,
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn is_would_block(err: i32) -> bool {
    err == libc::EAGAIN || err == libc::EWOULDBLOCK
}

/// Retries a syscall interrupted by a signal.
fn retry(mut call: impl FnMut() -> isize) -> isize {
    loop {
        let result = call();
        if result != -1 || errno() != libc::EINTR {
            return result;
        }
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

pub(crate) fn tcp_socket(v6: bool) -> io::Result<RawFd> {
    new_socket(v6, libc::SOCK_STREAM)
}

pub(crate) fn udp_socket(v6: bool) -> io::Result<RawFd> {
    new_socket(v6, libc::SOCK_DGRAM)
}

fn new_socket(v6: bool, kind: libc::c_int) -> io::Result<RawFd> {
    let family = if v6 { libc::AF_INET6 } else { libc::AF_INET };
    let fd = unsafe { libc::socket(family, kind, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if let Err(err) = set_nonblocking(fd) {
        close_fd(fd);
        return Err(err);
    }
    Ok(fd)
}

pub(crate) fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let value: libc::c_int = 1;
    let result = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn bind_socket(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = to_sockaddr(addr);
    let result = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn listen_socket(fd: RawFd, backlog: i32) -> io::Result<()> {
    if unsafe { libc::listen(fd, backlog) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Local address of a bound socket via `getsockname`.
pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let result =
        unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    from_sockaddr(&storage)
}

/// Initiates a non-blocking connect.
pub(crate) fn try_connect(fd: RawFd, addr: &SocketAddr) -> io::Result<IoOutcome<()>> {
    let (storage, len) = to_sockaddr(addr);
    let result = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if result == 0 {
        return Ok(IoOutcome::Done(()));
    }
    let err = errno();
    if err == libc::EINPROGRESS || err == libc::EINTR || is_would_block(err) {
        return Ok(IoOutcome::WouldBlock);
    }
    Err(io::Error::last_os_error())
}

/// Resolves the outcome of a pending connect once the descriptor reports
/// writable, by reading `SO_ERROR`.
pub(crate) fn check_connect(fd: RawFd) -> io::Result<()> {
    let mut error: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    if error != 0 {
        return Err(io::Error::from_raw_os_error(error));
    }
    Ok(())
}

/// Accepts one pending connection, returning the new descriptor already in
/// non-blocking mode together with the peer address.
pub(crate) fn try_accept(fd: RawFd) -> io::Result<IoOutcome<(RawFd, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let client = retry(|| unsafe {
        libc::accept(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) as isize
    }) as RawFd;
    if client < 0 {
        let err = errno();
        if is_would_block(err) {
            return Ok(IoOutcome::WouldBlock);
        }
        return Err(io::Error::last_os_error());
    }
    if let Err(err) = set_nonblocking(client) {
        close_fd(client);
        return Err(err);
    }
    let peer = from_sockaddr(&storage)?;
    Ok(IoOutcome::Done((client, peer)))
}

/// Reads into the buffer's spare capacity.
///
/// `Done(0)` means end of stream. A full buffer has `READ_CHUNK` bytes
/// reserved before the read.
pub(crate) fn try_read_buf(fd: RawFd, buf: &mut BytesMut) -> io::Result<IoOutcome<usize>> {
    if buf.capacity() == buf.len() {
        buf.reserve(READ_CHUNK);
    }
    let chunk = buf.chunk_mut();
    let n = retry(|| unsafe { libc::read(fd, chunk.as_mut_ptr().cast(), chunk.len()) });
    if n >= 0 {
        unsafe { buf.advance_mut(n as usize) };
        return Ok(IoOutcome::Done(n as usize));
    }
    if is_would_block(errno()) {
        return Ok(IoOutcome::WouldBlock);
    }
    Err(io::Error::last_os_error())
}

/// Scattering read across the spare capacity of several buffers.
pub(crate) fn try_read_bufs(fd: RawFd, bufs: &mut [BytesMut]) -> io::Result<IoOutcome<u64>> {
    let mut iovecs = Vec::with_capacity(bufs.len());
    for buf in bufs.iter_mut() {
        if buf.capacity() == buf.len() {
            buf.reserve(READ_CHUNK);
        }
        let chunk = buf.chunk_mut();
        iovecs.push(libc::iovec {
            iov_base: chunk.as_mut_ptr().cast(),
            iov_len: chunk.len(),
        });
    }
    let n = retry(|| unsafe { libc::readv(fd, iovecs.as_ptr(), iovecs.len() as libc::c_int) });
    if n >= 0 {
        let mut remaining = n as usize;
        for (buf, iovec) in bufs.iter_mut().zip(iovecs.iter()) {
            let take = remaining.min(iovec.iov_len);
            unsafe { buf.advance_mut(take) };
            remaining -= take;
            if remaining == 0 {
                break;
            }
        }
        return Ok(IoOutcome::Done(n as u64));
    }
    if is_would_block(errno()) {
        return Ok(IoOutcome::WouldBlock);
    }
    Err(io::Error::last_os_error())
}

pub(crate) fn try_write_buf(fd: RawFd, buf: &Bytes) -> io::Result<IoOutcome<usize>> {
    let n = retry(|| unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) });
    if n >= 0 {
        return Ok(IoOutcome::Done(n as usize));
    }
    if is_would_block(errno()) {
        return Ok(IoOutcome::WouldBlock);
    }
    Err(io::Error::last_os_error())
}

/// Gathering write from several buffers.
pub(crate) fn try_write_bufs(fd: RawFd, bufs: &[Bytes]) -> io::Result<IoOutcome<u64>> {
    let iovecs: Vec<libc::iovec> = bufs
        .iter()
        .map(|buf| libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        })
        .collect();
    let n = retry(|| unsafe { libc::writev(fd, iovecs.as_ptr(), iovecs.len() as libc::c_int) });
    if n >= 0 {
        return Ok(IoOutcome::Done(n as u64));
    }
    if is_would_block(errno()) {
        return Ok(IoOutcome::WouldBlock);
    }
    Err(io::Error::last_os_error())
}

/// Receives one datagram into the buffer's spare capacity.
pub(crate) fn try_recv_from(
    fd: RawFd,
    buf: &mut BytesMut,
) -> io::Result<IoOutcome<(usize, SocketAddr)>> {
    if buf.capacity() == buf.len() {
        buf.reserve(READ_CHUNK);
    }
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let chunk = buf.chunk_mut();
    let n = retry(|| unsafe {
        libc::recvfrom(
            fd,
            chunk.as_mut_ptr().cast(),
            chunk.len(),
            0,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    });
    if n >= 0 {
        unsafe { buf.advance_mut(n as usize) };
        let peer = from_sockaddr(&storage)?;
        return Ok(IoOutcome::Done((n as usize, peer)));
    }
    if is_would_block(errno()) {
        return Ok(IoOutcome::WouldBlock);
    }
    Err(io::Error::last_os_error())
}

pub(crate) fn send_to(fd: RawFd, data: &[u8], target: &SocketAddr) -> io::Result<IoOutcome<usize>> {
    let (storage, len) = to_sockaddr(target);
    let n = retry(|| unsafe {
        libc::sendto(
            fd,
            data.as_ptr().cast(),
            data.len(),
            0,
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    });
    if n >= 0 {
        return Ok(IoOutcome::Done(n as usize));
    }
    if is_would_block(errno()) {
        return Ok(IoOutcome::WouldBlock);
    }
    Err(io::Error::last_os_error())
}

/// Positional read used by the file channel on pool threads.
pub(crate) fn pread_buf(fd: RawFd, buf: &mut BytesMut, offset: u64) -> io::Result<usize> {
    if buf.capacity() == buf.len() {
        buf.reserve(READ_CHUNK);
    }
    let chunk = buf.chunk_mut();
    let n = retry(|| unsafe {
        libc::pread(
            fd,
            chunk.as_mut_ptr().cast(),
            chunk.len(),
            offset as libc::off_t,
        )
    });
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { buf.advance_mut(n as usize) };
    Ok(n as usize)
}

/// Positional write used by the file channel on pool threads.
pub(crate) fn pwrite_buf(fd: RawFd, data: &[u8], offset: u64) -> io::Result<usize> {
    let n = retry(|| unsafe {
        libc::pwrite(fd, data.as_ptr().cast(), data.len(), offset as libc::off_t)
    });
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// File size via `fstat`.
pub(crate) fn file_size(fd: RawFd) -> io::Result<u64> {
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.st_size as u64)
}

/// Creates a non-blocking pipe used by the pollers for wakeup.
pub(crate) fn pipe_pair() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    for fd in fds {
        if let Err(err) = set_nonblocking(fd) {
            close_fd(fds[0]);
            close_fd(fds[1]);
            return Err(err);
        }
    }
    Ok((fds[0], fds[1]))
}

fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn from_sockaddr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = storage as *const _ as *const libc::sockaddr_in;
            let (ip, port) = unsafe {
                (
                    Ipv4Addr::from((*sin).sin_addr.s_addr.to_ne_bytes()),
                    u16::from_be((*sin).sin_port),
                )
            };
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let sin6 = storage as *const _ as *const libc::sockaddr_in6;
            let addr = unsafe {
                SocketAddrV6::new(
                    Ipv6Addr::from((*sin6).sin6_addr.s6_addr),
                    u16::from_be((*sin6).sin6_port),
                    (*sin6).sin6_flowinfo,
                    (*sin6).sin6_scope_id,
                )
            };
            Ok(SocketAddr::V6(addr))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}
