//! Low-level socket plumbing shared by the stream and listener types.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::trace;

use crate::error::{Error, Result};

/// Resolve `host:port` synchronously (OS resolver), preferring IPv4 so that
/// dual-stack hostnames behave predictably with IPv4 listeners.
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::InvalidParam)?;
    let first = addrs.next().ok_or(Error::InvalidParam)?;
    if first.is_ipv4() {
        return Ok(first);
    }
    Ok(addrs.find(|a| a.is_ipv4()).unwrap_or(first))
}

/// Create a non-blocking TCP socket for `addr`'s family.
pub(crate) fn new_stream_socket(addr: &SocketAddr) -> Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket =
        Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(|_| Error::SockError)?;
    socket.set_nonblocking(true).map_err(|_| Error::SockError)?;
    let _ = socket.set_nodelay(true);
    Ok(socket)
}

/// Wrap an externally-created fd and force it non-blocking.
pub(crate) fn socket_from_fd(fd: RawFd) -> Result<Socket> {
    if fd < 0 {
        return Err(Error::InvalidParam);
    }
    let socket = unsafe { Socket::from_raw_fd(fd) };
    if let Err(e) = socket.set_nonblocking(true) {
        trace!(fd, "set_nonblocking failed: {e}");
        // Hand the fd back to the caller; attach did not take ownership.
        let _ = socket.into_raw_fd();
        return Err(Error::SockError);
    }
    Ok(socket)
}

/// Decode the pending error on a socket (SO_ERROR), consuming it. `None`
/// means no error was pending.
pub(crate) fn socket_error(fd: RawFd) -> Option<Error> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Some(Error::SockError);
    }
    if err == 0 {
        return None;
    }
    Some(Error::from_errno(err))
}

/// Non-blocking read directly on the fd.
pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Err(Error::Again),
            Some(errno) => return Err(Error::from_errno(errno)),
            None => return Err(Error::SockError),
        }
    }
}

/// Non-blocking write directly on the fd.
pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Err(Error::Again),
            Some(errno) => return Err(Error::from_errno(errno)),
            None => return Err(Error::SockError),
        }
    }
}

/// Non-blocking vectored write.
pub(crate) fn writev_fd(fd: RawFd, slices: &[&[u8]]) -> Result<usize> {
    const MAX_IOVECS: usize = 64;
    let mut iovecs = [libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
    }; MAX_IOVECS];
    let count = slices.len().min(MAX_IOVECS);
    for (iov, slice) in iovecs.iter_mut().zip(slices.iter().take(count)) {
        iov.iov_base = slice.as_ptr() as *mut libc::c_void;
        iov.iov_len = slice.len();
    }
    loop {
        let n = unsafe { libc::writev(fd, iovecs.as_ptr(), count as libc::c_int) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Err(Error::Again),
            Some(errno) => return Err(Error::from_errno(errno)),
            None => return Err(Error::SockError),
        }
    }
}
