//! Accepting side of the TCP surface.
//!
//! The listener hands raw accepted fds to the application, which typically
//! attaches them to `TcpSocket`s on this or another loop. Returning `false`
//! from the accept callback rejects the connection and closes the fd.

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sock::sys;

/// Called once per accepted connection with the fd and peer address.
pub type AcceptCallback = Box<dyn FnMut(RawFd, SocketAddr) -> bool + Send>;
/// Called when the listener itself fails; it is closed when this fires.
pub type ListenErrorCallback = Box<dyn FnMut(Error) + Send>;

struct ListenerState {
    sock: Option<Socket>,
    local_addr: Option<SocketAddr>,
    registered: bool,
}

struct ListenerShared {
    handle: LoopHandle,
    st: Mutex<ListenerState>,
    on_accept: Mutex<Option<AcceptCallback>>,
    on_error: Mutex<Option<ListenErrorCallback>>,
}

/// A listening TCP socket bound to one event loop.
pub struct TcpListener {
    shared: Arc<ListenerShared>,
}

impl TcpListener {
    pub fn new(event_loop: &EventLoop) -> Self {
        Self::with_handle(event_loop.handle())
    }

    pub fn with_handle(handle: LoopHandle) -> Self {
        TcpListener {
            shared: Arc::new(ListenerShared {
                handle,
                st: Mutex::new(ListenerState {
                    sock: None,
                    local_addr: None,
                    registered: false,
                }),
                on_accept: Mutex::new(None),
                on_error: Mutex::new(None),
            }),
        }
    }

    pub fn set_accept_callback(
        &self,
        cb: impl FnMut(RawFd, SocketAddr) -> bool + Send + 'static,
    ) {
        *self.shared.on_accept.lock() = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut(Error) + Send + 'static) {
        *self.shared.on_error.lock() = Some(Box::new(cb));
    }

    /// Bind and listen. Port 0 picks an ephemeral port; read it back with
    /// `local_addr`.
    pub fn start_listen(&self, host: &str, port: u16) -> Result<()> {
        let addr = sys::resolve(host, port)?;
        let shared = &self.shared;
        let mut st = shared.st.lock();
        if st.sock.is_some() {
            return Err(Error::InvalidState);
        }
        let sock = sys::new_stream_socket(&addr)?;
        sock.set_reuse_address(true).map_err(|_| Error::SockError)?;
        sock.bind(&addr.into()).map_err(|e| {
            debug!("listen bind {addr} failed: {e}");
            Error::from(e)
        })?;
        sock.listen(1024).map_err(|_| Error::SockError)?;
        let local = sock
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .ok_or(Error::SockError)?;

        let fd = sock.as_raw_fd();
        let weak: Weak<ListenerShared> = Arc::downgrade(shared);
        shared.handle.inner.register_fd(
            fd,
            Event::READ,
            Box::new(move |ev| {
                if let Some(shared) = weak.upgrade() {
                    ListenerShared::io_ready(&shared, ev);
                }
            }),
        )?;

        trace!(fd, %local, "listening");
        st.sock = Some(sock);
        st.local_addr = Some(local);
        st.registered = true;
        Ok(())
    }

    /// The bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.st.lock().local_addr
    }

    /// Stop accepting and close the listening socket. Idempotent.
    pub fn stop_listen(&self) {
        ListenerShared::close(&self.shared);
    }

    /// Alias for `stop_listen`, mirroring the socket surface.
    pub fn close(&self) {
        ListenerShared::close(&self.shared);
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        ListenerShared::close(&self.shared);
    }
}

impl ListenerShared {
    fn io_ready(shared: &Arc<ListenerShared>, events: Event) {
        if events.contains(Event::ERROR) {
            Self::fail(shared, Error::SockError);
            return;
        }
        if !events.contains(Event::READ) {
            return;
        }
        // Drain the accept queue; a spurious wake surfaces as Again.
        loop {
            let accepted = {
                let st = shared.st.lock();
                let Some(sock) = st.sock.as_ref() else {
                    return;
                };
                sock.accept()
            };
            match accepted {
                Ok((stream, peer)) => {
                    let peer = match peer.as_socket() {
                        Some(p) => p,
                        None => continue,
                    };
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    trace!(%peer, "accepted");
                    // Take the callback out so it runs with no lock held
                    // (it may close this listener).
                    let cb = shared.on_accept.lock().take();
                    match cb {
                        Some(mut cb) => {
                            let fd = stream.into_raw_fd();
                            if !cb(fd, peer) {
                                unsafe {
                                    libc::close(fd);
                                }
                            }
                            let still_open = shared.st.lock().sock.is_some();
                            if still_open {
                                let mut slot = shared.on_accept.lock();
                                if slot.is_none() {
                                    *slot = Some(cb);
                                }
                            }
                        }
                        // No callback installed: the connection is refused.
                        None => drop(stream),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    debug!("accept failed: {e}");
                    Self::fail(shared, Error::from(e));
                    return;
                }
            }
        }
    }

    fn fail(shared: &Arc<ListenerShared>, err: Error) {
        let cb = shared.on_error.lock().take();
        Self::close(shared);
        if let Some(mut cb) = cb {
            cb(err);
        }
    }

    fn close(shared: &Arc<ListenerShared>) {
        let mut st = shared.st.lock();
        if st.registered {
            if let Some(sock) = st.sock.as_ref() {
                let _ = shared.handle.inner.unregister_fd(sock.as_raw_fd());
            }
            st.registered = false;
        }
        if let Some(sock) = st.sock.take() {
            trace!(fd = sock.as_raw_fd(), "listener closed");
            drop(sock);
        }
        drop(st);
        let cbs = (
            shared.on_accept.lock().take(),
            shared.on_error.lock().take(),
        );
        drop(cbs);
    }
}
