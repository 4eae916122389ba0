//! Non-blocking TCP socket.
//!
//! The handle forwards to a shared implementation owned jointly by the
//! handle and the loop's dispatch closure (which holds only a `Weak`, so a
//! callback destroying its own socket ends the object's life as soon as the
//! dispatch frame unwinds). State transitions:
//!
//! ```text
//!   IDLE --connect--> CONNECTING --write-ready, SO_ERROR==0--> OPEN
//!   IDLE --attach_fd-----------------------------------------> OPEN
//!   OPEN --error | peer close | close()--> CLOSED
//! ```
//!
//! All operations are loop-thread affairs; the exception is documented on
//! `close`. Callbacks run on the loop thread with no internal lock held, so
//! they may freely call back into the socket, including closing it.

use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use socket2::Socket;
use tracing::{debug, trace};

use crate::buffer::BufferChain;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sock::sys;
use crate::timer::{Timer, TimerMode};
use crate::tls::{HandshakeState, SslRole};

/// Callback for read/write/error notifications.
pub type EventCallback = Box<dyn FnMut(Result<()>) + Send>;
/// Callback consumed by exactly one connect attempt.
pub type ConnectCallback = Box<dyn FnOnce(Result<()>) + Send>;

const TLS_SCRATCH: usize = 16384;

/// Callbacks moved out of a socket during teardown, dropped only after the
/// state lock is released.
type DetachedCallbacks = (
    Option<ConnectCallback>,
    Option<EventCallback>,
    Option<EventCallback>,
    Option<EventCallback>,
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Connecting,
    Open,
    Closed,
}

struct TcpState {
    sock: Option<Socket>,
    state: State,
    registered: bool,
    paused: bool,
    /// The caller has unsent data buffered and waits for `cb_write`.
    want_write: bool,
    ssl_enabled: bool,
    server_name: Option<String>,
    tls: Option<Box<dyn crate::tls::TlsSession>>,
    handshaking: bool,
    scratch: Vec<u8>,
}

impl TcpState {
    fn fd(&self) -> RawFd {
        self.sock.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }

    /// Interest set for the OPEN state.
    fn desired_interest(&self) -> Event {
        let mut events = Event::empty();
        if !self.paused || self.handshaking {
            events |= Event::READ;
        }
        if self.want_write || self.tls_has_output() {
            events |= Event::WRITE;
        }
        events
    }

    fn tls_has_output(&self) -> bool {
        self.tls
            .as_ref()
            .is_some_and(|t| !t.pending_ciphertext().is_empty())
    }
}

struct Callbacks {
    connect: Mutex<Option<ConnectCallback>>,
    read: Mutex<Option<EventCallback>>,
    write: Mutex<Option<EventCallback>>,
    error: Mutex<Option<EventCallback>>,
}

struct TcpShared {
    handle: LoopHandle,
    st: Mutex<TcpState>,
    cbs: Callbacks,
    connect_timer: Mutex<Option<Timer>>,
}

/// A non-blocking TCP stream bound to one event loop.
pub struct TcpSocket {
    shared: Arc<TcpShared>,
}

impl TcpSocket {
    pub fn new(event_loop: &EventLoop) -> Self {
        Self::with_handle(event_loop.handle())
    }

    /// Bind a socket via a loop handle; useful inside accept callbacks and
    /// posted tasks.
    pub fn with_handle(handle: LoopHandle) -> Self {
        TcpSocket {
            shared: Arc::new(TcpShared {
                handle,
                st: Mutex::new(TcpState {
                    sock: None,
                    state: State::Idle,
                    registered: false,
                    paused: false,
                    want_write: false,
                    ssl_enabled: false,
                    server_name: None,
                    tls: None,
                    handshaking: false,
                    scratch: Vec::new(),
                }),
                cbs: Callbacks {
                    connect: Mutex::new(None),
                    read: Mutex::new(None),
                    write: Mutex::new(None),
                    error: Mutex::new(None),
                },
                connect_timer: Mutex::new(None),
            }),
        }
    }

    /// Notified when the socket becomes readable; call `receive` from it.
    pub fn set_read_callback(&self, cb: impl FnMut(Result<()>) + Send + 'static) {
        *self.shared.cbs.read.lock() = Some(Box::new(cb));
    }

    /// Notified when a backpressured socket drains and accepts writes again.
    pub fn set_write_callback(&self, cb: impl FnMut(Result<()>) + Send + 'static) {
        *self.shared.cbs.write.lock() = Some(Box::new(cb));
    }

    /// Notified of fatal socket conditions; the socket is CLOSED when it
    /// fires.
    pub fn set_error_callback(&self, cb: impl FnMut(Result<()>) + Send + 'static) {
        *self.shared.cbs.error.lock() = Some(Box::new(cb));
    }

    /// Enable TLS for the next `connect`: the client handshake runs after
    /// TCP establishment and `cb_connect` fires once it completes.
    pub fn set_ssl_enabled(&self, enabled: bool) {
        self.shared.st.lock().ssl_enabled = enabled;
    }

    /// SNI / certificate name for client handshakes. Defaults to the
    /// connect host.
    pub fn set_ssl_server_name(&self, name: &str) {
        self.shared.st.lock().server_name = Some(name.to_owned());
    }

    /// Negotiated ALPN protocol, once the handshake is done.
    pub fn alpn_selected(&self) -> Option<Vec<u8>> {
        let st = self.shared.st.lock();
        st.tls
            .as_ref()
            .and_then(|t| t.alpn_selected())
            .map(|p| p.to_vec())
    }

    pub fn fd(&self) -> RawFd {
        self.shared.st.lock().fd()
    }

    /// Bind the local address before connecting. Only legal while IDLE.
    pub fn bind(&self, host: &str, port: u16) -> Result<()> {
        let addr = sys::resolve(host, port)?;
        let mut st = self.shared.st.lock();
        if st.state != State::Idle {
            return Err(Error::InvalidState);
        }
        let sock = sys::new_stream_socket(&addr)?;
        sock.set_reuse_address(true).map_err(|_| Error::SockError)?;
        sock.bind(&addr.into()).map_err(|e| {
            debug!("bind {addr} failed: {e}");
            Error::from(e)
        })?;
        st.sock = Some(sock);
        Ok(())
    }

    /// Start a non-blocking connect. `cb` fires exactly once: on success
    /// (after the TLS handshake when SSL is enabled), failure, or timeout
    /// (`timeout_ms > 0`). A second connect on a live socket is refused.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        cb: impl FnOnce(Result<()>) + Send + 'static,
        timeout_ms: u32,
    ) -> Result<()> {
        let addr = sys::resolve(host, port)?;
        let shared = &self.shared;
        let mut st = shared.st.lock();
        if st.state != State::Idle {
            return Err(Error::InvalidState);
        }
        if st.sock.is_none() {
            st.sock = Some(sys::new_stream_socket(&addr)?);
        }
        if st.server_name.is_none() {
            st.server_name = Some(host.to_owned());
        }
        *shared.cbs.connect.lock() = Some(Box::new(cb));

        trace!(fd = st.fd(), %addr, "connecting");
        let result = st.sock.as_ref().unwrap().connect(&addr.into());
        match result {
            Ok(()) => {
                st.state = State::Open;
                if let Err(e) = TcpShared::register(shared, &mut st, Event::READ) {
                    let dropped = TcpShared::cleanup(shared, &mut st);
                    drop(st);
                    drop(dropped);
                    return Err(e);
                }
                drop(st);
                // The timeout still applies: a TLS handshake may follow the
                // instant TCP establishment.
                TcpShared::arm_connect_timer(shared, timeout_ms);
                // Deliver asynchronously so the callback never runs inside
                // the caller's connect frame.
                let weak = Arc::downgrade(shared);
                let _ = shared.handle.post(
                    move || {
                        if let Some(shared) = weak.upgrade() {
                            TcpShared::on_connect_ready(&shared);
                        }
                    },
                    None,
                );
                Ok(())
            }
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                st.state = State::Connecting;
                if let Err(e) = TcpShared::register(shared, &mut st, Event::WRITE) {
                    let dropped = TcpShared::cleanup(shared, &mut st);
                    drop(st);
                    drop(dropped);
                    return Err(e);
                }
                drop(st);
                TcpShared::arm_connect_timer(shared, timeout_ms);
                Ok(())
            }
            Err(e) => {
                debug!("connect {addr} failed: {e}");
                let err = Error::from(e);
                let dropped = TcpShared::cleanup(shared, &mut st);
                drop(st);
                drop(dropped);
                Err(err)
            }
        }
    }

    /// Adopt an already-connected fd (e.g. from an accept callback). Takes
    /// ownership; the socket becomes OPEN.
    pub fn attach_fd(&self, fd: RawFd) -> Result<()> {
        let shared = &self.shared;
        let mut st = shared.st.lock();
        if st.state != State::Idle {
            return Err(Error::InvalidState);
        }
        let sock = sys::socket_from_fd(fd)?;
        let _ = sock.set_nodelay(true);
        st.sock = Some(sock);
        st.state = State::Open;
        if let Err(e) = TcpShared::register(shared, &mut st, Event::READ) {
            // The fd stays the caller's on failure.
            if let Some(sock) = st.sock.take() {
                let _ = sock.into_raw_fd();
            }
            st.state = State::Idle;
            return Err(e);
        }
        Ok(())
    }

    /// Release the fd without closing it. The socket returns to IDLE.
    pub fn detach_fd(&self) -> Result<RawFd> {
        let shared = &self.shared;
        let mut st = shared.st.lock();
        if st.state != State::Open && st.state != State::Idle {
            return Err(Error::InvalidState);
        }
        let sock = st.sock.take().ok_or(Error::InvalidState)?;
        if st.registered {
            let _ = shared.handle.inner.unregister_fd(sock.as_raw_fd());
            st.registered = false;
        }
        st.state = State::Idle;
        st.want_write = false;
        st.tls = None;
        st.handshaking = false;
        Ok(sock.into_raw_fd())
    }

    /// Begin a TLS handshake on an OPEN socket. Completion is reported via
    /// `cb_connect` when one is pending (client connects), otherwise via
    /// `cb_read` once application data may be available.
    pub fn start_ssl_handshake(&self, role: SslRole) -> Result<()> {
        let shared = &self.shared;
        let mut st = shared.st.lock();
        if st.state != State::Open || st.tls.is_some() {
            return Err(Error::InvalidState);
        }
        let provider = shared.handle.tls_provider().ok_or(Error::NotSupported)?;
        let session = match role {
            SslRole::Client => {
                let name = st.server_name.clone().unwrap_or_else(|| "localhost".into());
                provider.new_client(&name)?
            }
            SslRole::Server => provider.new_server()?,
        };
        st.tls = Some(session);
        st.handshaking = true;
        st.scratch = vec![0u8; TLS_SCRATCH];
        let interest = st.desired_interest();
        TcpShared::set_interest(shared, &mut st, interest);
        drop(st);
        TcpShared::pump_handshake(shared);
        Ok(())
    }

    /// Write bytes. Returns how many were accepted (possibly 0 under
    /// backpressure; buffer the rest and wait for the write callback).
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        TcpShared::send_slices(&self.shared, &[data])
    }

    /// Gathered write over multiple slices.
    pub fn send_vectored(&self, slices: &[&[u8]]) -> Result<usize> {
        TcpShared::send_slices(&self.shared, slices)
    }

    /// Gathered write of a buffer chain. Does not consume the chain; the
    /// caller advances it by the returned count.
    pub fn send_chain(&self, chain: &BufferChain) -> Result<usize> {
        let slices: Vec<&[u8]> = chain.slices().collect();
        if slices.is_empty() {
            return Ok(0);
        }
        TcpShared::send_slices(&self.shared, &slices)
    }

    /// Read bytes. `Ok(0)` means the peer closed (the socket transitions
    /// CLOSED); `Err(Again)` means no data is available yet.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        TcpShared::receive(&self.shared, buf)
    }

    /// Drop READ interest. Kernel-queued data is kept for `resume`.
    pub fn pause(&self) -> Result<()> {
        let shared = &self.shared;
        let mut st = shared.st.lock();
        st.paused = true;
        if st.state == State::Open && st.registered {
            let interest = st.desired_interest();
            TcpShared::set_interest(shared, &mut st, interest);
        }
        Ok(())
    }

    /// Re-add READ interest dropped by `pause`.
    pub fn resume(&self) -> Result<()> {
        let shared = &self.shared;
        let mut st = shared.st.lock();
        st.paused = false;
        if st.state == State::Open && st.registered {
            let interest = st.desired_interest();
            TcpShared::set_interest(shared, &mut st, interest);
        }
        Ok(())
    }

    /// Close the socket. Idempotent, legal in any state; after it returns
    /// no callback for this socket fires. When called off the loop thread
    /// the teardown is posted to the loop.
    pub fn close(&self) {
        TcpShared::close(&self.shared);
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        TcpShared::close(&self.shared);
    }
}

impl TcpShared {
    /// Arm the connect-attempt deadline, covering both the TCP handshake
    /// and any TLS handshake that follows it. `0` disables.
    fn arm_connect_timer(shared: &Arc<TcpShared>, timeout_ms: u32) {
        if timeout_ms == 0 {
            return;
        }
        let timer = Timer::with_handle(shared.handle.clone());
        let weak = Arc::downgrade(shared);
        let _ = timer.schedule(timeout_ms, TimerMode::OneShot, move || {
            if let Some(shared) = weak.upgrade() {
                TcpShared::on_connect_timeout(&shared);
            }
        });
        *shared.connect_timer.lock() = Some(timer);
    }

    /// Register the fd with the loop, installing the dispatch closure that
    /// routes readiness back into this socket.
    fn register(shared: &Arc<TcpShared>, st: &mut TcpState, events: Event) -> Result<()> {
        let fd = st.fd();
        let weak: Weak<TcpShared> = Arc::downgrade(shared);
        shared.handle.inner.register_fd(
            fd,
            events,
            Box::new(move |ev| {
                if let Some(shared) = weak.upgrade() {
                    TcpShared::io_ready(&shared, ev);
                }
            }),
        )?;
        st.registered = true;
        Ok(())
    }

    fn set_interest(shared: &Arc<TcpShared>, st: &mut TcpState, events: Event) {
        if st.registered {
            let _ = shared.handle.inner.update_fd(st.fd(), events);
        }
    }

    /// Readiness entry point. ERROR takes precedence; otherwise routed by
    /// state.
    fn io_ready(shared: &Arc<TcpShared>, events: Event) {
        if events.contains(Event::ERROR) {
            let err = {
                let st = shared.st.lock();
                if st.state == State::Closed {
                    return;
                }
                sys::socket_error(st.fd()).unwrap_or(Error::SockError)
            };
            Self::on_error(shared, err);
            return;
        }
        let state = shared.st.lock().state;
        match state {
            State::Connecting if events.contains(Event::WRITE) => {
                Self::on_connect_ready(shared);
            }
            State::Open => {
                if events.contains(Event::WRITE) {
                    Self::on_send_ready(shared);
                }
                if events.contains(Event::READ) && shared.st.lock().state == State::Open {
                    Self::on_receive_ready(shared);
                }
            }
            _ => {}
        }
    }

    /// TCP connect finished (or the deferred immediate-success path).
    fn on_connect_ready(shared: &Arc<TcpShared>) {
        let mut st = shared.st.lock();
        match st.state {
            State::Connecting => {
                if let Some(err) = sys::socket_error(st.fd()) {
                    debug!(fd = st.fd(), "connect failed: {err}");
                    Self::fail_connect(shared, st, err);
                    return;
                }
                st.state = State::Open;
            }
            State::Open => {}
            _ => return,
        }

        if st.ssl_enabled && st.tls.is_none() {
            let provider = match shared.handle.tls_provider() {
                Some(p) => p,
                None => {
                    Self::fail_connect(shared, st, Error::NotSupported);
                    return;
                }
            };
            let name = st.server_name.clone().unwrap_or_else(|| "localhost".into());
            match provider.new_client(&name) {
                Ok(session) => {
                    st.tls = Some(session);
                    st.handshaking = true;
                    st.scratch = vec![0u8; TLS_SCRATCH];
                    let interest = st.desired_interest();
                    Self::set_interest(shared, &mut st, interest);
                    drop(st);
                    // The connect timer keeps running across the handshake.
                    Self::pump_handshake(shared);
                }
                Err(e) => Self::fail_connect(shared, st, e),
            }
            return;
        }

        let interest = st.desired_interest();
        Self::set_interest(shared, &mut st, interest);
        drop(st);
        let timer = shared.connect_timer.lock().take();
        drop(timer);
        trace!("connected");
        if let Some(cb) = shared.cbs.connect.lock().take() {
            cb(Ok(()));
        }
    }

    /// Connect-phase failure: tear down, then report once through the
    /// connect callback. Consumes the guard so user code runs unlocked.
    fn fail_connect(shared: &Arc<TcpShared>, mut st: MutexGuard<'_, TcpState>, err: Error) {
        let cb = shared.cbs.connect.lock().take();
        let dropped = Self::cleanup(shared, &mut st);
        drop(st);
        drop(dropped);
        let timer = shared.connect_timer.lock().take();
        drop(timer);
        if let Some(cb) = cb {
            cb(Err(err));
        }
    }

    fn on_connect_timeout(shared: &Arc<TcpShared>) {
        let st = shared.st.lock();
        if st.state != State::Connecting && !st.handshaking {
            return;
        }
        debug!(fd = st.fd(), "connect timed out");
        Self::fail_connect(shared, st, Error::Timeout);
    }

    /// WRITE readiness in OPEN: finish the handshake or drain pending
    /// output, then hand write access back to the user.
    fn on_send_ready(shared: &Arc<TcpShared>) {
        let mut st = shared.st.lock();
        if st.state != State::Open {
            return;
        }
        if st.handshaking {
            drop(st);
            Self::pump_handshake(shared);
            return;
        }
        if let Err(err) = Self::flush_tls_output(&mut st) {
            Self::report_error(shared, st, err);
            return;
        }
        if st.tls_has_output() {
            // Still blocked; WRITE interest stays armed.
            return;
        }
        let notify = st.want_write;
        st.want_write = false;
        let interest = st.desired_interest();
        Self::set_interest(shared, &mut st, interest);
        drop(st);
        if notify {
            Self::fire_event(shared, &shared.cbs.write, Ok(()));
        }
    }

    /// READ readiness in OPEN: during a handshake, pump it; otherwise tell
    /// the user to `receive`.
    fn on_receive_ready(shared: &Arc<TcpShared>) {
        let handshaking = {
            let st = shared.st.lock();
            if st.state != State::Open {
                return;
            }
            st.handshaking
        };
        if handshaking {
            Self::pump_handshake(shared);
            return;
        }
        Self::fire_event(shared, &shared.cbs.read, Ok(()));
    }

    /// Drive a pending TLS handshake with whatever the fd has to offer.
    fn pump_handshake(shared: &Arc<TcpShared>) {
        let mut st = shared.st.lock();
        if st.state != State::Open || !st.handshaking {
            return;
        }
        match Self::drive_handshake(&mut st) {
            Ok(HandshakeState::Done) => {
                st.handshaking = false;
                let interest = st.desired_interest();
                Self::set_interest(shared, &mut st, interest);
                drop(st);
                let timer = shared.connect_timer.lock().take();
                drop(timer);
                trace!("tls handshake complete");
                let cb = shared.cbs.connect.lock().take();
                match cb {
                    Some(cb) => cb(Ok(())),
                    // Server/attached side: decrypted application data may
                    // already be waiting.
                    None => Self::fire_event(shared, &shared.cbs.read, Ok(())),
                }
            }
            Ok(_) => {
                let interest = st.desired_interest();
                Self::set_interest(shared, &mut st, interest);
            }
            Err(err) => {
                debug!("tls handshake failed: {err}");
                if shared.cbs.connect.lock().is_some() {
                    Self::fail_connect(shared, st, err);
                } else {
                    Self::report_error(shared, st, err);
                }
            }
        }
    }

    /// One handshake round trip against the state only (no callbacks).
    fn drive_handshake(st: &mut TcpState) -> Result<HandshakeState> {
        // Inbound: wire -> session.
        loop {
            let fd = st.fd();
            let n = match sys::read_fd(fd, &mut st.scratch) {
                Ok(0) => return Err(Error::Closed),
                Ok(n) => n,
                Err(Error::Again) => break,
                Err(err) => return Err(err),
            };
            let (tls, scratch) = (&mut st.tls, &st.scratch);
            let session = tls.as_mut().expect("handshaking without session");
            session
                .read_ciphertext(&scratch[..n])
                .map_err(|_| Error::SslError)?;
        }
        // Outbound: session -> wire.
        Self::flush_tls_output(st)?;
        let session = st.tls.as_mut().expect("handshaking without session");
        session.handshake()
    }

    /// Write the session's queued ciphertext to the fd. Leaves leftovers
    /// queued; interest management is the caller's job.
    fn flush_tls_output(st: &mut TcpState) -> Result<()> {
        let fd = st.fd();
        let Some(session) = st.tls.as_mut() else {
            return Ok(());
        };
        loop {
            let pending = session.pending_ciphertext();
            if pending.is_empty() {
                return Ok(());
            }
            match sys::write_fd(fd, pending) {
                Ok(n) => session.advance_ciphertext(n),
                Err(Error::Again) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn send_slices(shared: &Arc<TcpShared>, slices: &[&[u8]]) -> Result<usize> {
        let mut st = shared.st.lock();
        match st.state {
            State::Open if !st.handshaking => {}
            State::Closed => return Err(Error::Closed),
            _ => return Err(Error::InvalidState),
        }

        let result = if st.tls.is_some() {
            Self::send_tls(shared, &mut st, slices)
        } else {
            Self::send_plain(shared, &mut st, slices)
        };
        match result {
            Err(err) if err != Error::Again => {
                // Fatal send failure.
                let dropped = Self::cleanup(shared, &mut st);
                drop(st);
                drop(dropped);
                Err(err)
            }
            other => other,
        }
    }

    fn send_plain(shared: &Arc<TcpShared>, st: &mut TcpState, slices: &[&[u8]]) -> Result<usize> {
        // Already backpressured: nothing more is accepted until the write
        // callback reports drain.
        if st.want_write {
            return Ok(0);
        }
        let total: usize = slices.iter().map(|s| s.len()).sum();
        let fd = st.fd();
        let written = match sys::writev_fd(fd, slices) {
            Ok(n) => n,
            Err(Error::Again) => 0,
            Err(err) => return Err(err),
        };
        if written < total {
            st.want_write = true;
            let interest = st.desired_interest();
            Self::set_interest(shared, st, interest);
        }
        Ok(written)
    }

    /// TLS send: plaintext into the session, ciphertext out the fd.
    fn send_tls(shared: &Arc<TcpShared>, st: &mut TcpState, slices: &[&[u8]]) -> Result<usize> {
        // Don't stack new records behind an unflushed backlog.
        if st.tls_has_output() {
            st.want_write = true;
            let interest = st.desired_interest();
            Self::set_interest(shared, st, interest);
            return Ok(0);
        }
        let mut accepted = 0;
        {
            let session = st.tls.as_mut().expect("tls send without session");
            for slice in slices {
                let n = session.write_plaintext(slice)?;
                accepted += n;
                if n < slice.len() {
                    break;
                }
            }
        }
        Self::flush_tls_output(st)?;
        if st.tls_has_output() {
            let interest = st.desired_interest();
            Self::set_interest(shared, st, interest);
        }
        Ok(accepted)
    }

    fn receive(shared: &Arc<TcpShared>, buf: &mut [u8]) -> Result<usize> {
        let mut st = shared.st.lock();
        match st.state {
            State::Open => {}
            State::Closed => return Err(Error::Closed),
            _ => return Err(Error::InvalidState),
        }
        if st.handshaking {
            return Err(Error::Again);
        }
        if buf.is_empty() {
            return Err(Error::InvalidParam);
        }

        let result = if st.tls.is_some() {
            Self::tls_read(&mut st, buf)
        } else {
            let fd = st.fd();
            sys::read_fd(fd, buf)
        };
        match result {
            Ok(0) => {
                trace!(fd = st.fd(), "peer closed");
                let dropped = Self::cleanup(shared, &mut st);
                drop(st);
                drop(dropped);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(Error::Again) => Err(Error::Again),
            Err(err) => {
                let dropped = Self::cleanup(shared, &mut st);
                drop(st);
                drop(dropped);
                Err(err)
            }
        }
    }

    /// Decrypt into `buf`, pulling more records off the wire as needed.
    fn tls_read(st: &mut TcpState, buf: &mut [u8]) -> Result<usize> {
        loop {
            {
                let session = st.tls.as_mut().expect("tls receive without session");
                match session.read_plaintext(buf) {
                    Ok(n) => return Ok(n),
                    Err(Error::Again) => {}
                    Err(err) => return Err(err),
                }
            }
            let fd = st.fd();
            let n = match sys::read_fd(fd, &mut st.scratch) {
                Ok(0) => return Ok(0),
                Ok(n) => n,
                Err(err) => return Err(err),
            };
            let (tls, scratch) = (&mut st.tls, &st.scratch);
            tls.as_mut()
                .expect("tls receive without session")
                .read_ciphertext(&scratch[..n])
                .map_err(|_| Error::SslError)?;
        }
    }

    /// Fatal condition discovered via readiness: tear down, then report.
    fn on_error(shared: &Arc<TcpShared>, err: Error) {
        let st = shared.st.lock();
        if st.state == State::Closed {
            return;
        }
        if shared.cbs.connect.lock().is_some() {
            Self::fail_connect(shared, st, err);
        } else {
            Self::report_error(shared, st, err);
        }
    }

    fn report_error(shared: &Arc<TcpShared>, mut st: MutexGuard<'_, TcpState>, err: Error) {
        let cb = shared.cbs.error.lock().take();
        let dropped = Self::cleanup(shared, &mut st);
        drop(st);
        drop(dropped);
        if let Some(mut cb) = cb {
            cb(Err(err));
        }
    }

    /// Invoke a read/write callback with no lock held; restore it unless
    /// the callback replaced it or closed the socket.
    fn fire_event(shared: &Arc<TcpShared>, slot: &Mutex<Option<EventCallback>>, arg: Result<()>) {
        let cb = slot.lock().take();
        if let Some(mut cb) = cb {
            cb(arg);
            let closed = shared.st.lock().state == State::Closed;
            if !closed {
                let mut slot = slot.lock();
                if slot.is_none() {
                    *slot = Some(cb);
                }
            }
        }
    }

    /// Tear down the fd and TLS state; transition CLOSED. Idempotent. The
    /// caller holds the state lock and must drop the returned callbacks
    /// only after releasing it: user closures may run arbitrary drop code
    /// (including destroying this very socket through a capture cycle).
    #[must_use]
    fn cleanup(shared: &Arc<TcpShared>, st: &mut TcpState) -> DetachedCallbacks {
        if st.tls.is_some() {
            if let Some(session) = st.tls.as_mut() {
                session.shutdown();
            }
            let _ = Self::flush_tls_output(st);
        }
        if st.registered {
            let _ = shared.handle.inner.unregister_fd(st.fd());
            st.registered = false;
        }
        if let Some(sock) = st.sock.take() {
            trace!(fd = sock.as_raw_fd(), "socket closed");
            drop(sock);
        }
        st.tls = None;
        st.handshaking = false;
        st.want_write = false;
        st.state = State::Closed;
        (
            shared.cbs.connect.lock().take(),
            shared.cbs.read.lock().take(),
            shared.cbs.write.lock().take(),
            shared.cbs.error.lock().take(),
        )
    }

    fn close(shared: &Arc<TcpShared>) {
        let on_loop = shared.handle.in_same_thread() || !shared.handle.inner.loop_started();
        if on_loop {
            Self::close_now(shared);
            return;
        }
        // Off-thread close defers to the loop; if the loop is gone, the
        // poller is idle and inline teardown is safe.
        let strong = shared.clone();
        if shared
            .handle
            .post(move || TcpShared::close_now(&strong), None)
            .is_err()
        {
            Self::close_now(shared);
        }
    }

    fn close_now(shared: &Arc<TcpShared>) {
        let mut st = shared.st.lock();
        if st.state == State::Closed && st.sock.is_none() {
            return;
        }
        let dropped = Self::cleanup(shared, &mut st);
        drop(st);
        drop(dropped);
        let timer = shared.connect_timer.lock().take();
        drop(timer);
    }
}
