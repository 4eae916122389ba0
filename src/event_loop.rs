//! The event loop: one thread multiplexing fd readiness, timers, and
//! cross-thread tasks.
//!
//! `EventLoop` is the owning handle; `LoopHandle` is the small refcounted
//! identity other threads (and loop-bound objects like sockets and timers)
//! hold. Each iteration drains a task batch, advances the timing wheel,
//! waits on the poll backend, and dispatches readiness to registered fd
//! bindings.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, PollType};
use crate::poll::{self, Poller};
use crate::task::{GatedTask, SyncGate, TaskQueue, TokenState};
use crate::waker::Waker;
use crate::wheel::TimingWheel;

/// Callback invoked with the readiness bitset of its fd.
///
/// The binding must stay valid until `unregister_fd`; the registering
/// subsystem (socket, listener) owns that lifetime.
pub type IoCallback = Box<dyn FnMut(Event) + Send>;

#[derive(Clone)]
struct FdBinding {
    events: Event,
    dispatch: Arc<Mutex<IoCallback>>,
}

pub(crate) struct LoopInner {
    poller: Mutex<Box<dyn Poller>>,
    registry: Mutex<HashMap<RawFd, FdBinding>>,
    pub(crate) wheel: TimingWheel,
    queue: TaskQueue,
    waker: Waker,
    stop: AtomicBool,
    running: AtomicBool,
    /// True while user code runs inside a readiness or timer dispatch
    /// frame; `sync` from such a frame is refused.
    in_dispatch: AtomicBool,
    loop_thread: Mutex<Option<ThreadId>>,
    poll_type: PollType,
    level_triggered: bool,
    max_wait_ms: u32,
    ready: Mutex<Vec<(RawFd, Event)>>,
    #[allow(clippy::type_complexity)]
    tls_provider: Mutex<Option<Arc<dyn crate::tls::TlsProvider>>>,
}

impl LoopInner {
    fn is_loop_thread(&self) -> bool {
        *self.loop_thread.lock() == Some(thread::current().id())
    }

    /// Whether any thread has ever driven this loop. Before that, setup
    /// calls from any thread are safe: the poller cannot be blocked inside
    /// `wait`.
    pub(crate) fn loop_started(&self) -> bool {
        self.loop_thread.lock().is_some()
    }

    pub(crate) fn wake(&self) {
        self.waker.wake();
    }

    pub(crate) fn register_fd(&self, fd: RawFd, events: Event, cb: IoCallback) -> Result<()> {
        if fd < 0 {
            return Err(Error::InvalidParam);
        }
        let mut registry = self.registry.lock();
        if registry.contains_key(&fd) {
            return Err(Error::InvalidParam);
        }
        self.poller.lock().register(fd, events)?;
        registry.insert(
            fd,
            FdBinding {
                events,
                dispatch: Arc::new(Mutex::new(cb)),
            },
        );
        trace!(fd, ?events, "fd registered");
        Ok(())
    }

    pub(crate) fn update_fd(&self, fd: RawFd, events: Event) -> Result<()> {
        let mut registry = self.registry.lock();
        let binding = registry.get_mut(&fd).ok_or(Error::InvalidParam)?;
        if binding.events == events {
            return Ok(());
        }
        self.poller.lock().update(fd, events)?;
        binding.events = events;
        Ok(())
    }

    pub(crate) fn unregister_fd(&self, fd: RawFd) -> Result<()> {
        let removed = self.registry.lock().remove(&fd);
        if removed.is_some() {
            self.poller.lock().unregister(fd)?;
            trace!(fd, "fd unregistered");
        }
        Ok(())
    }

    pub(crate) fn invoke(&self, task: impl FnOnce() + Send + 'static, token: Option<&Token>) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if self.is_loop_thread() && self.queue.is_empty() {
            task();
            return Ok(());
        }
        self.queue
            .push(Box::new(task), token.map(|t| t.state.clone()));
        self.wake();
        Ok(())
    }

    pub(crate) fn post(&self, task: impl FnOnce() + Send + 'static, token: Option<&Token>) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.queue
            .push(Box::new(task), token.map(|t| t.state.clone()));
        self.wake();
        Ok(())
    }

    pub(crate) fn sync(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if self.is_loop_thread() {
            if self.in_dispatch.load(Ordering::Acquire) {
                // Blocking re-entry from inside a dispatched callback.
                return Err(Error::InvalidState);
            }
            task();
            return Ok(());
        }
        let gate = SyncGate::new();
        let gated = GatedTask::new(Box::new(task), gate.clone());
        self.queue.push(Box::new(move || gated.run()), None);
        self.wake();
        gate.wait()
    }

    fn iterate(&self, max_wait_ms: u32) -> Result<()> {
        *self.loop_thread.lock() = Some(thread::current().id());

        self.queue.run_batch();

        self.in_dispatch.store(true, Ordering::Release);
        self.wheel.tick(self.wheel.now_ms());
        self.in_dispatch.store(false, Ordering::Release);

        let mut timeout = max_wait_ms;
        if let Some(next) = self.wheel.next_expiry_ms() {
            timeout = timeout.min(next as u32);
        }
        if !self.queue.is_empty() || self.stop.load(Ordering::Acquire) {
            timeout = 0;
        }

        let mut ready = self.ready.lock();
        ready.clear();
        self.poller.lock().wait(timeout, &mut ready)?;

        for i in 0..ready.len() {
            let (fd, events) = ready[i];
            if fd == self.waker.read_fd() {
                self.waker.drain();
                continue;
            }
            let dispatch = self.registry.lock().get(&fd).map(|b| b.dispatch.clone());
            if let Some(dispatch) = dispatch {
                self.in_dispatch.store(true, Ordering::Release);
                (dispatch.lock())(events);
                self.in_dispatch.store(false, Ordering::Release);
            }
        }
        Ok(())
    }
}

/// An event loop. Owns the poll backend, timer wheel, task queue, and fd
/// handler registry; drives them all from whichever thread calls `run`.
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    /// Create a loop with the default configuration (auto poll backend).
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default())
    }

    /// Create a loop, opening the poll backend and waker up front.
    pub fn with_config(config: Config) -> Result<Self> {
        let poller = poll::create(config.poll_type)?;
        let poll_type = poller.poll_type();
        let level_triggered = poller.is_level_triggered();
        let waker = Waker::new()?;
        let mut poller = poller;
        poller.register(waker.read_fd(), Event::READ)?;
        debug!(%poll_type, "event loop created");
        Ok(EventLoop {
            inner: Arc::new(LoopInner {
                poller: Mutex::new(poller),
                registry: Mutex::new(HashMap::new()),
                wheel: TimingWheel::new(),
                queue: TaskQueue::new(),
                waker,
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
                in_dispatch: AtomicBool::new(false),
                loop_thread: Mutex::new(None),
                poll_type,
                level_triggered,
                max_wait_ms: config.max_wait_ms,
                ready: Mutex::new(Vec::with_capacity(config.event_batch_capacity)),
                tls_provider: Mutex::new(None),
            }),
        })
    }

    /// The refcounted cross-thread handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            inner: self.inner.clone(),
        }
    }

    /// Run until `stop` is called. Queued tasks that have not started when
    /// the loop exits are dropped without executing.
    pub fn run(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState);
        }
        let result = loop {
            if self.inner.stop.load(Ordering::Acquire) {
                break Ok(());
            }
            if let Err(e) = self.inner.iterate(self.inner.max_wait_ms) {
                break Err(e);
            }
        };
        self.inner.queue.clear();
        self.inner.stop.store(false, Ordering::Release);
        self.inner.running.store(false, Ordering::Release);
        debug!("event loop exited");
        result
    }

    /// Run a single iteration, waiting at most `max_wait_ms` for readiness.
    pub fn run_once(&self, max_wait_ms: u32) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState);
        }
        let result = self.inner.iterate(max_wait_ms.min(self.inner.max_wait_ms));
        self.inner.running.store(false, Ordering::Release);
        result
    }

    /// Request the loop to exit after the current iteration. Callable from
    /// any thread.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.wake();
    }

    /// Register an fd with its readiness callback. At most one binding may
    /// exist per fd.
    pub fn register_fd(&self, fd: RawFd, events: Event, cb: IoCallback) -> Result<()> {
        self.inner.register_fd(fd, events, cb)
    }

    /// Replace the interest set of a registered fd.
    pub fn update_fd(&self, fd: RawFd, events: Event) -> Result<()> {
        self.inner.update_fd(fd, events)
    }

    /// Remove an fd binding. Unregistering an unknown fd is a no-op.
    pub fn unregister_fd(&self, fd: RawFd) -> Result<()> {
        self.inner.unregister_fd(fd)
    }

    /// Create a token for cancelling tasks queued with it.
    pub fn create_token(&self) -> Token {
        Token {
            state: TokenState::new(),
            inner: self.inner.clone(),
        }
    }

    /// Run `task` on the loop thread. Executes inline when called on the
    /// loop thread with nothing queued ahead of it; otherwise queued.
    pub fn invoke(&self, task: impl FnOnce() + Send + 'static, token: Option<&Token>) -> Result<()> {
        self.inner.invoke(task, token)
    }

    /// Queue `task` for the next loop iteration. Never runs before this
    /// call returns, even on the loop thread.
    pub fn post(&self, task: impl FnOnce() + Send + 'static, token: Option<&Token>) -> Result<()> {
        self.inner.post(task, token)
    }

    /// Run `task` on the loop thread and wait for it to finish.
    pub fn sync(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.inner.sync(task)
    }

    /// Cancel all queued tasks carrying `token`.
    pub fn cancel(&self, token: &Token) {
        token.cancel();
    }

    /// Whether the caller is on the thread the loop last ran on.
    pub fn in_same_thread(&self) -> bool {
        self.inner.is_loop_thread()
    }

    /// The resolved poll backend.
    pub fn poll_type(&self) -> PollType {
        self.inner.poll_type
    }

    /// Whether the backend reports level-triggered readiness.
    pub fn is_level_triggered(&self) -> bool {
        self.inner.level_triggered
    }

    /// Install the TLS session provider used by `start_ssl_handshake`.
    pub fn set_tls_provider(&self, provider: Arc<dyn crate::tls::TlsProvider>) {
        *self.inner.tls_provider.lock() = Some(provider);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.queue.clear();
    }
}

/// Cloneable, thread-safe handle to a loop. This is the only legal way for
/// foreign threads to reach loop-owned state.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) inner: Arc<LoopInner>,
}

impl LoopHandle {
    /// See [`EventLoop::invoke`].
    pub fn invoke(&self, task: impl FnOnce() + Send + 'static, token: Option<&Token>) -> Result<()> {
        self.inner.invoke(task, token)
    }

    /// See [`EventLoop::post`].
    pub fn post(&self, task: impl FnOnce() + Send + 'static, token: Option<&Token>) -> Result<()> {
        self.inner.post(task, token)
    }

    /// See [`EventLoop::sync`].
    pub fn sync(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.inner.sync(task)
    }

    /// See [`EventLoop::create_token`].
    pub fn create_token(&self) -> Token {
        Token {
            state: TokenState::new(),
            inner: self.inner.clone(),
        }
    }

    /// See [`EventLoop::stop`].
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.wake();
    }

    /// See [`EventLoop::in_same_thread`].
    pub fn in_same_thread(&self) -> bool {
        self.inner.is_loop_thread()
    }

    /// See [`EventLoop::poll_type`].
    pub fn poll_type(&self) -> PollType {
        self.inner.poll_type
    }

    pub(crate) fn tls_provider(&self) -> Option<Arc<dyn crate::tls::TlsProvider>> {
        self.inner.tls_provider.lock().clone()
    }
}

/// Identity for a group of cancelable tasks. Movable, not clonable; owned
/// by one loop. Dropping a token cancels its tasks.
pub struct Token {
    state: Arc<TokenState>,
    inner: Arc<LoopInner>,
}

impl Token {
    /// Cancel every queued task carrying this token. Tasks that already
    /// started run to completion; if one is mid-run on another thread this
    /// call blocks until it finishes.
    pub fn cancel(&self) {
        self.inner.queue.cancel(&self.state);
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.cancel();
    }
}
