//! Deferred task queue and cancellation tokens.
//!
//! Any thread may append work; the loop thread drains it in batches. A
//! batch is the queue contents at drain time; tasks posted while the batch
//! runs wait for the next iteration, which keeps a task that re-posts
//! itself from starving readiness and timer processing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

pub(crate) type TaskFn = Box<dyn FnOnce() + Send>;

/// Shared cancellation state behind a `Token`.
pub(crate) struct TokenState {
    cancelled: AtomicBool,
}

impl TokenState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(TokenState {
            cancelled: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub(crate) struct Task {
    thunk: TaskFn,
    token: Option<Arc<TokenState>>,
}

struct Running {
    token: Option<Arc<TokenState>>,
    thread: Option<ThreadId>,
}

pub(crate) struct TaskQueue {
    queue: Mutex<VecDeque<Task>>,
    /// Token of the task currently executing, if any. `cancel` of that
    /// token waits here until the task finishes.
    running: Mutex<Running>,
    running_cv: Condvar,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        TaskQueue {
            queue: Mutex::new(VecDeque::new()),
            running: Mutex::new(Running {
                token: None,
                thread: None,
            }),
            running_cv: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, thunk: TaskFn, token: Option<Arc<TokenState>>) {
        self.queue.lock().push_back(Task { thunk, token });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Run one batch of queued tasks. Tasks whose token was cancelled are
    /// dropped without running. Returns the number executed.
    pub(crate) fn run_batch(&self) -> usize {
        let batch: VecDeque<Task> = std::mem::take(&mut *self.queue.lock());
        let mut ran = 0;
        for task in batch {
            if let Some(ref token) = task.token {
                // The cancelled check and the running publication must be
                // one atomic step, or a cancel could slip between them and
                // return while the task still starts.
                let mut running = self.running.lock();
                if token.is_cancelled() {
                    continue;
                }
                running.token = Some(token.clone());
                running.thread = Some(thread::current().id());
            }
            (task.thunk)();
            ran += 1;
            if task.token.is_some() {
                let mut running = self.running.lock();
                running.token = None;
                running.thread = None;
                self.running_cv.notify_all();
            }
        }
        ran
    }

    /// Mark a token cancelled. Queued tasks bearing it are skipped at drain
    /// time; if one is executing on another thread right now, block until
    /// it completes so the caller may free what the task references.
    pub(crate) fn cancel(&self, token: &Arc<TokenState>) {
        token.cancelled.store(true, Ordering::Release);
        let mut running = self.running.lock();
        while running
            .token
            .as_ref()
            .is_some_and(|t| Arc::ptr_eq(t, token))
        {
            if running.thread == Some(thread::current().id()) {
                // Cancelling from inside the task itself; it will finish on
                // its own.
                return;
            }
            self.running_cv.wait(&mut running);
        }
    }

    /// Drop all queued tasks without running them (loop shutdown).
    pub(crate) fn clear(&self) {
        let dropped: VecDeque<Task> = std::mem::take(&mut *self.queue.lock());
        drop(dropped);
    }
}

/// State of a blocking `sync` dispatch.
enum GateState {
    Pending,
    Done,
    /// The loop stopped before the task ran.
    Dropped,
}

pub(crate) struct SyncGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl SyncGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(SyncGate {
            state: Mutex::new(GateState::Pending),
            cv: Condvar::new(),
        })
    }

    fn set(&self, state: GateState) {
        *self.state.lock() = state;
        self.cv.notify_all();
    }

    pub(crate) fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            match *state {
                GateState::Pending => self.cv.wait(&mut state),
                GateState::Done => return Ok(()),
                GateState::Dropped => return Err(Error::Closed),
            }
        }
    }
}

/// Wraps a sync task so the gate is signalled whether the task runs or the
/// loop drops it on shutdown.
pub(crate) struct GatedTask {
    thunk: Option<TaskFn>,
    gate: Arc<SyncGate>,
}

impl GatedTask {
    pub(crate) fn new(thunk: TaskFn, gate: Arc<SyncGate>) -> Self {
        GatedTask {
            thunk: Some(thunk),
            gate,
        }
    }

    pub(crate) fn run(mut self) {
        if let Some(thunk) = self.thunk.take() {
            thunk();
        }
        self.gate.set(GateState::Done);
    }
}

impl Drop for GatedTask {
    fn drop(&mut self) {
        if self.thunk.is_some() {
            self.gate.set(GateState::Dropped);
        }
    }
}
