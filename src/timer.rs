//! User-facing timer handle.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::event_loop::{EventLoop, LoopHandle};

/// Whether a timer fires once or re-arms itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerMode {
    #[default]
    OneShot,
    Repeating,
}

/// A timer bound to one loop's timing wheel.
///
/// `schedule` and `cancel` are thread-safe; the callback always runs on the
/// loop thread. Dropping the handle cancels the timer and, if its callback
/// is mid-run on another thread, waits for it to return before freeing the
/// node.
pub struct Timer {
    handle: LoopHandle,
    node: Mutex<Option<u32>>,
}

impl Timer {
    pub fn new(event_loop: &EventLoop) -> Self {
        Self::with_handle(event_loop.handle())
    }

    /// Bind a timer via a loop handle; useful from inside posted tasks.
    pub fn with_handle(handle: LoopHandle) -> Self {
        Timer {
            handle,
            node: Mutex::new(None),
        }
    }

    /// Arm the timer. Re-scheduling an armed timer replaces the previous
    /// scheduling and callback. Repeating timers re-arm from the expected
    /// expiry, so the average rate does not drift with handler latency.
    pub fn schedule(
        &self,
        delay_ms: u32,
        mode: TimerMode,
        cb: impl FnMut() + Send + 'static,
    ) -> Result<()> {
        let id = {
            let mut node = self.node.lock();
            match *node {
                Some(id) => id,
                None => {
                    let id = self.handle.inner.wheel.alloc();
                    *node = Some(id);
                    id
                }
            }
        };
        let period = match mode {
            TimerMode::OneShot => 0,
            TimerMode::Repeating => u64::from(delay_ms),
        };
        self.handle
            .inner
            .wheel
            .schedule(id, u64::from(delay_ms), period, Box::new(cb));
        // The loop may be asleep past the new expiry; re-evaluate.
        self.handle.inner.wake();
        Ok(())
    }

    /// Disarm the timer. If the callback is currently running on another
    /// thread, block until it returns; afterwards it will not fire again.
    pub fn cancel(&self) {
        let id = *self.node.lock();
        if let Some(id) = id {
            self.handle.inner.wheel.cancel(id);
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let id = self.node.lock().take();
        if let Some(id) = id {
            self.handle.inner.wheel.release(id);
        }
    }
}
