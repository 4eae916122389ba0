use crate::event::PollType;

/// Configuration for an event loop.
#[derive(Debug, Clone)]
pub struct Config {
    /// Poll backend to use. `PollType::None` auto-selects per platform.
    pub poll_type: PollType,
    /// Upper bound on one poll wait in milliseconds when the loop is
    /// otherwise idle. `u32::MAX` means wait indefinitely.
    pub max_wait_ms: u32,
    /// Initial capacity of the per-iteration readiness batch.
    pub event_batch_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_type: PollType::None,
            max_wait_ms: u32::MAX,
            event_batch_capacity: 1024,
        }
    }
}
