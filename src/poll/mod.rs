//! Readiness poll backends.
//!
//! Each backend is a thin adapter over one OS multiplexing call. The loop
//! only sees the `Poller` trait: register/update/unregister an fd's interest
//! set and wait for `(fd, events)` pairs. All shipped backends report
//! level-triggered readiness; the socket layer keeps WRITE interest armed
//! only while it has pending output, so it stays correct either way.

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};
use crate::event::{Event, PollType};

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd"
))]
mod kqueue;
mod poll_;
mod select;

/// Interface the event loop drives. One instance per loop, owned by it.
pub(crate) trait Poller: Send {
    /// Add an fd with an initial interest set. Fails if the fd is already
    /// registered or the backend is out of capacity.
    fn register(&mut self, fd: RawFd, events: Event) -> Result<()>;

    /// Replace the interest set of a registered fd.
    fn update(&mut self, fd: RawFd, events: Event) -> Result<()>;

    /// Remove an fd. Removing an fd that is not registered is a no-op.
    fn unregister(&mut self, fd: RawFd) -> Result<()>;

    /// Block up to `timeout_ms` (`u32::MAX` = forever) and append ready
    /// `(fd, events)` pairs to `out`. Returning with no events is a normal
    /// spurious wake, not an error.
    fn wait(&mut self, timeout_ms: u32, out: &mut Vec<(RawFd, Event)>) -> Result<()>;

    fn poll_type(&self) -> PollType;

    fn is_level_triggered(&self) -> bool {
        true
    }
}

/// Construct the backend for `requested`, auto-selecting on `None`.
pub(crate) fn create(requested: PollType) -> Result<Box<dyn Poller>> {
    match requested {
        PollType::None => create(default_poll_type()),
        PollType::Poll => Ok(Box::new(poll_::PollBackend::new())),
        PollType::Select => Ok(Box::new(select::SelectBackend::new())),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        PollType::Epoll => Ok(Box::new(epoll::EpollBackend::new()?)),
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "openbsd"
        ))]
        PollType::Kqueue => Ok(Box::new(kqueue::KqueueBackend::new()?)),
        _ => Err(Error::NotSupported),
    }
}

/// Best backend for the target OS.
pub(crate) fn default_poll_type() -> PollType {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        PollType::Epoll
    }
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd"
    ))]
    {
        PollType::Kqueue
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd"
    )))]
    {
        PollType::Poll
    }
}

/// Clamp the loop's millisecond timeout to what the syscall accepts.
fn timeout_to_c_int(timeout_ms: u32) -> libc::c_int {
    if timeout_ms == u32::MAX {
        -1
    } else {
        timeout_ms.min(i32::MAX as u32) as libc::c_int
    }
}
