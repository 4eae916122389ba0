//! select(2) backend. Capacity bounded by FD_SETSIZE.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

use tracing::warn;

use crate::error::{Error, Result};
use crate::event::{Event, PollType};

use super::Poller;

pub(crate) struct SelectBackend {
    interests: HashMap<RawFd, Event>,
}

impl SelectBackend {
    pub(crate) fn new() -> Self {
        SelectBackend {
            interests: HashMap::new(),
        }
    }
}

impl Poller for SelectBackend {
    fn register(&mut self, fd: RawFd, events: Event) -> Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            return Err(Error::NotSupported);
        }
        if self.interests.contains_key(&fd) {
            return Err(Error::InvalidParam);
        }
        self.interests.insert(fd, events);
        Ok(())
    }

    fn update(&mut self, fd: RawFd, events: Event) -> Result<()> {
        match self.interests.get_mut(&fd) {
            Some(slot) => {
                *slot = events;
                Ok(())
            }
            None => Err(Error::InvalidParam),
        }
    }

    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        self.interests.remove(&fd);
        Ok(())
    }

    fn wait(&mut self, timeout_ms: u32, out: &mut Vec<(RawFd, Event)>) -> Result<()> {
        let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut err_set: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_ZERO(&mut err_set);
        }

        let mut max_fd: RawFd = -1;
        for (&fd, &ev) in &self.interests {
            if ev.contains(Event::READ) {
                unsafe { libc::FD_SET(fd, &mut read_set) };
            }
            if ev.contains(Event::WRITE) {
                unsafe { libc::FD_SET(fd, &mut write_set) };
            }
            unsafe { libc::FD_SET(fd, &mut err_set) };
            max_fd = max_fd.max(fd);
        }

        let mut tv = libc::timeval {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t,
        };
        let tv_ptr = if timeout_ms == u32::MAX {
            std::ptr::null_mut()
        } else {
            &mut tv as *mut libc::timeval
        };

        let n = unsafe {
            libc::select(
                max_fd + 1,
                &mut read_set,
                &mut write_set,
                &mut err_set,
                tv_ptr,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            warn!("select failed: {err}");
            return Err(Error::PollError);
        }
        if n == 0 {
            return Ok(());
        }
        for &fd in self.interests.keys() {
            let mut ready = Event::empty();
            if unsafe { libc::FD_ISSET(fd, &read_set) } {
                ready |= Event::READ;
            }
            if unsafe { libc::FD_ISSET(fd, &write_set) } {
                ready |= Event::WRITE;
            }
            if unsafe { libc::FD_ISSET(fd, &err_set) } {
                ready |= Event::ERROR;
            }
            if !ready.is_empty() {
                out.push((fd, ready));
            }
        }
        Ok(())
    }

    fn poll_type(&self) -> PollType {
        PollType::Select
    }
}
