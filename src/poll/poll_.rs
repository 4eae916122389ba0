//! poll(2) backend. Portable across unix targets; O(n) per wait.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

use tracing::warn;

use crate::error::{Error, Result};
use crate::event::{Event, PollType};

use super::{timeout_to_c_int, Poller};

pub(crate) struct PollBackend {
    fds: Vec<libc::pollfd>,
    // fd -> index into `fds`
    index: HashMap<RawFd, usize>,
}

impl PollBackend {
    pub(crate) fn new() -> Self {
        PollBackend {
            fds: Vec::new(),
            index: HashMap::new(),
        }
    }
}

fn interest_bits(events: Event) -> libc::c_short {
    let mut bits = 0 as libc::c_short;
    if events.contains(Event::READ) {
        bits |= libc::POLLIN;
    }
    if events.contains(Event::WRITE) {
        bits |= libc::POLLOUT;
    }
    bits
}

fn ready_bits(bits: libc::c_short) -> Event {
    let mut ev = Event::empty();
    if bits & libc::POLLIN != 0 {
        ev |= Event::READ;
    }
    if bits & libc::POLLOUT != 0 {
        ev |= Event::WRITE;
    }
    if bits & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        ev |= Event::ERROR;
    }
    ev
}

impl Poller for PollBackend {
    fn register(&mut self, fd: RawFd, events: Event) -> Result<()> {
        if self.index.contains_key(&fd) {
            return Err(Error::InvalidParam);
        }
        self.index.insert(fd, self.fds.len());
        self.fds.push(libc::pollfd {
            fd,
            events: interest_bits(events),
            revents: 0,
        });
        Ok(())
    }

    fn update(&mut self, fd: RawFd, events: Event) -> Result<()> {
        match self.index.get(&fd) {
            Some(&i) => {
                self.fds[i].events = interest_bits(events);
                Ok(())
            }
            None => Err(Error::InvalidParam),
        }
    }

    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        if let Some(i) = self.index.remove(&fd) {
            self.fds.swap_remove(i);
            if i < self.fds.len() {
                let moved = self.fds[i].fd;
                self.index.insert(moved, i);
            }
        }
        Ok(())
    }

    fn wait(&mut self, timeout_ms: u32, out: &mut Vec<(RawFd, Event)>) -> Result<()> {
        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_to_c_int(timeout_ms),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            warn!("poll failed: {err}");
            return Err(Error::PollError);
        }
        if n == 0 {
            return Ok(());
        }
        for pfd in &self.fds {
            let ready = ready_bits(pfd.revents);
            if !ready.is_empty() {
                out.push((pfd.fd, ready));
            }
        }
        Ok(())
    }

    fn poll_type(&self) -> PollType {
        PollType::Poll
    }
}
