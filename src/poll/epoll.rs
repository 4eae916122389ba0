//! epoll(7) backend (Linux).

use std::collections::HashSet;
use std::io;
use std::os::unix::io::RawFd;

use tracing::warn;

use crate::error::{Error, Result};
use crate::event::{Event, PollType};

use super::{timeout_to_c_int, Poller};

const WAIT_CAPACITY: usize = 1024;

pub(crate) struct EpollBackend {
    epfd: RawFd,
    registered: HashSet<RawFd>,
    events: Vec<libc::epoll_event>,
}

impl EpollBackend {
    pub(crate) fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            warn!("epoll_create1 failed: {}", io::Error::last_os_error());
            return Err(Error::PollError);
        }
        Ok(EpollBackend {
            epfd,
            registered: HashSet::new(),
            events: vec![unsafe { std::mem::zeroed() }; WAIT_CAPACITY],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: Event) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_bits(events),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            warn!(fd, "epoll_ctl failed: {}", io::Error::last_os_error());
            return Err(Error::PollError);
        }
        Ok(())
    }
}

fn interest_bits(events: Event) -> u32 {
    let mut bits = 0u32;
    if events.contains(Event::READ) {
        bits |= libc::EPOLLIN as u32;
    }
    if events.contains(Event::WRITE) {
        bits |= libc::EPOLLOUT as u32;
    }
    // EPOLLERR / EPOLLHUP are delivered unconditionally.
    bits
}

fn ready_bits(bits: u32) -> Event {
    let mut ev = Event::empty();
    if bits & libc::EPOLLIN as u32 != 0 {
        ev |= Event::READ;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        ev |= Event::WRITE;
    }
    if bits & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
        ev |= Event::ERROR;
    }
    ev
}

impl Poller for EpollBackend {
    fn register(&mut self, fd: RawFd, events: Event) -> Result<()> {
        if !self.registered.insert(fd) {
            return Err(Error::InvalidParam);
        }
        if let Err(e) = self.ctl(libc::EPOLL_CTL_ADD, fd, events) {
            self.registered.remove(&fd);
            return Err(e);
        }
        Ok(())
    }

    fn update(&mut self, fd: RawFd, events: Event) -> Result<()> {
        if !self.registered.contains(&fd) {
            return Err(Error::InvalidParam);
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        if !self.registered.remove(&fd) {
            return Ok(());
        }
        // The fd may already be closed; nothing to report in that case.
        unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
        Ok(())
    }

    fn wait(&mut self, timeout_ms: u32, out: &mut Vec<(RawFd, Event)>) -> Result<()> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_to_c_int(timeout_ms),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            warn!("epoll_wait failed: {err}");
            return Err(Error::PollError);
        }
        for ev in &self.events[..n as usize] {
            let ready = ready_bits(ev.events);
            if !ready.is_empty() {
                out.push((ev.u64 as RawFd, ready));
            }
        }
        Ok(())
    }

    fn poll_type(&self) -> PollType {
        PollType::Epoll
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
