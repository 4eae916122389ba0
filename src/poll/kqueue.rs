//! kqueue(2) backend (macOS / BSDs).
//!
//! Read and write interest are separate kevent filters; `update` diffs the
//! old and new interest sets and adds/deletes filters accordingly.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

use tracing::warn;

use crate::error::{Error, Result};
use crate::event::{Event, PollType};

use super::Poller;

const WAIT_CAPACITY: usize = 1024;

pub(crate) struct KqueueBackend {
    kq: RawFd,
    interests: HashMap<RawFd, Event>,
    events: Vec<libc::kevent>,
}

impl KqueueBackend {
    pub(crate) fn new() -> Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            warn!("kqueue failed: {}", io::Error::last_os_error());
            return Err(Error::PollError);
        }
        Ok(KqueueBackend {
            kq,
            interests: HashMap::new(),
            events: vec![unsafe { std::mem::zeroed() }; WAIT_CAPACITY],
        })
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16) -> Result<()> {
        let change = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        };
        let rc = unsafe {
            libc::kevent(
                self.kq,
                &change,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Deleting a filter that was never added is fine.
            if flags & libc::EV_DELETE != 0 && err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            warn!(fd, "kevent change failed: {err}");
            return Err(Error::PollError);
        }
        Ok(())
    }

    fn apply(&self, fd: RawFd, old: Event, new: Event) -> Result<()> {
        for (bit, filter) in [
            (Event::READ, libc::EVFILT_READ),
            (Event::WRITE, libc::EVFILT_WRITE),
        ] {
            match (old.contains(bit), new.contains(bit)) {
                (false, true) => self.change(fd, filter, libc::EV_ADD | libc::EV_ENABLE)?,
                (true, false) => self.change(fd, filter, libc::EV_DELETE)?,
                _ => {}
            }
        }
        Ok(())
    }
}

impl Poller for KqueueBackend {
    fn register(&mut self, fd: RawFd, events: Event) -> Result<()> {
        if self.interests.contains_key(&fd) {
            return Err(Error::InvalidParam);
        }
        self.apply(fd, Event::empty(), events)?;
        self.interests.insert(fd, events);
        Ok(())
    }

    fn update(&mut self, fd: RawFd, events: Event) -> Result<()> {
        let old = match self.interests.get(&fd) {
            Some(&old) => old,
            None => return Err(Error::InvalidParam),
        };
        self.apply(fd, old, events)?;
        self.interests.insert(fd, events);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        if let Some(old) = self.interests.remove(&fd) {
            let _ = self.apply(fd, old, Event::empty());
        }
        Ok(())
    }

    fn wait(&mut self, timeout_ms: u32, out: &mut Vec<(RawFd, Event)>) -> Result<()> {
        let ts = libc::timespec {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
        };
        let ts_ptr = if timeout_ms == u32::MAX {
            std::ptr::null()
        } else {
            &ts as *const libc::timespec
        };

        let n = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                ts_ptr,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            warn!("kevent wait failed: {err}");
            return Err(Error::PollError);
        }
        for kev in &self.events[..n as usize] {
            let fd = kev.ident as RawFd;
            let mut ready = Event::empty();
            match kev.filter {
                libc::EVFILT_READ => ready |= Event::READ,
                libc::EVFILT_WRITE => ready |= Event::WRITE,
                _ => {}
            }
            if kev.flags & libc::EV_ERROR != 0 {
                ready |= Event::ERROR;
            }
            // EV_EOF with read readiness lets the owner observe the 0-byte
            // read; without it, surface as an error condition.
            if kev.flags & libc::EV_EOF != 0 && !ready.contains(Event::READ) {
                ready |= Event::ERROR;
            }
            if !ready.is_empty() {
                out.push((fd, ready));
            }
        }
        Ok(())
    }

    fn poll_type(&self) -> PollType {
        PollType::Kqueue
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
