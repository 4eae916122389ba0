//! Loop wakeup fd.
//!
//! An eventfd on Linux, a non-blocking pipe elsewhere. The read end is
//! registered with the loop's poller; writing from any thread interrupts a
//! blocked `wait`.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

pub(crate) struct Waker {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Waker {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(crate) fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            tracing::warn!("eventfd failed: {}", io::Error::last_os_error());
            return Err(Error::PollError);
        }
        Ok(Waker {
            read_fd: fd,
            write_fd: fd,
        })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub(crate) fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc < 0 {
            tracing::warn!("pipe failed: {}", io::Error::last_os_error());
            return Err(Error::PollError);
        }
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(Waker {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Wake the loop. Safe from any thread; a full pipe means a wake is
    /// already pending, which is all we need.
    pub(crate) fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(
                self.write_fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    /// Drain pending wake tokens so level-triggered pollers go quiet.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_then_drain() {
        let waker = Waker::new().unwrap();
        waker.wake();
        waker.wake();
        waker.drain();
        // Second drain finds nothing and must not block.
        waker.drain();
    }
}
