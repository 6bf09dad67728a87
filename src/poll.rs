//! Edge-triggered readiness notification: thin epoll and eventfd wrappers.
//!
//! Every endpoint is registered `IN|OUT|HUP` edge-triggered, so handlers
//! must drain their fd to `EAGAIN` on every wake. The epoll user data
//! carries the raw fd.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use anyhow::{Context, Result};

/// Registration mask for data-carrying endpoints.
pub fn edge_rw() -> u32 {
    (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLET) as u32
}

pub struct Poller {
    epfd: OwnedFd,
}

impl Poller {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("epoll_create1 failed");
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn add(&self, fd: RawFd, events: u32) -> Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error()).with_context(|| format!("epoll add fd {fd}"));
        }
        Ok(())
    }

    pub fn del(&self, fd: RawFd) -> Result<()> {
        let ret =
            unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(io::Error::last_os_error()).with_context(|| format!("epoll del fd {fd}"));
        }
        Ok(())
    }

    /// Block until at least one fd is ready. Returns the number of events
    /// filled in. `EINTR` surfaces as zero events.
    pub fn wait(&self, events: &mut [libc::epoll_event]) -> Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as i32,
                -1,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err).context("epoll_wait failed");
        }
        Ok(n as usize)
    }
}

/// Non-blocking eventfd used to wake the loop from signal context.
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("eventfd failed");
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Consume all pending wakeups.
    pub fn drain(&self) {
        loop {
            let mut buf: u64 = 0;
            let ptr = &mut buf as *mut u64 as *mut libc::c_void;
            let n = unsafe { libc::read(self.fd.as_raw_fd(), ptr, std::mem::size_of::<u64>()) };
            if n <= 0 {
                break;
            }
        }
    }
}

/// Write one wakeup token to an eventfd. Only calls `write(2)`, so it is
/// safe from a signal handler.
pub fn signal_eventfd(fd: RawFd) {
    let one: u64 = 1;
    let ptr = &one as *const u64 as *const libc::c_void;
    unsafe {
        libc::write(fd, ptr, std::mem::size_of::<u64>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eventfd_wakes_poller() {
        let poller = Poller::new().unwrap();
        let ev = EventFd::new().unwrap();
        poller.add(ev.raw(), libc::EPOLLIN as u32).unwrap();

        signal_eventfd(ev.raw());

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 8];
        let n = poller.wait(&mut events).unwrap();
        assert_eq!(n, 1);
        let got = events[0].u64;
        assert_eq!(got, ev.raw() as u64);

        ev.drain();
        // After draining, the fd reads empty again.
        let mut buf: u64 = 0;
        let ptr = &mut buf as *mut u64 as *mut libc::c_void;
        let r = unsafe { libc::read(ev.raw(), ptr, std::mem::size_of::<u64>()) };
        assert!(r < 0);
    }
}
