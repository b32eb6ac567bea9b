//! epoll-backed selector (Linux, Android).

use std::io;
use std::os::unix::io::RawFd;

use log::trace;

use super::Event;
use crate::config::MAX_EVENTS_PER_POLL;
use crate::sys::NativeHandle;

/// Interest mask every registration carries. Edge-triggered, with
/// `EPOLLRDHUP` so an orderly peer shutdown is reported distinctly from a
/// full hang-up.
const BASE_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLRDHUP) as u32;

pub(crate) struct Selector {
    epfd: RawFd,
    /// Native event records reused across sweeps.
    raw: Vec<libc::epoll_event>,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let epfd = syscall_fd(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        trace!("epoll selector created: epfd={}", epfd);

        Ok(Selector {
            epfd,
            raw: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS_PER_POLL],
        })
    }

    pub(crate) fn registrar(&self) -> Registrar {
        Registrar { epfd: self.epfd }
    }

    /// One zero-timeout sweep; decoded events are appended to `out`.
    pub(crate) fn select(&mut self, out: &mut Vec<Event>) -> io::Result<()> {
        let count = loop {
            let rc = unsafe {
                libc::epoll_wait(self.epfd, self.raw.as_mut_ptr(), self.raw.len() as i32, 0)
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        for raw in &self.raw[..count] {
            let flags = raw.events;
            out.push(Event {
                handle: raw.u64 as NativeHandle,
                readable: flags & libc::EPOLLIN as u32 != 0,
                writable: flags & libc::EPOLLOUT as u32 != 0,
                error: flags & libc::EPOLLERR as u32 != 0,
                hangup: flags & libc::EPOLLHUP as u32 != 0,
                peer_hangup: flags & libc::EPOLLRDHUP as u32 != 0,
            });
        }

        Ok(())
    }

    /// Closes the epoll handle. Registrations die with it.
    pub(crate) fn close(&mut self) {
        if self.epfd >= 0 {
            unsafe { libc::close(self.epfd) };
            self.epfd = -1;
        }
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        self.close();
    }
}

/// Non-owning view of the selector handed to each connection so the send
/// path can toggle write interest without reaching back into the reactor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Registrar {
    epfd: RawFd,
}

impl Registrar {
    /// Registers a handle for edge-triggered read readiness.
    pub(crate) fn register(&self, handle: NativeHandle) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, handle, BASE_EVENTS)
    }

    pub(crate) fn deregister(&self, handle: NativeHandle) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, handle, 0)
    }

    /// Adds write interest; the next writability edge drains the spooled
    /// bytes.
    pub(crate) fn arm_writable(&self, handle: NativeHandle) -> io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_MOD,
            handle,
            BASE_EVENTS | libc::EPOLLOUT as u32,
        )
    }

    /// Drops write interest once the spool is empty again.
    pub(crate) fn disarm_writable(&self, handle: NativeHandle) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, handle, BASE_EVENTS)
    }

    fn ctl(&self, op: i32, handle: NativeHandle, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: handle as u64,
        };
        let ev_ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut ev as *mut libc::epoll_event
        };
        syscall_fd(unsafe { libc::epoll_ctl(self.epfd, op, handle, ev_ptr) })?;
        Ok(())
    }
}

fn syscall_fd(rc: i32) -> io::Result<i32> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}
