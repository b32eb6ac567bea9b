//! kqueue-backed selector (macOS, iOS, the BSDs).

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use log::trace;

use super::Event;
use crate::config::MAX_EVENTS_PER_POLL;
use crate::sys::NativeHandle;

pub(crate) struct Selector {
    kq: RawFd,
    raw: Vec<libc::kevent>,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let kq = check(unsafe { libc::kqueue() })?;
        check(unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) })?;
        trace!("kqueue selector created: kq={}", kq);

        Ok(Selector {
            kq,
            raw: vec![empty_kevent(); MAX_EVENTS_PER_POLL],
        })
    }

    pub(crate) fn registrar(&self) -> Registrar {
        Registrar { kq: self.kq }
    }

    /// One zero-timeout sweep; decoded events are appended to `out`.
    ///
    /// kqueue reports each filter as its own record, so a handle that is
    /// simultaneously readable and writable produces two entries; the
    /// reactor's state machine handles either interleaving.
    pub(crate) fn select(&mut self, out: &mut Vec<Event>) -> io::Result<()> {
        let timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        let count = loop {
            let rc = unsafe {
                libc::kevent(
                    self.kq,
                    ptr::null(),
                    0,
                    self.raw.as_mut_ptr(),
                    self.raw.len() as i32,
                    &timeout,
                )
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
            let eof = raw.flags & libc::EV_EOF != 0;
            out.push(Event {
                handle: raw.ident as NativeHandle,
                readable: raw.filter == libc::EVFILT_READ,
                writable: raw.filter == libc::EVFILT_WRITE,
                error: raw.flags & libc::EV_ERROR != 0,
                hangup: false,
                // EV_EOF on the read filter is the peer shutting down its
                // write side, the RDHUP analogue.
                peer_hangup: eof && raw.filter == libc::EVFILT_READ,
            });
        }

        Ok(())
    }

    /// Closes the kqueue handle. Registrations die with it.
    pub(crate) fn close(&mut self) {
        if self.kq >= 0 {
            unsafe { libc::close(self.kq) };
            self.kq = -1;
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
    kq: RawFd,
}

impl Registrar {
    /// Registers a handle for edge-triggered (`EV_CLEAR`) read readiness.
    pub(crate) fn register(&self, handle: NativeHandle) -> io::Result<()> {
        self.change(handle, libc::EVFILT_READ, libc::EV_ADD | libc::EV_CLEAR)
    }

    pub(crate) fn deregister(&self, handle: NativeHandle) -> io::Result<()> {
        // The write filter is only present while armed; a missing entry is
        // not an error worth surfacing on teardown.
        let _ = self.change(handle, libc::EVFILT_WRITE, libc::EV_DELETE);
        self.change(handle, libc::EVFILT_READ, libc::EV_DELETE)
    }

    pub(crate) fn arm_writable(&self, handle: NativeHandle) -> io::Result<()> {
        self.change(handle, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_CLEAR)
    }

    pub(crate) fn disarm_writable(&self, handle: NativeHandle) -> io::Result<()> {
        match self.change(handle, libc::EVFILT_WRITE, libc::EV_DELETE) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    fn change(&self, handle: NativeHandle, filter: i16, flags: u16) -> io::Result<()> {
        let mut change = empty_kevent();
        change.ident = handle as usize;
        change.filter = filter;
        change.flags = flags;

        check(unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) })?;
        Ok(())
    }
}

fn empty_kevent() -> libc::kevent {
    // All-zero records are valid placeholders for both change and event
    // lists.
    unsafe { std::mem::zeroed() }
}

fn check(rc: i32) -> io::Result<i32> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}
