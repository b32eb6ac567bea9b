//! Completion backend (Winsock + `BindIoCompletionCallback`).
//!
//! Each connection owns one [`IoContext`]: the OS `OVERLAPPED` record plus
//! the completion slots the routine below fills in. At most one receive is
//! outstanding per handle at any time, so the context is written by exactly
//! one completion between consecutive `poll` observations; the flag store
//! with release ordering publishes the transferred count and error code to
//! the polling thread.
//!
//! The completion routine records results only. Delivering bytes to user
//! callbacks, closing on error, and posting the next receive all happen on
//! the thread driving [`Reactor::poll`](crate::Reactor::poll).

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Once;

use log::trace;

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::Networking::WinSock::{
    WSAGetLastError, WSARecv, WSAStartup, SOCKET, SOCKET_ERROR, WSABUF, WSADATA, WSA_IO_PENDING,
};
use windows_sys::Win32::System::IO::{BindIoCompletionCallback, OVERLAPPED};

use crate::buffer::IoBuffer;
use crate::config::MAX_BYTES_PER_READ;
use crate::sys::NativeHandle;

/// One-time Winsock startup. Cleanup is intentionally left to process
/// exit, matching how the Rust ecosystem treats `WSAStartup`.
///
/// A startup failure is remembered and reported to this and every later
/// caller, so no reactor is ever built on an uninitialized environment.
pub(crate) fn init() -> io::Result<()> {
    static INIT: Once = Once::new();
    static STARTUP_ERROR: AtomicI32 = AtomicI32::new(0);

    INIT.call_once(|| unsafe {
        let mut data: WSADATA = std::mem::zeroed();
        let rc = WSAStartup(0x0202, &mut data);
        if rc != 0 {
            STARTUP_ERROR.store(rc, Ordering::Relaxed);
        }
    });

    match STARTUP_ERROR.load(Ordering::Relaxed) {
        0 => Ok(()),
        rc => Err(io::Error::from_raw_os_error(rc)),
    }
}

/// Completion-backend stand-in for the readiness registrar. Write interest
/// does not exist here: spooled bytes are drained once per `poll` cycle
/// instead of on writability edges.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Registrar;

impl Registrar {
    pub(crate) fn register(&self, handle: NativeHandle) -> io::Result<()> {
        bind_completion_callback(handle)
    }

    pub(crate) fn deregister(&self, _handle: NativeHandle) -> io::Result<()> {
        // Closing the socket cancels the binding.
        Ok(())
    }

    pub(crate) fn arm_writable(&self, _handle: NativeHandle) -> io::Result<()> {
        Ok(())
    }

    pub(crate) fn disarm_writable(&self, _handle: NativeHandle) -> io::Result<()> {
        Ok(())
    }
}

/// Associates the completion routine with a socket handle.
fn bind_completion_callback(handle: NativeHandle) -> io::Result<()> {
    let rc = unsafe {
        BindIoCompletionCallback(handle as usize as HANDLE, Some(completion_routine), 0)
    };
    if rc == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Per-connection completion context.
///
/// `overlapped` must stay the first field: the OS hands the routine a
/// pointer to it, and the routine recovers the whole context by casting
/// that pointer back.
#[repr(C)]
pub(crate) struct IoContext {
    overlapped: OVERLAPPED,
    wsabuf: WSABUF,
    completed: AtomicBool,
    transferred: AtomicUsize,
    error: AtomicU32,
}

// The context is shared with the OS completion thread, which only ever
// touches the atomic slots between a posted receive and the matching
// completion observation.
unsafe impl Send for IoContext {}

impl IoContext {
    pub(crate) fn new() -> Box<IoContext> {
        Box::new(IoContext {
            overlapped: unsafe { std::mem::zeroed() },
            wsabuf: WSABUF {
                len: 0,
                buf: std::ptr::null_mut(),
            },
            completed: AtomicBool::new(false),
            transferred: AtomicUsize::new(0),
            error: AtomicU32::new(0),
        })
    }

    /// Whether a completion has been recorded and not yet consumed.
    pub(crate) fn peek_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Consumes a completion, if one has been recorded since the last call.
    /// Returns `(transferred_bytes, os_error_code)`.
    pub(crate) fn take_completion(&self) -> Option<(usize, u32)> {
        if !self.completed.swap(false, Ordering::Acquire) {
            return None;
        }
        Some((
            self.transferred.load(Ordering::Relaxed),
            self.error.load(Ordering::Relaxed),
        ))
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Posts the next overlapped receive into the spare region of `buf`.
///
/// The buffer must not grow or move while the receive is outstanding; the
/// reactor guarantees this by touching the read buffer only after
/// [`IoContext::take_completion`] observes the completion.
pub(crate) fn post_recv(
    handle: NativeHandle,
    buf: &mut IoBuffer,
    ctx: &mut IoContext,
) -> io::Result<()> {
    let spare = buf.spare_mut();
    let len = spare.len().min(MAX_BYTES_PER_READ);
    ctx.wsabuf = WSABUF {
        len: len as u32,
        buf: spare.as_mut_ptr(),
    };
    ctx.overlapped = unsafe { std::mem::zeroed() };

    let mut received: u32 = 0;
    let mut flags: u32 = 0;
    let rc = unsafe {
        WSARecv(
            handle as SOCKET,
            &ctx.wsabuf,
            1,
            &mut received,
            &mut flags,
            &mut ctx.overlapped,
            None,
        )
    };

    if rc == SOCKET_ERROR {
        let err = unsafe { WSAGetLastError() };
        if err != WSA_IO_PENDING {
            return Err(io::Error::from_raw_os_error(err));
        }
    }
    // Synchronous completion still queues the completion routine; the
    // result is observed on the next poll either way.
    trace!("posted receive: handle={} len={}", handle, len);
    Ok(())
}

/// The OS-invoked completion routine. Records the result and publishes it;
/// nothing else.
unsafe extern "system" fn completion_routine(
    error: u32,
    transferred: u32,
    overlapped: *mut OVERLAPPED,
) {
    if overlapped.is_null() {
        return;
    }
    let ctx = &*(overlapped as *const IoContext);
    ctx.error.store(error, Ordering::Relaxed);
    ctx.transferred.store(transferred as usize, Ordering::Relaxed);
    ctx.completed.store(true, Ordering::Release);
}
