//! Per-platform multiplexer glue.
//!
//! Two backend families live here behind one surface. Unix targets use
//! readiness notification (`epoll` on Linux/Android, `kqueue` on the BSDs
//! and macOS): sockets are registered edge-triggered and the reactor drains
//! them until the OS reports would-block. Windows uses completion
//! notification: a receive is posted per connection and a completion
//! routine records the result for the next `poll` cycle to deliver.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use self::unix::{Event, Registrar, Selector};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use self::windows::{post_recv, IoContext, Registrar};

#[cfg(unix)]
use std::os::unix::io::RawFd;
#[cfg(windows)]
use std::os::windows::io::RawSocket;

/// The OS identity of a socket: a file descriptor on Unix, a `SOCKET` on
/// Windows.
#[cfg(unix)]
pub type NativeHandle = RawFd;

/// The OS identity of a socket: a file descriptor on Unix, a `SOCKET` on
/// Windows.
#[cfg(windows)]
pub type NativeHandle = RawSocket;

/// Largest backlog the OS accepts for `listen`.
#[cfg(unix)]
pub(crate) const LISTEN_BACKLOG: i32 = libc::SOMAXCONN;
#[cfg(windows)]
pub(crate) const LISTEN_BACKLOG: i32 = windows_sys::Win32::Networking::WinSock::SOMAXCONN as i32;

/// Prepares the process-wide socket environment.
///
/// Winsock requires `WSAStartup` before the first socket call; the first
/// reactor constructed triggers it, exactly once, and a startup failure
/// surfaces as an error from every reactor construction. The matching
/// cleanup is left to process exit. No-op on Unix.
pub(crate) fn init() -> std::io::Result<()> {
    #[cfg(windows)]
    return windows::init();
    #[cfg(unix)]
    return Ok(());
}

/// Flags for every send syscall. Linux raises `SIGPIPE` on sends to a
/// half-closed socket unless `MSG_NOSIGNAL` is passed; macOS handles this
/// via `SO_NOSIGPIPE` at socket creation instead.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) const SEND_FLAGS: i32 = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) const SEND_FLAGS: i32 = 0;
