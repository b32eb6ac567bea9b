//! Readiness backend shared surface.
//!
//! `Selector` owns the multiplexer handle and fills a caller-supplied event
//! list on each non-blocking sweep. `Registrar` is a copyable, non-owning
//! view of the multiplexer that connections use to arm and un-arm write
//! interest from inside their own send paths.

use super::NativeHandle;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use self::epoll::{Registrar, Selector};

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
pub(crate) use self::kqueue::{Registrar, Selector};

/// One readiness report for one handle, decoded out of the backend's native
/// event record.
///
/// `error`, `hangup`, and `peer_hangup` may co-occur with `readable`; the
/// dispatch order is the reactor's concern, not the backend's.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub(crate) handle: NativeHandle,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) error: bool,
    pub(crate) hangup: bool,
    pub(crate) peer_hangup: bool,
}
