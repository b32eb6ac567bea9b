//! Compile-time tunables for the reactor.
//!
//! These mirror the knobs most deployments end up caring about: how large
//! the per-connection buffers start out, how much data a single syscall is
//! allowed to move, and how long the synchronous paths may wait.

use std::time::Duration;

/// Starting capacity of a connection's read buffer, in bytes.
pub const INITIAL_READ_BUF: usize = 4096;

/// Starting capacity of a connection's write buffer, in bytes.
pub const INITIAL_WRITE_BUF: usize = 4096;

/// Upper bound on the number of bytes moved by one receive syscall.
pub const MAX_BYTES_PER_READ: usize = 2048;

/// Upper bound on the number of bytes moved by one send syscall.
pub const MAX_BYTES_PER_WRITE: usize = 2048;

/// Maximum number of multiplexer events drained per `poll` cycle.
pub const MAX_EVENTS_PER_POLL: usize = 64;

/// How long [`Reactor::connect`] waits for the socket to become writable.
///
/// [`Reactor::connect`]: crate::Reactor::connect
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long [`Reactor::shut`] sleeps to let in-flight completion-backend
/// I/O terminate before connections are torn down. Only the completion
/// backend has in-flight I/O to wait for.
///
/// [`Reactor::shut`]: crate::Reactor::shut
pub const SHUTDOWN_DRAIN: Duration = Duration::from_millis(100);
