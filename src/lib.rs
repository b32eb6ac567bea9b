#![deny(missing_docs, missing_debug_implementations)]

//! Single-threaded, callback-driven TCP reactor.
//!
//! A [`Reactor`] multiplexes many non-blocking stream connections on the
//! one thread that drives [`Reactor::poll`], dispatching accept, data,
//! close, and listener-error events to user-supplied callbacks. It is a
//! building block for application-level servers and clients, not an
//! application protocol: there is no framing, no TLS, and no name
//! resolution. Addresses are IP literals.
//!
//! The crate provides:
//!
//! * [`Reactor`], the event loop: `listen`, `connect`, `poll`, `shut`.
//!
//! * [`Connection`], the per-socket object handed to callbacks: `write`,
//!   `user_close`, `remote_addr`.
//!
//! * [`CloseReason`], distinguishing local close, orderly peer close, and
//!   OS errors in the close callback.
//!
//! Two multiplexer families back the same contract: readiness
//! notification on Unix (epoll on Linux, kqueue on macOS and the BSDs,
//! both edge-triggered) and completion callbacks on Windows. Either way,
//! callbacks run inline on the polling thread, data callbacks arrive in
//! receive order, and a connection's close callback is its terminal
//! event.
//!
//! # Example
//!
//! ```no_run
//! use netloop::{Reactor, StackMode};
//!
//! fn main() -> std::io::Result<()> {
//!     let mut reactor = Reactor::new()?;
//!     reactor.listen(
//!         "0.0.0.0",
//!         6890,
//!         StackMode::V4Only,
//!         |conn| println!("peer {} connected", conn.remote_addr()),
//!         |conn, data| {
//!             let _ = conn.write(data);
//!         },
//!         |conn, reason| println!("peer {} left: {:?}", conn.remote_addr(), reason),
//!     )?;
//!
//!     loop {
//!         reactor.poll();
//!         std::thread::sleep(std::time::Duration::from_millis(1));
//!     }
//! }
//! ```

mod buffer;
mod cleaner;
pub mod config;
mod conn;
mod listener;
mod reactor;
mod sys;

pub use self::buffer::IoBuffer;
pub use self::conn::{CloseReason, Connection};
pub use self::reactor::{Reactor, ShutdownSignal, StackMode};
pub use self::sys::NativeHandle;
