//! The accepting socket.

use std::io;
use std::net::SocketAddr;

use log::trace;
use socket2::{SockAddr, Socket};

use crate::conn::handle_of;
use crate::sys::NativeHandle;

/// The reactor's accepting socket.
///
/// A listener carries no buffers; it only accepts. It keeps its own error
/// slot because listener failures arrive asynchronously and are terminal:
/// once the listener closes, the reactor stops accepting for good.
#[derive(Debug)]
pub(crate) struct Listener {
    socket: Option<Socket>,
    handle: NativeHandle,
    local: SocketAddr,
    err: Option<io::Error>,
}

impl Listener {
    /// Wraps an already-bound, already-listening, non-blocking socket.
    pub(crate) fn new(socket: Socket, local: SocketAddr) -> Listener {
        let handle = handle_of(&socket);
        Listener {
            socket: Some(socket),
            handle,
            local,
            err: None,
        }
    }

    pub(crate) fn native_handle(&self) -> NativeHandle {
        self.handle
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.socket.is_some() && self.err.is_none()
    }

    /// One non-blocking accept. `WouldBlock` means the backlog is drained.
    pub(crate) fn accept(&self) -> io::Result<(Socket, SockAddr)> {
        match self.socket.as_ref() {
            Some(sock) => sock.accept(),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Pending OS error on the listening socket.
    pub(crate) fn take_socket_error(&self) -> Option<io::Error> {
        self.socket
            .as_ref()
            .and_then(|sock| sock.take_error().ok().flatten())
    }

    /// Closes the listening socket, recording the error that caused it.
    /// Terminal: accepting cannot be re-enabled on this listener.
    pub(crate) fn close(&mut self, err: Option<io::Error>) {
        if let Some(sock) = self.socket.take() {
            trace!("listener {} closed", self.handle);
            drop(sock);
        }
        if self.err.is_none() {
            self.err = err;
        }
    }
}
