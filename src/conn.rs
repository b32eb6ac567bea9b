//! Per-socket connection state.

use std::io;
#[cfg(unix)]
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::rc::Rc;

use log::trace;
use socket2::Socket;

use crate::buffer::IoBuffer;
use crate::cleaner::Cleaner;
use crate::config::{INITIAL_READ_BUF, INITIAL_WRITE_BUF, MAX_BYTES_PER_WRITE};
use crate::sys::{self, NativeHandle};

/// Why a connection's close callback fired.
#[derive(Debug)]
pub enum CloseReason {
    /// [`Connection::user_close`] was called, or the reactor was shut down
    /// by its owner.
    Local,
    /// The peer closed the connection in an orderly fashion.
    Peer,
    /// An OS-level error terminated the connection.
    Error(io::Error),
}

impl CloseReason {
    /// True for [`CloseReason::Local`].
    pub fn is_local(&self) -> bool {
        matches!(self, CloseReason::Local)
    }

    /// True for [`CloseReason::Peer`].
    pub fn is_peer(&self) -> bool {
        matches!(self, CloseReason::Peer)
    }

    /// The OS error, if this close was caused by one.
    pub fn as_error(&self) -> Option<&io::Error> {
        match self {
            CloseReason::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// One multiplexed stream connection.
///
/// Connections are owned by the [`Reactor`]; user code only ever borrows
/// one, inside a callback or through [`Reactor::connection`], and the
/// borrow is valid for at most the duration of that call. After the close
/// callback returns the connection is destroyed.
///
/// [`Reactor`]: crate::Reactor
/// [`Reactor::connection`]: crate::Reactor::connection
#[derive(Debug)]
pub struct Connection {
    /// `None` once the OS handle has been closed.
    socket: Option<Socket>,
    /// Retained past close so the cleaner can still identify the entry.
    handle: NativeHandle,
    peer: SocketAddr,
    pub(crate) read_buf: IoBuffer,
    write_buf: IoBuffer,
    err: Option<io::Error>,
    user_closed: bool,
    registrar: sys::Registrar,
    cleaner: Rc<Cleaner>,
    #[cfg(windows)]
    io: Box<sys::IoContext>,
    /// A receive has been posted and its completion not yet consumed. The
    /// connection must outlive the posted I/O, so finalization waits for
    /// the completion routine while this is set.
    #[cfg(windows)]
    recv_pending: bool,
}

impl Connection {
    pub(crate) fn new(
        socket: Socket,
        peer: SocketAddr,
        registrar: sys::Registrar,
        cleaner: Rc<Cleaner>,
    ) -> Connection {
        let handle = handle_of(&socket);
        Connection {
            socket: Some(socket),
            handle,
            peer,
            read_buf: IoBuffer::with_capacity(INITIAL_READ_BUF),
            write_buf: IoBuffer::with_capacity(INITIAL_WRITE_BUF),
            err: None,
            user_closed: false,
            registrar,
            cleaner,
            #[cfg(windows)]
            io: sys::IoContext::new(),
            #[cfg(windows)]
            recv_pending: false,
        }
    }

    /// The OS identity of the underlying socket.
    pub fn native_handle(&self) -> NativeHandle {
        self.handle
    }

    /// The peer's address, as captured at accept or connect time.
    pub fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the connection can still carry traffic: the handle is open,
    /// no error has been recorded, and the user has not closed it.
    pub fn is_valid(&self) -> bool {
        self.socket.is_some() && self.err.is_none() && !self.user_closed
    }

    /// Closes the connection locally.
    ///
    /// The OS handle is closed immediately and the close callback is
    /// delivered with [`CloseReason::Local`] on the next `poll` cycle.
    /// Subsequent calls are no-ops.
    pub fn user_close(&mut self) {
        if self.user_closed || self.socket.is_none() {
            return;
        }
        self.user_closed = true;
        self.release_socket();
        self.cleaner.schedule(self.handle);
        trace!("connection {} closed locally", self.handle);
    }

    /// Queues `data` for transmission, sending as much as possible
    /// directly.
    ///
    /// Returns the number of bytes accepted, which is `data.len()` even
    /// when part of it was only spooled: spooled bytes are drained by the
    /// reactor as the socket becomes writable, in FIFO order with respect
    /// to later `write` calls.
    ///
    /// An invalid connection yields `ErrorKind::NotConnected`. A fatal
    /// send error closes the connection (the close callback carries the
    /// error) and is also returned here.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if !self.is_valid() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closed",
            ));
        }
        if data.is_empty() {
            return Ok(0);
        }

        // Earlier bytes are still spooled; keep FIFO order by appending.
        if self.write_buf.unconsumed() > 0 {
            self.write_buf.append(data);
            return Ok(data.len());
        }

        let mut sent = 0;
        while sent < data.len() {
            let end = data.len().min(sent + MAX_BYTES_PER_WRITE);
            match self.send_chunk(&data[sent..end]) {
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.write_buf.append(&data[sent..]);
                    trace!(
                        "connection {} spooled {} bytes, arming writability",
                        self.handle,
                        data.len() - sent
                    );
                    if let Err(arm_err) = self.registrar.arm_writable(self.handle) {
                        let ret = duplicate(&arm_err);
                        self.close_on_error(arm_err);
                        return Err(ret);
                    }
                    return Ok(data.len());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let ret = duplicate(&e);
                    self.close_on_error(e);
                    return Err(ret);
                }
            }
        }

        Ok(sent)
    }

    /// Drains spooled bytes after a writability event (readiness backends)
    /// or once per `poll` cycle (completion backend). Un-arms writability
    /// once the spool is empty.
    pub(crate) fn flush_outgoing(&mut self) {
        if !self.is_valid() || self.write_buf.unconsumed() == 0 {
            return;
        }

        loop {
            let sent = {
                let pending = self.write_buf.unconsumed_bytes();
                if pending.is_empty() {
                    break;
                }
                let chunk = &pending[..pending.len().min(MAX_BYTES_PER_WRITE)];
                self.send_chunk(chunk)
            };

            match sent {
                Ok(n) => self.write_buf.advance_consumed(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close_on_error(e);
                    return;
                }
            }
        }

        self.write_buf.clear();
        trace!("connection {} drained, disarming writability", self.handle);
        if let Err(e) = self.registrar.disarm_writable(self.handle) {
            self.close_on_error(e);
        }
    }

    /// One bounded receive into the read buffer. `Ok(0)` is an orderly
    /// peer close.
    #[cfg(unix)]
    pub(crate) fn recv_some(&mut self) -> io::Result<usize> {
        use crate::config::MAX_BYTES_PER_READ;

        let sock = match self.socket.as_ref() {
            Some(sock) => sock,
            None => return Err(io::ErrorKind::NotConnected.into()),
        };

        let spare = self.read_buf.spare_mut();
        let len = spare.len().min(MAX_BYTES_PER_READ);
        // The region is zero-initialized storage; viewing it as
        // MaybeUninit for the recv call is sound.
        let uninit =
            unsafe { &mut *(&mut spare[..len] as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let n = sock.recv(uninit)?;
        self.read_buf.advance_written(n);
        Ok(n)
    }

    /// Posts the next overlapped receive, closing the connection if the
    /// post itself fails.
    #[cfg(windows)]
    pub(crate) fn post_receive(&mut self) {
        use crate::config::MAX_BYTES_PER_READ;

        if !self.is_valid() {
            return;
        }
        if self.read_buf.writable() == 0 {
            self.read_buf.ensure_writable(MAX_BYTES_PER_READ);
        }
        match sys::post_recv(self.handle, &mut self.read_buf, &mut self.io) {
            Ok(()) => self.recv_pending = true,
            // A synchronous failure queues no completion.
            Err(e) => self.close_on_error(e),
        }
    }

    /// Consumes the pending completion record, if any. The caller owns
    /// delivery; the posted-receive slot is free again afterwards.
    #[cfg(windows)]
    pub(crate) fn take_completion(&mut self) -> Option<(usize, u32)> {
        let completion = self.io.take_completion();
        if completion.is_some() {
            self.recv_pending = false;
        }
        completion
    }

    /// True while a posted receive has not completed yet. The completion
    /// routine will still write into this connection's context, so it
    /// cannot be destroyed.
    #[cfg(windows)]
    pub(crate) fn io_in_flight(&self) -> bool {
        self.recv_pending && !self.io.peek_completed()
    }

    /// Pending OS error on the socket, drained via `SO_ERROR`.
    pub(crate) fn take_socket_error(&self) -> Option<io::Error> {
        self.socket
            .as_ref()
            .and_then(|sock| sock.take_error().ok().flatten())
    }

    /// Closes after an orderly peer shutdown. The error slot stays empty,
    /// so the close callback reports [`CloseReason::Peer`].
    pub(crate) fn close_peer(&mut self) {
        if !self.is_valid() {
            return;
        }
        self.release_socket();
        self.cleaner.schedule(self.handle);
        trace!("connection {} closed by peer", self.handle);
    }

    /// Closes with a fatal OS error. The close callback reports
    /// [`CloseReason::Error`].
    pub(crate) fn close_on_error(&mut self, err: io::Error) {
        if !self.is_valid() {
            return;
        }
        self.release_socket();
        trace!("connection {} closed on error: {}", self.handle, err);
        self.err = Some(err);
        self.cleaner.schedule(self.handle);
    }

    /// Builds the reason the close callback will observe. Consumes the
    /// error slot.
    pub(crate) fn take_close_reason(&mut self) -> CloseReason {
        if self.user_closed {
            CloseReason::Local
        } else if let Some(err) = self.err.take() {
            CloseReason::Error(err)
        } else {
            CloseReason::Peer
        }
    }

    fn send_chunk(&self, chunk: &[u8]) -> io::Result<usize> {
        match self.socket.as_ref() {
            Some(sock) => sock.send_with_flags(chunk, sys::SEND_FLAGS),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Deregisters from the multiplexer, then closes the OS handle by
    /// dropping the socket.
    fn release_socket(&mut self) {
        if let Some(sock) = self.socket.take() {
            let _ = self.registrar.deregister(self.handle);
            drop(sock);
        }
    }
}

/// Clones the externally visible face of an I/O error so it can both be
/// recorded in the connection's error slot and returned to the caller.
fn duplicate(e: &io::Error) -> io::Error {
    match e.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(e.kind(), e.to_string()),
    }
}

pub(crate) fn handle_of(socket: &Socket) -> NativeHandle {
    #[cfg(unix)]
    use std::os::unix::io::AsRawFd;
    #[cfg(windows)]
    use std::os::windows::io::AsRawSocket;

    #[cfg(unix)]
    return socket.as_raw_fd();
    #[cfg(windows)]
    return socket.as_raw_socket();
}
