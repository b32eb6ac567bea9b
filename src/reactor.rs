//! The event loop.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::cleaner::Cleaner;
use crate::config::CONNECT_TIMEOUT;
#[cfg(unix)]
use crate::config::{MAX_BYTES_PER_READ, MAX_EVENTS_PER_POLL};
use crate::conn::{handle_of, CloseReason, Connection};
use crate::listener::Listener;
use crate::sys::{self, NativeHandle};

#[cfg(windows)]
use crate::config::SHUTDOWN_DRAIN;

/// IPv4/IPv6 policy for a listening endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackMode {
    /// Accept IPv4 peers only. Requires an IPv4 literal.
    V4Only,
    /// Accept IPv6 peers only. Requires an IPv6 literal.
    V6Only,
    /// Accept both families on one IPv6 socket via v4-mapped addresses.
    /// Requires an IPv6 literal.
    DualStack,
}

/// Cloneable handle that requests a reactor shutdown from outside the
/// poll loop, e.g. a signal handler.
///
/// Requesting shutdown makes the next [`Reactor::poll`] a no-op; actual
/// teardown happens when the owner calls [`Reactor::shut`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Requests shutdown.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

type ConnectionCallback = Box<dyn FnMut(&mut Connection)>;
type DataCallback = Box<dyn FnMut(&mut Connection, &[u8])>;
type CloseCallback = Box<dyn FnMut(&mut Connection, &CloseReason)>;
type ListenerErrorCallback = Box<dyn FnMut(&io::Error)>;

#[derive(Default)]
struct Callbacks {
    on_connection: Option<ConnectionCallback>,
    on_data: Option<DataCallback>,
    on_close: Option<CloseCallback>,
    on_listener_error: Option<ListenerErrorCallback>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_connection", &self.on_connection.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_listener_error", &self.on_listener_error.is_some())
            .finish()
    }
}

/// The core reactor, or event loop.
///
/// One reactor multiplexes one optional listening socket plus any number
/// of stream connections, all on the thread that calls [`poll`]. Events
/// are dispatched to the callbacks installed by [`listen`] and
/// [`connect`]; connections scheduled for teardown are finalized at the
/// end of each `poll` cycle, which is when the close callback fires.
///
/// A reactor is single-threaded by construction: it is not `Send` and no
/// callback ever runs concurrently with another. Dropping a reactor
/// releases every OS resource it owns without delivering callbacks; call
/// [`shut`] first for an orderly teardown.
///
/// [`poll`]: Reactor::poll
/// [`listen`]: Reactor::listen
/// [`connect`]: Reactor::connect
/// [`shut`]: Reactor::shut
pub struct Reactor {
    #[cfg(unix)]
    selector: sys::Selector,
    /// Event records reused across poll cycles.
    #[cfg(unix)]
    events: Vec<sys::Event>,
    listener: Option<Listener>,
    conns: HashMap<NativeHandle, Box<Connection>>,
    cleaner: Rc<Cleaner>,
    callbacks: Callbacks,
    shutdown: Arc<AtomicBool>,
    closed: bool,
}

impl Reactor {
    /// Creates a reactor, initializing the process socket environment and
    /// the platform multiplexer.
    pub fn new() -> io::Result<Reactor> {
        sys::init()?;

        Ok(Reactor {
            #[cfg(unix)]
            selector: sys::Selector::new()?,
            #[cfg(unix)]
            events: Vec::with_capacity(MAX_EVENTS_PER_POLL),
            listener: None,
            conns: HashMap::new(),
            cleaner: Rc::new(Cleaner::new()),
            callbacks: Callbacks::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            closed: false,
        })
    }

    /// Starts listening on `address:port` and installs the server-side
    /// callbacks.
    ///
    /// `address` must be an IPv4 or IPv6 literal (wildcards `0.0.0.0` and
    /// `::` included) matching `mode`; dual-stack requires an IPv6 literal
    /// and clears `IPV6_V6ONLY` so v4-mapped peers are accepted.
    ///
    /// Fails with `InvalidInput` on a malformed literal or family/mode
    /// mismatch and with `AlreadyExists` if this reactor already listens;
    /// partially created resources are released on every failure path.
    pub fn listen<C, D, F>(
        &mut self,
        address: &str,
        port: u16,
        mode: StackMode,
        on_connection: C,
        on_data: D,
        on_close: F,
    ) -> io::Result<()>
    where
        C: FnMut(&mut Connection) + 'static,
        D: FnMut(&mut Connection, &[u8]) + 'static,
        F: FnMut(&mut Connection, &CloseReason) + 'static,
    {
        self.check_open()?;
        if self.listener.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "reactor is already listening",
            ));
        }

        let ip = parse_ip(address)?;
        let (domain, dual) = match (ip, mode) {
            (IpAddr::V4(_), StackMode::V4Only) => (Domain::IPV4, false),
            (IpAddr::V6(_), StackMode::V6Only) => (Domain::IPV6, false),
            (IpAddr::V6(_), StackMode::DualStack) => (Domain::IPV6, true),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "address family does not match stack mode",
                ))
            }
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if dual {
            socket.set_only_v6(false)?;
        }
        let requested = SocketAddr::new(ip, port);
        socket.bind(&SockAddr::from(requested))?;
        socket.listen(sys::LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;

        let local = socket
            .local_addr()?
            .as_socket()
            .unwrap_or(requested);
        let listener = Listener::new(socket, local);
        #[cfg(unix)]
        self.selector.registrar().register(listener.native_handle())?;

        debug!("listening on {} ({:?})", local, mode);
        self.listener = Some(listener);
        self.callbacks.on_connection = Some(Box::new(on_connection));
        self.callbacks.on_data = Some(Box::new(on_data));
        self.callbacks.on_close = Some(Box::new(on_close));
        Ok(())
    }

    /// Opens a client connection to `address:port`, waiting up to
    /// [`CONNECT_TIMEOUT`] for the connect to complete.
    ///
    /// The returned borrow is valid until the next call on this reactor;
    /// use [`Reactor::connection`] with the native handle to get it back
    /// later. The data and close callbacks are installed into the
    /// reactor's shared slots.
    ///
    /// On timeout or any connect failure the socket is released and the
    /// error returned; nothing is registered.
    ///
    /// [`CONNECT_TIMEOUT`]: crate::config::CONNECT_TIMEOUT
    pub fn connect<D, F>(
        &mut self,
        address: &str,
        port: u16,
        on_data: D,
        on_close: F,
    ) -> io::Result<&mut Connection>
    where
        D: FnMut(&mut Connection, &[u8]) + 'static,
        F: FnMut(&mut Connection, &CloseReason) + 'static,
    {
        self.check_open()?;

        let ip = parse_ip(address)?;
        let domain = match ip {
            IpAddr::V4(_) => Domain::IPV4,
            IpAddr::V6(_) => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        let peer = SocketAddr::new(ip, port);
        socket.connect_timeout(&SockAddr::from(peer), CONNECT_TIMEOUT)?;
        socket.set_nonblocking(true)?;

        let handle = handle_of(&socket);
        self.finalize_stale(handle);
        self.registrar().register(handle)?;

        let conn = Box::new(Connection::new(
            socket,
            peer,
            self.registrar(),
            Rc::clone(&self.cleaner),
        ));
        debug!("connected to {}", peer);
        self.conns.insert(handle, conn);
        #[cfg(windows)]
        if let Some(conn) = self.conns.get_mut(&handle) {
            conn.post_receive();
        }

        self.callbacks.on_data = Some(Box::new(on_data));
        self.callbacks.on_close = Some(Box::new(on_close));

        match self.conns.get_mut(&handle) {
            Some(conn) => Ok(&mut **conn),
            // Unreachable in practice: the entry was just inserted.
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Installs the callback fired when the listening socket becomes
    /// unusable.
    pub fn set_listener_error_callback<F>(&mut self, on_error: F)
    where
        F: FnMut(&io::Error) + 'static,
    {
        self.callbacks.on_listener_error = Some(Box::new(on_error));
    }

    /// Re-borrows a tracked connection by native handle.
    pub fn connection(&mut self, handle: NativeHandle) -> Option<&mut Connection> {
        self.conns.get_mut(&handle).map(|conn| &mut **conn)
    }

    /// Number of connections currently tracked, including ones whose close
    /// callback has not fired yet.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Local address of the listening socket, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr())
    }

    /// Runs one non-blocking event-loop cycle: drive the multiplexer,
    /// dispatch per-connection events, then finalize connections scheduled
    /// for teardown (their close callbacks fire here).
    ///
    /// A no-op once shutdown has been requested or [`shut`] has run.
    ///
    /// [`shut`]: Reactor::shut
    pub fn poll(&mut self) {
        if self.closed || self.is_shutdown_requested() {
            return;
        }

        #[cfg(unix)]
        self.poll_readiness();
        #[cfg(windows)]
        self.poll_completion();

        self.drain_cleaner();
    }

    /// Tears the reactor down synchronously: closes the listener and every
    /// connection, delivers each pending close callback exactly once,
    /// then closes the multiplexer and clears the callback slots.
    ///
    /// Subsequent `poll` calls are no-ops.
    pub fn shut(&mut self) {
        if self.closed {
            return;
        }
        debug!("reactor shutting down");

        if let Some(listener) = self.listener.as_mut() {
            listener.close(None);
        }
        for conn in self.conns.values_mut() {
            conn.user_close();
        }

        // Give in-flight overlapped receives time to complete before the
        // buffers they point into are destroyed.
        #[cfg(windows)]
        std::thread::sleep(SHUTDOWN_DRAIN);

        self.drain_cleaner();
        self.conns.clear();
        self.cleaner.clear();
        #[cfg(unix)]
        self.selector.close();
        self.listener = None;
        self.callbacks = Callbacks::default();
        self.closed = true;
    }

    /// Requests shutdown: the next `poll` observes the flag and becomes a
    /// no-op. Call [`shut`](Reactor::shut) for the actual teardown.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// A cloneable handle for requesting shutdown from outside the owner,
    /// e.g. a signal handler.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            flag: Arc::clone(&self.shutdown),
        }
    }

    // ===== event dispatch =====

    #[cfg(unix)]
    fn poll_readiness(&mut self) {
        let mut events = mem::take(&mut self.events);
        events.clear();

        if let Err(e) = self.selector.select(&mut events) {
            debug!("multiplexer sweep failed: {}", e);
            self.events = events;
            return;
        }

        for ev in &events {
            trace!("event {:?}", ev);
            let is_listener =
                self.listener.as_ref().map(Listener::native_handle) == Some(ev.handle);
            if is_listener {
                self.listener_event(ev);
            } else {
                self.connection_event(ev);
            }
        }

        self.events = events;
    }

    /// Completion-backend cycle: accept is polled directly (the listener
    /// has no readiness source), spooled writes are drained once per
    /// cycle, and each connection whose receive completed has its bytes
    /// delivered before the next receive is posted.
    #[cfg(windows)]
    fn poll_completion(&mut self) {
        self.accept_loop();

        let handles: Vec<NativeHandle> = self.conns.keys().copied().collect();
        for handle in handles {
            if let Some(conn) = self.conns.get_mut(&handle) {
                conn.flush_outgoing();
            }

            let completion = self
                .conns
                .get_mut(&handle)
                .and_then(|conn| conn.take_completion());
            let Some((n, code)) = completion else { continue };

            let Some(conn) = self.conns.get_mut(&handle) else {
                continue;
            };
            let conn = &mut **conn;
            if !conn.is_valid() {
                // Completion of a receive aborted by an earlier close;
                // the cleaner finalizes the connection this cycle.
                continue;
            }
            if code != 0 {
                conn.close_on_error(io::Error::from_raw_os_error(code as i32));
                continue;
            }
            if n == 0 {
                conn.close_peer();
                continue;
            }

            conn.read_buf.advance_written(n);
            trace!("connection {} received {} bytes", handle, n);
            if let Some(cb) = self.callbacks.on_data.as_mut() {
                let buf = mem::take(&mut conn.read_buf);
                cb(conn, buf.unconsumed_bytes());
                conn.read_buf = buf;
            }
            conn.read_buf.clear();
            conn.post_receive();
        }
    }

    #[cfg(unix)]
    fn listener_event(&mut self, ev: &sys::Event) {
        if ev.error || ev.hangup {
            let err = self
                .listener
                .as_ref()
                .and_then(Listener::take_socket_error)
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "listener failed"));
            self.fail_listener(err);
            return;
        }

        if ev.readable {
            self.accept_loop();
        }
    }

    /// Per-connection state machine for one readiness report.
    #[cfg(unix)]
    fn connection_event(&mut self, ev: &sys::Event) {
        if ev.writable {
            let Some(conn) = self.conns.get_mut(&ev.handle) else {
                return;
            };
            conn.flush_outgoing();
            if !conn.is_valid() {
                // Close is scheduled; the cleaner finalizes it this cycle.
                return;
            }
        }

        if ev.readable || ev.hangup {
            // The read routine observes the close itself: zero-byte
            // receive for an orderly shutdown, an error otherwise.
            self.read_ready(ev.handle);
        } else if ev.error {
            let Some(conn) = self.conns.get_mut(&ev.handle) else {
                return;
            };
            let err = conn
                .take_socket_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error"));
            conn.close_on_error(err);
        } else if ev.peer_hangup {
            if let Some(conn) = self.conns.get_mut(&ev.handle) {
                conn.close_peer();
            }
        }
    }

    /// Edge-triggered accept: accepts until the OS reports would-block or
    /// the listener dies.
    fn accept_loop(&mut self) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(listener) if listener.is_valid() => listener.accept(),
                _ => return,
            };

            match accepted {
                Ok((socket, addr)) => self.admit(socket, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail_listener(e);
                    return;
                }
            }
        }
    }

    /// Registers a freshly accepted socket and announces it. A socket that
    /// fails setup or registration is dropped without ever joining the
    /// table, so no close callback is owed for it.
    fn admit(&mut self, socket: Socket, addr: SockAddr) {
        if let Err(e) = socket.set_nonblocking(true) {
            debug!("dropping accepted socket: {}", e);
            return;
        }
        let Some(peer) = addr.as_socket() else {
            debug!("dropping accepted socket: non-IP peer address");
            return;
        };

        let handle = handle_of(&socket);
        self.finalize_stale(handle);
        if let Err(e) = self.registrar().register(handle) {
            debug!("dropping accepted socket: registration failed: {}", e);
            return;
        }

        let conn = Box::new(Connection::new(
            socket,
            peer,
            self.registrar(),
            Rc::clone(&self.cleaner),
        ));
        debug!("accepted connection {} from {}", handle, peer);
        self.conns.insert(handle, conn);
        #[cfg(windows)]
        if let Some(conn) = self.conns.get_mut(&handle) {
            conn.post_receive();
        }

        if let Some(cb) = self.callbacks.on_connection.as_mut() {
            if let Some(conn) = self.conns.get_mut(&handle) {
                cb(conn);
            }
        }
    }

    /// Edge-triggered read routine: receives until would-block, delivering
    /// at most one data callback per successful receive. The callback sees
    /// a view of exactly the new bytes; the buffer is cleared afterwards.
    #[cfg(unix)]
    fn read_ready(&mut self, handle: NativeHandle) {
        let Some(conn) = self.conns.get_mut(&handle) else {
            return;
        };
        let conn = &mut **conn;
        let callbacks = &mut self.callbacks;

        loop {
            if !conn.is_valid() {
                return;
            }
            if conn.read_buf.writable() == 0 {
                conn.read_buf.ensure_writable(MAX_BYTES_PER_READ);
            }

            match conn.recv_some() {
                Ok(0) => {
                    conn.close_peer();
                    return;
                }
                Ok(n) => {
                    trace!("connection {} received {} bytes", handle, n);
                    if let Some(cb) = callbacks.on_data.as_mut() {
                        // The buffer is lent out so the callback can hold
                        // both the connection and the received view.
                        let buf = mem::take(&mut conn.read_buf);
                        cb(conn, buf.unconsumed_bytes());
                        conn.read_buf = buf;
                    }
                    conn.read_buf.clear();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    conn.close_on_error(e);
                    return;
                }
            }
        }
    }

    fn fail_listener(&mut self, err: io::Error) {
        debug!("listener error: {}", err);
        if let Some(cb) = self.callbacks.on_listener_error.as_mut() {
            cb(&err);
        }
        if let Some(listener) = self.listener.as_mut() {
            listener.close(Some(err));
        }
    }

    /// Finalizes every connection scheduled for teardown: the close
    /// callback fires exactly once, then the connection is destroyed.
    /// Handles scheduled by these callbacks surface on the next drain.
    fn drain_cleaner(&mut self) {
        for handle in self.cleaner.take() {
            // A closed connection with a receive still in flight must
            // survive until the completion routine has run; retry on the
            // next cycle.
            #[cfg(windows)]
            if self
                .conns
                .get(&handle)
                .map_or(false, |conn| conn.io_in_flight())
            {
                self.cleaner.schedule(handle);
                continue;
            }

            let Some(mut conn) = self.conns.remove(&handle) else {
                continue;
            };
            let reason = conn.take_close_reason();
            trace!("finalizing connection {} ({:?})", handle, reason);
            if let Some(cb) = self.callbacks.on_close.as_mut() {
                cb(&mut conn, &reason);
            }
            // Destroyed here, after its close callback returned.
        }
    }

    /// Delivers the close callback for a dead table entry whose handle the
    /// OS recycled before the scheduled drain could run.
    fn finalize_stale(&mut self, handle: NativeHandle) {
        let Some(mut conn) = self.conns.remove(&handle) else {
            return;
        };
        self.cleaner.unschedule(handle);
        let reason = conn.take_close_reason();
        trace!("finalizing recycled handle {} ({:?})", handle, reason);
        if let Some(cb) = self.callbacks.on_close.as_mut() {
            cb(&mut conn, &reason);
        }
    }

    fn registrar(&self) -> sys::Registrar {
        #[cfg(unix)]
        return self.selector.registrar();
        #[cfg(windows)]
        return sys::Registrar;
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "reactor has been shut down",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("listening", &self.listener.is_some())
            .field("connections", &self.conns.len())
            .field("callbacks", &self.callbacks)
            .field("shutdown_requested", &self.is_shutdown_requested())
            .field("closed", &self.closed)
            .finish()
    }
}

fn parse_ip(address: &str) -> io::Result<IpAddr> {
    address.parse::<IpAddr>().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("`{}` is not an IP literal", address),
        )
    })
}
