use std::cell::{Cell, RefCell};
use std::net;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use netloop::{Reactor, StackMode};

macro_rules! t {
    ($e:expr) => {
        match $e {
            Ok(e) => e,
            Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
        }
    };
}

/// Polls every reactor until `done` reports true or five seconds elapse.
fn drive(reactors: &mut [&mut Reactor], mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        for reactor in reactors.iter_mut() {
            reactor.poll();
        }
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn echo_roundtrip() {
    drop(env_logger::try_init());

    let mut server = t!(Reactor::new());
    let server_rx = Rc::new(RefCell::new(Vec::new()));
    let server_close_peer = Rc::new(Cell::new(false));
    {
        let server_rx = server_rx.clone();
        let server_close_peer = server_close_peer.clone();
        t!(server.listen(
            "0.0.0.0",
            0,
            StackMode::V4Only,
            |_conn| {},
            move |conn, data| {
                server_rx.borrow_mut().extend_from_slice(data);
                t!(conn.write(b"welcome"));
            },
            move |_conn, reason| {
                server_close_peer.set(reason.is_peer());
            },
        ));
    }
    let port = server.local_addr().unwrap().port();

    let mut client = t!(Reactor::new());
    let client_rx = Rc::new(RefCell::new(Vec::new()));
    let client_close_local = Rc::new(Cell::new(false));
    let handle = {
        let client_rx = client_rx.clone();
        let client_close_local = client_close_local.clone();
        let conn = t!(client.connect(
            "127.0.0.1",
            port,
            move |_conn, data| {
                client_rx.borrow_mut().extend_from_slice(data);
            },
            move |_conn, reason| {
                client_close_local.set(reason.is_local());
            },
        ));
        assert_eq!(t!(conn.write(b"hello world")), 11);
        conn.native_handle()
    };

    assert!(drive(&mut [&mut server, &mut client], || {
        server_rx.borrow().len() == 11 && client_rx.borrow().len() == 7
    }));
    assert_eq!(&server_rx.borrow()[..], b"hello world");
    assert_eq!(&client_rx.borrow()[..], b"welcome");

    client.connection(handle).unwrap().user_close();
    assert!(drive(&mut [&mut server, &mut client], || {
        server_close_peer.get() && client_close_local.get()
    }));
    assert_eq!(client.connection_count(), 0);
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn invalid_address_then_valid() {
    drop(env_logger::try_init());

    let mut reactor = t!(Reactor::new());
    let err = reactor
        .listen(
            "not-an-ip",
            1234,
            StackMode::V4Only,
            |_| {},
            |_, _| {},
            |_, _| {},
        )
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    assert!(reactor.local_addr().is_none());

    // A failed attempt leaves no listener behind.
    t!(reactor.listen(
        "127.0.0.1",
        0,
        StackMode::V4Only,
        |_| {},
        |_, _| {},
        |_, _| {},
    ));
    assert!(reactor.local_addr().is_some());
}

#[test]
fn stack_mode_mismatch_is_rejected() {
    drop(env_logger::try_init());

    let mut reactor = t!(Reactor::new());
    for (addr, mode) in [
        ("127.0.0.1", StackMode::V6Only),
        ("127.0.0.1", StackMode::DualStack),
        ("::1", StackMode::V4Only),
    ] {
        let err = reactor
            .listen(addr, 0, mode, |_| {}, |_, _| {}, |_, _| {})
            .unwrap_err();
        assert_eq!(
            err.kind(),
            std::io::ErrorKind::InvalidInput,
            "{} {:?}",
            addr,
            mode
        );
    }
}

#[test]
fn second_listen_fails() {
    drop(env_logger::try_init());

    let mut reactor = t!(Reactor::new());
    t!(reactor.listen(
        "127.0.0.1",
        0,
        StackMode::V4Only,
        |_| {},
        |_, _| {},
        |_, _| {},
    ));
    let err = reactor
        .listen(
            "127.0.0.1",
            0,
            StackMode::V4Only,
            |_| {},
            |_, _| {},
            |_, _| {},
        )
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
}

#[test]
fn connect_to_refused_port_fails() {
    drop(env_logger::try_init());

    // Bind and immediately drop to find a port nothing listens on.
    let port = {
        let srv = t!(net::TcpListener::bind("127.0.0.1:0"));
        t!(srv.local_addr()).port()
    };

    let mut reactor = t!(Reactor::new());
    assert!(reactor
        .connect("127.0.0.1", port, |_, _| {}, |_, _| {})
        .is_err());
    assert_eq!(reactor.connection_count(), 0);
}

#[test]
fn user_close_is_idempotent_and_fires_once() {
    drop(env_logger::try_init());

    let srv = t!(net::TcpListener::bind("127.0.0.1:0"));
    let port = t!(srv.local_addr()).port();
    let accepted = thread::spawn(move || t!(srv.accept()).0);

    let mut reactor = t!(Reactor::new());
    let closes = Rc::new(Cell::new(0usize));
    let handle = {
        let closes = closes.clone();
        let conn = t!(reactor.connect(
            "127.0.0.1",
            port,
            |_, _| {},
            move |_conn, reason| {
                assert!(reason.is_local());
                closes.set(closes.get() + 1);
            },
        ));
        conn.user_close();
        conn.user_close();
        assert!(!conn.is_valid());
        conn.native_handle()
    };
    let _peer = accepted.join().unwrap();

    reactor.poll();
    assert_eq!(closes.get(), 1);
    assert!(reactor.connection(handle).is_none());

    // Close already delivered; nothing further may fire.
    for _ in 0..10 {
        reactor.poll();
    }
    assert_eq!(closes.get(), 1);
    assert_eq!(reactor.connection_count(), 0);
}

#[test]
fn write_on_closed_connection_fails() {
    drop(env_logger::try_init());

    let srv = t!(net::TcpListener::bind("127.0.0.1:0"));
    let port = t!(srv.local_addr()).port();
    let accepted = thread::spawn(move || t!(srv.accept()).0);

    let mut reactor = t!(Reactor::new());
    let conn = t!(reactor.connect("127.0.0.1", port, |_, _| {}, |_, _| {}));
    assert_eq!(t!(conn.write(&[])), 0);
    conn.user_close();
    let err = conn.write(b"late").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
    let _peer = accepted.join().unwrap();
}

#[test]
fn peer_reset_reports_error() {
    drop(env_logger::try_init());

    let mut server = t!(Reactor::new());
    let accepted = Rc::new(Cell::new(false));
    let close_err = Rc::new(Cell::new(false));
    {
        let accepted = accepted.clone();
        let close_err = close_err.clone();
        t!(server.listen(
            "127.0.0.1",
            0,
            StackMode::V4Only,
            move |_conn| accepted.set(true),
            |_, _| {},
            move |_conn, reason| close_err.set(reason.as_error().is_some()),
        ));
    }
    let addr = server.local_addr().unwrap();

    let sock = t!(socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    ));
    t!(sock.connect(&addr.into()));
    assert!(drive(&mut [&mut server], || accepted.get()));

    // Zero linger turns the close into an abortive RST.
    t!(sock.set_linger(Some(Duration::from_secs(0))));
    drop(sock);

    assert!(drive(&mut [&mut server], || close_err.get()));
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn idle_polling_has_no_side_effects() {
    drop(env_logger::try_init());

    let mut reactor = t!(Reactor::new());
    t!(reactor.listen(
        "127.0.0.1",
        0,
        StackMode::V4Only,
        |_| {},
        |_, _| {},
        |_, _| {},
    ));

    for _ in 0..50 {
        reactor.poll();
    }
    assert_eq!(reactor.connection_count(), 0);
    assert!(!reactor.is_shutdown_requested());
}
