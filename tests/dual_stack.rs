use std::cell::RefCell;
use std::net::{self, SocketAddr};
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

fn drive(reactor: &mut Reactor, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        reactor.poll();
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

/// Hosts without a usable IPv6 loopback can't run these tests.
fn ipv6_available() -> bool {
    net::TcpListener::bind("[::1]:0").is_ok()
}

#[test]
fn dual_stack_accepts_both_families() {
    drop(env_logger::try_init());
    if !ipv6_available() {
        eprintln!("skipping: no IPv6 loopback");
        return;
    }

    let mut server = t!(Reactor::new());
    let peers: Rc<RefCell<Vec<SocketAddr>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let peers = peers.clone();
        t!(server.listen(
            "::",
            0,
            StackMode::DualStack,
            move |conn| peers.borrow_mut().push(conn.remote_addr()),
            |_, _| {},
            |_, _| {},
        ));
    }
    let port = server.local_addr().unwrap().port();

    let v4 = t!(net::TcpStream::connect(("127.0.0.1", port)));
    let v6 = t!(net::TcpStream::connect(("::1", port)));

    assert!(drive(&mut server, || peers.borrow().len() == 2));

    let peers = peers.borrow();
    // The v4 peer arrives through the v6 socket as a v4-mapped address.
    let mapped = peers.iter().filter(|addr| match addr.ip() {
        net::IpAddr::V4(_) => true,
        net::IpAddr::V6(ip) => ip.to_ipv4_mapped().is_some(),
    });
    assert_eq!(mapped.count(), 1);
    assert!(peers
        .iter()
        .any(|addr| addr.ip() == net::IpAddr::V6(net::Ipv6Addr::LOCALHOST)));

    drop(v4);
    drop(v6);
}

#[test]
fn v6_only_serves_v6() {
    drop(env_logger::try_init());
    if !ipv6_available() {
        eprintln!("skipping: no IPv6 loopback");
        return;
    }

    let mut server = t!(Reactor::new());
    let peers: Rc<RefCell<Vec<SocketAddr>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let peers = peers.clone();
        t!(server.listen(
            "::1",
            0,
            StackMode::V6Only,
            move |conn| peers.borrow_mut().push(conn.remote_addr()),
            |_, _| {},
            |_, _| {},
        ));
    }
    let port = server.local_addr().unwrap().port();

    let v6 = t!(net::TcpStream::connect(("::1", port)));
    assert!(drive(&mut server, || peers.borrow().len() == 1));
    assert!(peers.borrow()[0].is_ipv6());

    // The v4 loopback has nothing bound on this port.
    assert!(net::TcpStream::connect_timeout(
        &SocketAddr::from(([127, 0, 0, 1], port)),
        Duration::from_millis(500),
    )
    .is_err());

    drop(v6);
}
