use std::io::Read;
use std::net;
use std::sync::mpsc::channel;
use std::thread;
use std::time::{Duration, Instant};

use netloop::Reactor;

macro_rules! t {
    ($e:expr) => {
        match $e {
            Ok(e) => e,
            Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
        }
    };
}

const PAYLOAD_LEN: usize = 1024 * 1024;

fn payload() -> Vec<u8> {
    (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect()
}

/// A megabyte written in one call against a peer that is not reading yet:
/// the call accepts everything immediately, most of it spooled, and the
/// writability handler drains the spool completely once the peer starts
/// consuming.
#[test]
fn one_call_write_survives_slow_reader() {
    drop(env_logger::try_init());

    let srv = t!(net::TcpListener::bind("127.0.0.1:0"));
    let port = t!(srv.local_addr()).port();

    let (start_tx, start_rx) = channel::<()>();
    let (done_tx, done_rx) = channel::<Vec<u8>>();
    let reader = thread::spawn(move || {
        let (mut peer, _) = t!(srv.accept());
        // Hold off reading so the client's kernel buffers fill up.
        start_rx.recv().unwrap();

        let mut received = Vec::with_capacity(PAYLOAD_LEN);
        let mut chunk = [0u8; 64 * 1024];
        while received.len() < PAYLOAD_LEN {
            let n = t!(peer.read(&mut chunk));
            assert!(n > 0, "peer closed before the payload was complete");
            received.extend_from_slice(&chunk[..n]);
        }
        done_tx.send(received).unwrap();
    });

    let mut client = t!(Reactor::new());
    {
        let conn = t!(client.connect("127.0.0.1", port, |_, _| {}, |_, _| {}));
        assert_eq!(t!(conn.write(&payload())), PAYLOAD_LEN);
    }

    // Let a few cycles run with the reader paused; nothing must fall over.
    for _ in 0..20 {
        client.poll();
        thread::sleep(Duration::from_millis(1));
    }

    start_tx.send(()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    let received = loop {
        client.poll();
        if let Ok(received) = done_rx.try_recv() {
            break received;
        }
        assert!(Instant::now() < deadline, "payload never fully drained");
        thread::sleep(Duration::from_millis(1));
    };

    assert_eq!(received.len(), PAYLOAD_LEN);
    assert_eq!(received, payload());
    assert_eq!(client.connection_count(), 1);

    reader.join().unwrap();
}
