//! Minimal echo server: replies `welcome` to every chunk it receives.
//!
//! Run with `cargo run --example echo_server`, then poke it with the
//! `echo_client` demo or `nc 127.0.0.1 6890`. Press Enter to stop.

use std::io::BufRead;
use std::thread;
use std::time::Duration;

use log::{info, warn};
use netloop::{Reactor, StackMode};

fn main() -> std::io::Result<()> {
    env_logger::init();

    let mut reactor = Reactor::new()?;
    reactor.listen(
        "0.0.0.0",
        6890,
        StackMode::V4Only,
        |conn| info!("connected: {} ({})", conn.remote_addr(), conn.native_handle()),
        |conn, data| {
            info!(
                "{} sent {} bytes: {:?}",
                conn.remote_addr(),
                data.len(),
                String::from_utf8_lossy(data)
            );
            if let Err(e) = conn.write(b"welcome") {
                warn!("reply failed: {}", e);
            }
        },
        |conn, reason| info!("closed: {} ({:?})", conn.remote_addr(), reason),
    )?;
    reactor.set_listener_error_callback(|err| warn!("listener failed: {}", err));
    info!("listening on {}", reactor.local_addr().unwrap());

    let signal = reactor.shutdown_signal();
    thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
        signal.request();
    });

    while !reactor.is_shutdown_requested() {
        reactor.poll();
        thread::sleep(Duration::from_millis(1));
    }

    info!("shutting down");
    reactor.shut();
    Ok(())
}
