//! Counterpart to the `echo_server` demo: sends one greeting, prints the
//! reply, closes, and exits once the close callback has fired.

use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use log::info;
use netloop::Reactor;

fn main() -> std::io::Result<()> {
    env_logger::init();

    let mut reactor = Reactor::new()?;
    let replied = Rc::new(Cell::new(false));
    let closed = Rc::new(Cell::new(false));

    let handle = {
        let replied = replied.clone();
        let closed = closed.clone();
        let conn = reactor.connect(
            "127.0.0.1",
            6890,
            move |conn, data| {
                info!(
                    "{} replied: {:?}",
                    conn.remote_addr(),
                    String::from_utf8_lossy(data)
                );
                replied.set(true);
            },
            move |_conn, reason| {
                info!("closed: {:?}", reason);
                closed.set(true);
            },
        )?;
        conn.write(b"hello world")?;
        conn.native_handle()
    };

    while !closed.get() {
        reactor.poll();
        if replied.get() {
            if let Some(conn) = reactor.connection(handle) {
                conn.user_close();
            }
        }
        thread::sleep(Duration::from_millis(1));
    }

    reactor.shut();
    Ok(())
}
