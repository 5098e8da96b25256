//! loopnet echo server
//!
//! Single-threaded TCP echo server: one EventLoop, one PollDriver, every
//! connection's reads and writes on the loop thread.
//!
//! Usage:
//!     cargo run --release -p loopnet-echo [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!
//!     # a few clients at once:
//!     for i in $(seq 1 20); do echo "ping $i" | nc -q0 localhost 9999 & done

use bytes::Bytes;
use log::{Level, LevelFilter, Metadata, Record};

use loopnet_reactor::{EventLoop, PollDriver};
use loopnet_tcp::TcpServer;

const DEFAULT_PORT: u16 = 9999;

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn main() {
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Info));

    let port = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let mut el = match EventLoop::new(Box::new(PollDriver::new())) {
        Ok(el) => el,
        Err(e) => {
            eprintln!("loopnet-echo: failed to create loop: {}", e);
            std::process::exit(1);
        }
    };
    let handle = el.handle();

    let server = match TcpServer::bind(handle.clone(), port) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("loopnet-echo: failed to bind port {}: {}", port, e);
            std::process::exit(1);
        }
    };

    server.set_on_new_connection(Box::new(|conn| {
        log::info!("{}: connected", conn.name());
    }));
    server.set_on_message(Box::new(|conn, bytes| {
        let _ = conn.write(Bytes::copy_from_slice(bytes), None);
    }));
    server.set_on_connection_close(Box::new(|name| {
        log::info!("{}: gone", name);
    }));
    server.start();

    if let Err(e) = el.run() {
        eprintln!("loopnet-echo: loop failed: {}", e);
        std::process::exit(1);
    }
}
