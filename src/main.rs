//! ack-reactor: a single-threaded readiness-based TCP server
//!
//! One thread waits on mio (epoll on Linux, kqueue on macOS) for readiness
//! across every socket and dispatches each ready socket to its handler:
//! - the listener's acceptor registers new peers
//! - each peer's handler reads, logs and writes back a fixed acknowledgment
//!
//! Configuration via CLI arguments or TOML file. SIGINT/SIGTERM stop the
//! loop between waits.

mod config;
mod reactor;
mod signal;

use config::Config;
use reactor::ReactorLoop;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        buffer_size = config.buffer_size,
        events_capacity = config.events_capacity,
        ack = %String::from_utf8_lossy(&config.ack),
        "Starting ack-reactor"
    );

    let mut reactor = ReactorLoop::bind(&config)?;
    signal::stop_on_signal(reactor.stop_handle())?;

    reactor.run()?;
    Ok(())
}
