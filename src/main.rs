//! frame-echo: a readiness-multiplexed framed byte-transform server
//!
//! Protocol:
//! - A `*` greeting byte is sent to every new client
//! - Bytes between `^` and `$` are echoed back incremented by one
//! - Everything else is discarded
//!
//! Features:
//! - Single-threaded mio event loop (epoll/kqueue), no thread per connection
//! - Fixed per-connection buffers with backpressure on unsent output
//! - Configuration via CLI arguments or TOML file

#[cfg(test)]
mod client_script;
mod config;
mod runtime;

use config::Config;
use tracing::{error, info};
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
        buffer_size = config.buffer_size,
        read_buffer_size = config.read_buffer_size,
        max_connections = config.max_connections,
        "Starting frame-echo server"
    );

    if let Err(e) = runtime::run(config) {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }
    Ok(())
}
