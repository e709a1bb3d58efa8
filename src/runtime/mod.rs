//! Readiness-multiplexed runtime for the framed transform protocol.
//!
//! Layers, leaf to root:
//! - `buffer`: fixed-capacity outbound buffer and inbound staging buffer
//! - `protocol`: frame state transitions and the byte transform
//! - `connection`: per-connection state machine and read/write handlers
//! - `multiplexer`: mio registrations and the connection table
//! - `event_loop`: listener, accept path and event dispatch

mod buffer;
mod connection;
mod error;
mod event_loop;
mod multiplexer;
mod protocol;
mod signal;

pub use error::ServerError;

use crate::config::Config;

/// Run the server on the calling thread until a fatal error.
pub fn run(config: Config) -> Result<(), ServerError> {
    event_loop::run(config)
}
