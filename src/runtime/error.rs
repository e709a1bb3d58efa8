//! Error types and the single fatal-vs-recoverable policy.
//!
//! Only setup failures terminate the process. Everything that happens to
//! an accepted connection stays local to that connection.

use std::io;
use std::net::SocketAddr;

/// Where an I/O error was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Binding, listener/waker registration, poll creation.
    Setup,
    /// Accepting from the listening socket.
    Accept,
    /// Any operation on an accepted connection.
    Connection,
}

/// What the caller should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Not an error: wait for the next readiness notification.
    Retry,
    /// Tear down the affected connection (or skip this accept round).
    Close,
    /// Terminate the server.
    Fatal,
}

/// Classify an I/O error.
pub fn classify(err: &io::Error, phase: Phase) -> Disposition {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Disposition::Retry,
        _ => match phase {
            Phase::Setup => Disposition::Fatal,
            Phase::Accept | Phase::Connection => Disposition::Close,
        },
    }
}

/// Out of descriptors or kernel memory; retrying immediately won't help.
pub fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

/// The pending connection failed before accept returned it. Only that
/// client is affected; the next queued one can be accepted right away.
pub fn is_aborted_connection(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    ) || matches!(err.raw_os_error(), Some(libc::EPROTO) | Some(libc::EPERM))
}

/// Fatal server errors. All of these occur during setup, except `Poll`
/// which means the readiness primitive itself stopped working.
#[derive(Debug)]
pub enum ServerError {
    InvalidAddress(String),
    Bind(SocketAddr, io::Error),
    Setup(&'static str, io::Error),
    Poll(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::InvalidAddress(addr) => write!(f, "Invalid listen address '{addr}'"),
            ServerError::Bind(addr, e) => write!(f, "Failed to listen on {addr}: {e}"),
            ServerError::Setup(what, e) => write!(f, "Failed to {what}: {e}"),
            ServerError::Poll(e) => write!(f, "Poll failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::InvalidAddress(_) => None,
            ServerError::Bind(_, e) | ServerError::Setup(_, e) | ServerError::Poll(e) => Some(e),
        }
    }
}

/// Reasons a single connection is torn down.
#[derive(Debug)]
pub enum ConnectionError {
    /// Zero-length read: the peer closed its end.
    PeerClosed,
    /// Read or write failed.
    Io(io::Error),
    /// Changing the readiness registration failed.
    Register(io::Error),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::PeerClosed => write!(f, "remote peer closed"),
            ConnectionError::Io(e) => write!(f, "I/O error: {e}"),
            ConnectionError::Register(e) => write!(f, "registration failed: {e}"),
        }
    }
}

impl std::error::Error for ConnectionError {}
