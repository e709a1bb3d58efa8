//! Readiness multiplexer over mio (epoll on Linux, kqueue on macOS).
//!
//! Owns the descriptor -> connection table. Every registration carries
//! exactly one interest, and removing it from the table is the only way a
//! connection is destroyed: the socket closes when the returned
//! `Registration` is dropped.

use crate::runtime::connection::Connection;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

pub const LISTENER_TOKEN: Token = Token(usize::MAX);
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// The single readiness a registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    fn to_mio(self) -> mio::Interest {
        match self {
            Interest::Read => mio::Interest::READABLE,
            Interest::Write => mio::Interest::WRITABLE,
        }
    }
}

/// Which registered source an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Listener,
    Waker,
    Connection(usize),
}

/// A readiness notification.
///
/// Closed and error conditions are folded into `readable`/`writable`; the
/// handler's next syscall reports the actual condition.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub source: EventSource,
    pub readable: bool,
    pub writable: bool,
}

/// A registered client socket and the connection it denotes.
#[derive(Debug)]
pub struct Registration {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub fd: RawFd,
    pub conn: Connection,
    interest: Interest,
}

impl Registration {
    pub fn interest(&self) -> Interest {
        self.interest
    }
}

/// Registration failure.
#[derive(Debug)]
pub enum RegisterError {
    /// The table is at capacity; the stream is handed back unregistered.
    Full(TcpStream),
    Io(io::Error),
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    registrations: Slab<Registration>,
    capacity: usize,
}

impl Multiplexer {
    /// Create a multiplexer holding at most `capacity` connections and
    /// returning at most `batch_size` events per poll.
    pub fn new(capacity: usize, batch_size: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(batch_size),
            registrations: Slab::with_capacity(capacity),
            capacity,
        })
    }

    pub fn register_listener(&self, listener: &mut TcpListener) -> io::Result<()> {
        self.poll
            .registry()
            .register(listener, LISTENER_TOKEN, mio::Interest::READABLE)
    }

    /// Create a waker that interrupts `poll` from another thread.
    pub fn waker(&self) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), WAKER_TOKEN)
    }

    /// Register a new connection with the interest it currently wants.
    ///
    /// Returns the key used as its token.
    pub fn register(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
        conn: Connection,
    ) -> Result<usize, RegisterError> {
        if self.is_full() {
            return Err(RegisterError::Full(stream));
        }

        let interest = conn.interest();
        let entry = self.registrations.vacant_entry();
        let id = entry.key();
        self.poll
            .registry()
            .register(&mut stream, Token(id), interest.to_mio())
            .map_err(RegisterError::Io)?;

        let fd = stream.as_raw_fd();
        entry.insert(Registration {
            stream,
            peer,
            fd,
            conn,
            interest,
        });
        Ok(id)
    }

    /// Replace the interest of a registration.
    ///
    /// Always issues the OS call, so it also re-arms an unchanged interest.
    pub fn modify(&mut self, id: usize, interest: Interest) -> io::Result<()> {
        let reg = self
            .registrations
            .get_mut(id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;
        self.poll
            .registry()
            .reregister(&mut reg.stream, Token(id), interest.to_mio())?;
        reg.interest = interest;
        Ok(())
    }

    /// Remove a registration. Dropping the result closes the socket.
    pub fn unregister(&mut self, id: usize) -> Option<Registration> {
        let mut reg = self.registrations.try_remove(id)?;
        // The descriptor is closed right after; a failed deregister leaves nothing behind.
        let _ = self.poll.registry().deregister(&mut reg.stream);
        Some(reg)
    }

    /// Remove every registration.
    pub fn unregister_all(&mut self) -> Vec<Registration> {
        let ids: Vec<usize> = self.registrations.iter().map(|(id, _)| id).collect();
        ids.into_iter().filter_map(|id| self.unregister(id)).collect()
    }

    /// Block until at least one source is ready, or `timeout` elapses, and
    /// collect the events into `ready`. `None` waits indefinitely.
    pub fn poll(&mut self, ready: &mut Vec<Ready>, timeout: Option<Duration>) -> io::Result<()> {
        ready.clear();
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        ready.extend(self.events.iter().map(|event| {
            let source = match event.token() {
                LISTENER_TOKEN => EventSource::Listener,
                WAKER_TOKEN => EventSource::Waker,
                Token(id) => EventSource::Connection(id),
            };
            Ready {
                source,
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed() || event.is_error(),
            }
        }));
        Ok(())
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Registration> {
        self.registrations.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_full(&self) -> bool {
        self.registrations.len() >= self.capacity
    }
}
