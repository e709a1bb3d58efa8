//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking accept/read/write syscalls.
//! A single thread owns the multiplexer and every connection, so no
//! connection state is ever shared or locked.

use crate::config::Config;
use crate::runtime::connection::{Connection, Next};
use crate::runtime::error::{
    classify, is_aborted_connection, is_resource_exhaustion, ConnectionError, Disposition, Phase,
    ServerError,
};
use crate::runtime::multiplexer::{EventSource, Interest, Multiplexer, Ready, RegisterError};
use crate::runtime::signal;
use mio::net::TcpListener;
use mio::Waker;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// How long a paused accept waits before retrying when nothing else happens.
const ACCEPT_RETRY: Duration = Duration::from_millis(50);

/// Stops a running server from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        self.flag.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// Listener plus multiplexer: the whole server state.
pub struct Server {
    mux: Multiplexer,
    listener: TcpListener,
    buffer_size: usize,
    read_buffer_size: usize,
    shutdown: Arc<AtomicBool>,
    waker: Option<Arc<Waker>>,
    /// Set when accept failed for lack of resources. The listener is
    /// edge-triggered, so queued clients raise no new event by themselves.
    accept_paused: bool,
}

impl Server {
    /// Bind the listener and register it. Every failure here is fatal.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|_| ServerError::InvalidAddress(config.listen.clone()))?;

        let listener = create_listener(addr, config.backlog)
            .map_err(|e| ServerError::Bind(addr, e))?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Setup("read local address", e))?;

        let mux = Multiplexer::new(config.max_connections, config.batch_size)
            .map_err(|e| ServerError::Setup("create poll", e))?;
        mux.register_listener(&mut listener)
            .map_err(|e| ServerError::Setup("register listener", e))?;

        info!(
            addr = %local_addr,
            max_connections = config.max_connections,
            buffer_size = config.buffer_size,
            read_buffer_size = config.read_buffer_size,
            "Server listening"
        );

        Ok(Self {
            mux,
            listener,
            buffer_size: config.buffer_size,
            read_buffer_size: config.read_buffer_size,
            shutdown: Arc::new(AtomicBool::new(false)),
            waker: None,
            accept_paused: false,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Handle that makes `run` return after closing every connection.
    pub fn shutdown_handle(&mut self) -> Result<ShutdownHandle, ServerError> {
        let waker = match &self.waker {
            Some(waker) => Arc::clone(waker),
            None => {
                let waker = Arc::new(
                    self.mux
                        .waker()
                        .map_err(|e| ServerError::Setup("create waker", e))?,
                );
                self.waker = Some(Arc::clone(&waker));
                waker
            }
        };
        Ok(ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker,
        })
    }

    /// Dispatch readiness events until shut down.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut ready: Vec<Ready> = Vec::new();

        while !self.turn(&mut ready)? {}
        Ok(())
    }

    /// One poll and dispatch round. Returns `true` once shut down.
    fn turn(&mut self, ready: &mut Vec<Ready>) -> Result<bool, ServerError> {
        let timeout = self.accept_paused.then_some(ACCEPT_RETRY);
        self.mux.poll(ready, timeout).map_err(ServerError::Poll)?;

        for event in ready.iter() {
            match event.source {
                EventSource::Listener => self.accept_connections(),
                EventSource::Waker => {}
                EventSource::Connection(id) => self.handle_connection_event(id, event),
            }
        }

        // Closed connections may have freed descriptors since the last attempt
        if self.accept_paused {
            self.accept_paused = false;
            self.accept_connections();
        }

        if self.shutdown.load(Ordering::Acquire) {
            let closed = self.mux.unregister_all().len();
            info!(closed, "Server shutting down");
            return Ok(true);
        }
        Ok(false)
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let conn = Connection::new(self.buffer_size, self.read_buffer_size);
                    match self.mux.register(stream, peer, conn) {
                        Ok(conn_id) => {
                            debug!(conn_id, peer = %peer, live = self.mux.len(), "Accepted connection");
                        }
                        Err(RegisterError::Full(stream)) => {
                            warn!(peer = %peer, "Connection limit reached, rejecting");
                            drop(stream);
                        }
                        Err(RegisterError::Io(e)) => {
                            warn!(peer = %peer, error = %e, "Failed to register connection");
                        }
                    }
                }
                Err(e) => match classify(&e, Phase::Accept) {
                    Disposition::Retry if e.kind() == io::ErrorKind::Interrupted => continue,
                    Disposition::Retry => break,
                    Disposition::Close | Disposition::Fatal => {
                        if is_aborted_connection(&e) {
                            debug!(error = %e, "Pending connection aborted");
                            continue;
                        }
                        if is_resource_exhaustion(&e) {
                            warn!(error = %e, "Out of resources, pausing accept");
                        } else {
                            error!(error = %e, "Accept error, pausing accept");
                        }
                        self.accept_paused = true;
                        break;
                    }
                },
            }
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: &Ready) {
        if let Err(e) = self.drive_connection(conn_id, event) {
            self.close_connection(conn_id, &e);
        }
    }

    /// Run the handler matching the registered interest, then update the registration.
    fn drive_connection(&mut self, conn_id: usize, event: &Ready) -> Result<(), ConnectionError> {
        // Stale event for a connection closed earlier in this batch
        let Some(reg) = self.mux.get_mut(conn_id) else {
            return Ok(());
        };

        let registered = reg.interest();
        let next = match registered {
            Interest::Read if event.readable => reg.conn.on_readable(&mut reg.stream)?,
            Interest::Write if event.writable => reg.conn.on_writable(&mut reg.stream)?,
            _ => return Ok(()),
        };

        let rearm = matches!(next, Next::Rearm(_));
        if next.interest() != registered || rearm {
            trace!(conn_id, interest = ?next.interest(), rearm, "reregister");
            self.mux
                .modify(conn_id, next.interest())
                .map_err(ConnectionError::Register)?;
        }
        Ok(())
    }

    /// The single teardown path for a connection.
    fn close_connection(&mut self, conn_id: usize, reason: &ConnectionError) {
        let Some(reg) = self.mux.unregister(conn_id) else {
            return;
        };

        match reason {
            ConnectionError::PeerClosed => {
                debug!(conn_id, peer = %reg.peer, fd = reg.fd, "Remote peer closed");
            }
            ConnectionError::Io(_) | ConnectionError::Register(_) => {
                warn!(conn_id, peer = %reg.peer, fd = reg.fd, error = %reason, "Connection error");
            }
        }

        let dropped = reg.conn.pending_output().len();
        if dropped > 0 {
            debug!(conn_id, dropped, "Discarding unsent output");
        }
        debug!(conn_id, state = ?reg.conn.state(), "Connection closed");
    }
}

/// Run the server until it fails or SIGINT/SIGTERM arrives.
pub fn run(config: Config) -> Result<(), ServerError> {
    let mut server = Server::bind(&config)?;
    let handle = server.shutdown_handle()?;
    signal::shutdown_on_signal(handle)
        .map_err(|e| ServerError::Setup("install signal handler", e))?;
    server.run()
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
