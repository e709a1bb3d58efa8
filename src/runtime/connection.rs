//! Connection state machine for managing TCP connections.
//!
//! Each connection tracks its protocol state and owns its buffers. The
//! handlers are generic over `Read`/`Write` so the same code drives mio
//! sockets and in-memory test streams.
//!
//! Scheduling rule: a connection wants read-readiness only when it is past
//! the greeting and has no unsent output; otherwise it wants write-readiness.
//! The single outbound buffer is therefore never refilled while a previous
//! batch is still draining.

use crate::runtime::buffer::{InboundBuffer, OutboundBuffer};
use crate::runtime::error::{classify, ConnectionError, Disposition, Phase};
use crate::runtime::multiplexer::Interest;
use crate::runtime::protocol::{self, GREETING};
use std::io::{self, Read, Write};
use tracing::trace;

/// Reads performed for one readiness notification before yielding.
const READ_BUDGET: usize = 16;

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Greeting not yet fully sent.
    Init,
    /// Outside any frame.
    Idle,
    /// Inside a `^...$` frame.
    InFrame,
}

/// What the event loop should do with the registration after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// The handler hit would-block (or switched direction). Keep or switch
    /// to this interest and wait for the next notification.
    Wait(Interest),
    /// The handler yielded with work possibly left on the socket. The
    /// registration must be re-armed so a fresh notification is delivered.
    Rearm(Interest),
}

impl Next {
    pub fn interest(&self) -> Interest {
        match *self {
            Next::Wait(interest) | Next::Rearm(interest) => interest,
        }
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    state: ConnState,
    outbound: OutboundBuffer,
    inbound: InboundBuffer,
}

impl Connection {
    /// Create a connection in `Init` with the greeting staged for sending.
    ///
    /// `capacity` bounds the outbound buffer, `read_size` bounds a single
    /// socket read. Both must be non-zero.
    pub fn new(capacity: usize, read_size: usize) -> Self {
        let mut outbound = OutboundBuffer::new(capacity);
        let staged = outbound.push(GREETING).is_ok();
        debug_assert!(staged, "outbound capacity must hold the greeting");

        Self {
            state: ConnState::Init,
            outbound,
            inbound: InboundBuffer::new(read_size),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// The single readiness interest this connection should be registered for.
    pub fn interest(&self) -> Interest {
        if self.state == ConnState::Init || self.outbound.has_pending() {
            Interest::Write
        } else {
            Interest::Read
        }
    }

    /// Unsent output.
    pub fn pending_output(&self) -> &[u8] {
        self.outbound.pending()
    }

    /// Handle read-readiness.
    ///
    /// Reads until would-block, stopping as soon as output is pending.
    pub fn on_readable<R: Read>(&mut self, src: &mut R) -> Result<Next, ConnectionError> {
        if self.interest() == Interest::Write {
            return Ok(Next::Wait(Interest::Write));
        }

        for _ in 0..READ_BUDGET {
            debug_assert!(self.inbound.is_empty());
            match self.inbound.read_from(src) {
                Ok(0) => return Err(ConnectionError::PeerClosed),
                Ok(n) => trace!(bytes = n, "read"),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return match classify(&e, Phase::Connection) {
                        Disposition::Retry => Ok(Next::Wait(Interest::Read)),
                        Disposition::Close | Disposition::Fatal => Err(ConnectionError::Io(e)),
                    };
                }
            }

            self.process_staged();
            if self.outbound.has_pending() {
                return Ok(Next::Wait(Interest::Write));
            }
        }

        Ok(Next::Rearm(Interest::Read))
    }

    /// Handle write-readiness.
    ///
    /// Sends `outbound[drain..fill]`; a short write only advances the drain
    /// cursor. Once drained, input held back by a full buffer is processed
    /// before the socket is read again.
    pub fn on_writable<W: Write>(&mut self, dst: &mut W) -> Result<Next, ConnectionError> {
        loop {
            if !self.outbound.has_pending() {
                if self.state == ConnState::Init {
                    self.state = ConnState::Idle;
                }
                self.process_staged();
                if !self.outbound.has_pending() {
                    return Ok(Next::Wait(Interest::Read));
                }
            }

            match dst.write(self.outbound.pending()) {
                Ok(0) => {
                    return Err(ConnectionError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )));
                }
                Ok(n) => {
                    trace!(
                        bytes = n,
                        drain = self.outbound.drain(),
                        fill = self.outbound.fill(),
                        "wrote"
                    );
                    self.outbound.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return match classify(&e, Phase::Connection) {
                        Disposition::Retry => Ok(Next::Wait(Interest::Write)),
                        Disposition::Close | Disposition::Fatal => Err(ConnectionError::Io(e)),
                    };
                }
            }
        }
    }

    /// Run staged input through the protocol, leaving whatever did not fit.
    fn process_staged(&mut self) {
        if self.inbound.is_empty() {
            return;
        }
        let input = self.inbound.unconsumed();
        let result = protocol::process(&mut self.state, input, &mut self.outbound);
        let consumed = result.consumed(input.len());
        trace!(consumed, produced = result.produced(), "processed");
        if consumed < input.len() {
            trace!(
                held_back = input.len() - consumed,
                capacity = self.outbound.capacity(),
                "outbound buffer full"
            );
        }
        self.inbound.consume(consumed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    enum ReadStep {
        Data(Vec<u8>),
        Eof,
        Fail(io::ErrorKind),
    }

    /// Scripted in-memory stream. An exhausted read script or a `None`
    /// write limit reports would-block.
    #[derive(Default)]
    struct MockStream {
        reads: VecDeque<ReadStep>,
        write_limits: VecDeque<Option<usize>>,
        written: Vec<u8>,
        read_calls: usize,
    }

    impl MockStream {
        fn with_reads(chunks: &[&[u8]]) -> Self {
            Self {
                reads: chunks.iter().map(|c| ReadStep::Data(c.to_vec())).collect(),
                ..Default::default()
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.read_calls += 1;
            match self.reads.pop_front() {
                Some(ReadStep::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.reads.push_front(ReadStep::Data(data.split_off(n)));
                    }
                    Ok(n)
                }
                Some(ReadStep::Eof) => Ok(0),
                Some(ReadStep::Fail(kind)) => Err(io::Error::from(kind)),
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.write_limits.pop_front() {
                Some(None) => Err(io::Error::from(io::ErrorKind::WouldBlock)),
                Some(Some(limit)) => {
                    let n = limit.min(buf.len());
                    self.written.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                None => {
                    self.written.extend_from_slice(buf);
                    Ok(buf.len())
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Drive handlers the way the event loop would until the stream blocks.
    fn pump(conn: &mut Connection, stream: &mut MockStream) -> Result<(), ConnectionError> {
        loop {
            let next = match conn.interest() {
                Interest::Read => conn.on_readable(stream)?,
                Interest::Write => conn.on_writable(stream)?,
            };
            if let Next::Wait(_) = next {
                if stream.reads.is_empty() && !conn.outbound.has_pending() {
                    return Ok(());
                }
            }
        }
    }

    #[test]
    fn test_greeting_sent_first() {
        let mut conn = Connection::new(1024, 1024);
        assert_eq!(conn.state(), ConnState::Init);
        assert_eq!(conn.interest(), Interest::Write);
        assert_eq!(conn.pending_output(), b"*");

        let mut stream = MockStream::with_reads(&[b"^abc$"]);
        // Readable before the greeting drained: nothing is read
        assert_eq!(
            conn.on_readable(&mut stream).unwrap(),
            Next::Wait(Interest::Write)
        );
        assert_eq!(stream.read_calls, 0);

        assert_eq!(
            conn.on_writable(&mut stream).unwrap(),
            Next::Wait(Interest::Read)
        );
        assert_eq!(conn.state(), ConnState::Idle);
        assert_eq!(stream.written, b"*");

        pump(&mut conn, &mut stream).unwrap();
        assert_eq!(stream.written, b"*bcd");
    }

    #[test]
    fn test_no_read_while_output_pending() {
        let mut conn = Connection::new(1024, 1024);
        let mut stream = MockStream::with_reads(&[b"^ab", b"cd$"]);
        stream.write_limits = VecDeque::from([Some(1), Some(1), None]);

        // Greeting
        conn.on_writable(&mut stream).unwrap();
        // First chunk produces output and switches to write
        assert_eq!(
            conn.on_readable(&mut stream).unwrap(),
            Next::Wait(Interest::Write)
        );
        assert_eq!(conn.pending_output(), b"bc");

        // Short write then would-block: still writing, nothing new read
        assert_eq!(
            conn.on_writable(&mut stream).unwrap(),
            Next::Wait(Interest::Write)
        );
        assert_eq!(conn.pending_output(), b"c");
        assert_eq!(conn.outbound.drain(), 1);
        assert_eq!(
            conn.on_readable(&mut stream).unwrap(),
            Next::Wait(Interest::Write)
        );
        assert_eq!(stream.reads.len(), 1);

        pump(&mut conn, &mut stream).unwrap();
        assert_eq!(stream.written, b"*bcde");
        assert_eq!(conn.outbound.fill(), 0);
        assert_eq!(conn.outbound.drain(), 0);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut conn = Connection::new(1024, 1024);
        let mut stream = MockStream::with_reads(&[b"^a", b"bc$"]);
        pump(&mut conn, &mut stream).unwrap();
        assert_eq!(stream.written, b"*bcd");
        assert_eq!(conn.state(), ConnState::Idle);
    }

    #[test]
    fn test_discarded_input_keeps_reading() {
        let mut conn = Connection::new(1024, 1024);
        let mut stream = MockStream::with_reads(&[b"hello", b"^hi$", b"world"]);
        conn.on_writable(&mut stream).unwrap();

        // "hello" yields nothing, so the handler keeps reading
        assert_eq!(
            conn.on_readable(&mut stream).unwrap(),
            Next::Wait(Interest::Write)
        );
        assert_eq!(conn.pending_output(), b"ij");

        pump(&mut conn, &mut stream).unwrap();
        assert_eq!(stream.written, b"*ij");
    }

    #[test]
    fn test_open_frame_then_close() {
        let mut conn = Connection::new(1024, 1024);
        let mut stream = MockStream::with_reads(&[b"^"]);
        stream.reads.push_back(ReadStep::Eof);

        let result = pump(&mut conn, &mut stream);
        assert!(matches!(result, Err(ConnectionError::PeerClosed)));
        assert_eq!(stream.written, b"*");
        assert_eq!(conn.state(), ConnState::InFrame);
    }

    #[test]
    fn test_full_buffer_holds_input_back() {
        let mut conn = Connection::new(4, 16);
        let mut stream = MockStream::with_reads(&[b"^abcdefghij$"]);

        conn.on_writable(&mut stream).unwrap();
        assert_eq!(
            conn.on_readable(&mut stream).unwrap(),
            Next::Wait(Interest::Write)
        );
        assert_eq!(conn.pending_output(), b"bcde");
        assert!(!conn.inbound.is_empty());

        // Staged tail is processed on each drain, never dropped
        pump(&mut conn, &mut stream).unwrap();
        assert_eq!(stream.written, b"*bcdefghijk");
        assert!(conn.inbound.is_empty());
        assert_eq!(stream.read_calls, 1);
    }

    #[test]
    fn test_read_budget_rearms() {
        let mut conn = Connection::new(1024, 1);
        let noise = vec![b'x'; READ_BUDGET + 4];
        let mut stream = MockStream::with_reads(&[noise.as_slice()]);
        conn.on_writable(&mut stream).unwrap();

        assert_eq!(
            conn.on_readable(&mut stream).unwrap(),
            Next::Rearm(Interest::Read)
        );
        assert_eq!(stream.read_calls, READ_BUDGET);
    }

    #[test]
    fn test_io_errors_are_connection_local() {
        let mut conn = Connection::new(1024, 1024);
        let mut stream = MockStream::default();
        stream.reads.push_back(ReadStep::Fail(io::ErrorKind::Interrupted));
        stream.reads.push_back(ReadStep::Fail(io::ErrorKind::ConnectionReset));
        conn.on_writable(&mut stream).unwrap();

        assert!(matches!(
            conn.on_readable(&mut stream),
            Err(ConnectionError::Io(ref e)) if e.kind() == io::ErrorKind::ConnectionReset
        ));
    }

    #[test]
    fn test_zero_length_write_is_error() {
        let mut conn = Connection::new(1024, 1024);
        let mut stream = MockStream::default();
        stream.write_limits.push_back(Some(0));

        assert!(matches!(
            conn.on_writable(&mut stream),
            Err(ConnectionError::Io(ref e)) if e.kind() == io::ErrorKind::WriteZero
        ));
    }
}
