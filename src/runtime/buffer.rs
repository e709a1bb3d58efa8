//! Fixed-capacity per-connection byte buffers.
//!
//! Both buffers are linear, not circular: a single pair of cursors is
//! rewound to zero only once everything between them has been consumed.
//! Capacity never changes after construction.

use std::io::{self, Read};

/// Error returned when an append would grow a buffer past its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityExceeded {
    pub capacity: usize,
}

impl std::fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "outbound buffer full ({} bytes)", self.capacity)
    }
}

impl std::error::Error for CapacityExceeded {}

/// Bytes produced for the peer but not yet sent.
///
/// `drain <= fill <= capacity` always holds. `data[drain..fill]` is the
/// unsent region; a short write only advances `drain`.
#[derive(Debug)]
pub struct OutboundBuffer {
    data: Box<[u8]>,
    fill: usize,
    drain: usize,
}

impl OutboundBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            fill: 0,
            drain: 0,
        }
    }

    /// Bounds-checked append of a single byte.
    pub fn push(&mut self, byte: u8) -> Result<(), CapacityExceeded> {
        if self.fill == self.data.len() {
            return Err(CapacityExceeded {
                capacity: self.data.len(),
            });
        }
        self.data[self.fill] = byte;
        self.fill += 1;
        Ok(())
    }

    /// The unsent region.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.drain..self.fill]
    }

    /// Record that `n` pending bytes were sent.
    ///
    /// Returns `true` when the buffer became fully drained, in which case
    /// both cursors are rewound to zero.
    pub fn advance(&mut self, n: usize) -> bool {
        debug_assert!(n <= self.fill - self.drain, "advanced past fill cursor");
        self.drain = (self.drain + n).min(self.fill);
        if self.drain == self.fill {
            self.fill = 0;
            self.drain = 0;
            true
        } else {
            false
        }
    }

    /// Whether any produced bytes are still waiting to be sent.
    pub fn has_pending(&self) -> bool {
        self.drain < self.fill
    }

    pub fn fill(&self) -> usize {
        self.fill
    }

    pub fn drain(&self) -> usize {
        self.drain
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// Bytes read from the socket that the protocol has not processed yet.
///
/// The socket is only read into an empty staging buffer, so at most one
/// read's worth of input is ever held per connection.
#[derive(Debug)]
pub struct InboundBuffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl InboundBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    /// Perform one read from `src` into the (empty) buffer.
    ///
    /// Returns the byte count reported by the reader; `Ok(0)` means EOF.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> io::Result<usize> {
        debug_assert!(self.is_empty(), "read into non-empty staging buffer");
        self.start = 0;
        self.end = 0;
        let n = src.read(&mut self.data)?;
        self.end = n;
        Ok(n)
    }

    /// Staged bytes not yet consumed.
    pub fn unconsumed(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Mark `n` staged bytes as processed.
    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}
