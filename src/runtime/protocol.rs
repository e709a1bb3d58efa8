//! Delimiter-framed byte-transform protocol.
//!
//! Wire format:
//! - server sends a single greeting byte `*` right after accept
//! - bytes between `^` and `$` are echoed back as `(b + 1) mod 256`
//! - delimiters and bytes outside a frame are discarded
//!
//! Processing is synchronous and works on raw byte slices, so the state
//! survives arbitrary read boundaries.

use crate::runtime::buffer::OutboundBuffer;
use crate::runtime::connection::ConnState;

/// Sent once, before any client byte is processed.
pub const GREETING: u8 = b'*';
/// Opens a frame.
pub const FRAME_START: u8 = b'^';
/// Closes a frame.
pub const FRAME_END: u8 = b'$';

/// Transform applied to each in-frame byte.
#[inline]
pub fn transform(byte: u8) -> u8 {
    byte.wrapping_add(1)
}

/// Effect of a single inbound byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Byte dropped (outside a frame, or a delimiter).
    Discard,
    /// Byte to append to the outbound buffer.
    Emit(u8),
}

/// Advance the frame state machine by one byte.
///
/// `Init` never sees input because the connection does not read until
/// the greeting has drained; such a byte is discarded without a transition.
pub fn step(state: &mut ConnState, byte: u8) -> Step {
    match *state {
        ConnState::Init => Step::Discard,
        ConnState::Idle => {
            if byte == FRAME_START {
                *state = ConnState::InFrame;
            }
            Step::Discard
        }
        ConnState::InFrame => {
            if byte == FRAME_END {
                *state = ConnState::Idle;
                Step::Discard
            } else {
                Step::Emit(transform(byte))
            }
        }
    }
}

/// Result of running a slice of input through the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// All input consumed.
    Complete {
        /// Bytes appended to the outbound buffer.
        produced: usize,
    },
    /// The outbound buffer filled up. `input[consumed..]` was not looked
    /// at and must be offered again once the buffer drains.
    OutputFull { consumed: usize, produced: usize },
}

impl ProcessResult {
    pub fn consumed(&self, input_len: usize) -> usize {
        match *self {
            ProcessResult::Complete { .. } => input_len,
            ProcessResult::OutputFull { consumed, .. } => consumed,
        }
    }

    pub fn produced(&self) -> usize {
        match *self {
            ProcessResult::Complete { produced } | ProcessResult::OutputFull { produced, .. } => {
                produced
            }
        }
    }
}

/// Process `input` in arrival order, appending transformed bytes to `output`.
///
/// Stops before the first byte whose output would not fit; that byte and
/// everything after it are left unconsumed and the state is unchanged by them.
pub fn process(state: &mut ConnState, input: &[u8], output: &mut OutboundBuffer) -> ProcessResult {
    let mut produced = 0;

    for (i, &byte) in input.iter().enumerate() {
        let mut next = *state;
        if let Step::Emit(out) = step(&mut next, byte) {
            if output.push(out).is_err() {
                return ProcessResult::OutputFull {
                    consumed: i,
                    produced,
                };
            }
            produced += 1;
        }
        *state = next;
    }

    ProcessResult::Complete { produced }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(state: &mut ConnState, input: &[u8], capacity: usize) -> (ProcessResult, Vec<u8>) {
        let mut out = OutboundBuffer::new(capacity);
        let result = process(state, input, &mut out);
        (result, out.pending().to_vec())
    }

    #[test]
    fn test_single_frame() {
        let mut state = ConnState::Idle;
        let (result, out) = run(&mut state, b"^abc$", 64);
        assert_eq!(out, b"bcd");
        assert_eq!(result, ProcessResult::Complete { produced: 3 });
        assert_eq!(state, ConnState::Idle);
    }

    #[test]
    fn test_bytes_outside_frame_discarded() {
        let mut state = ConnState::Idle;
        let (_, out) = run(&mut state, b"hello^hi$world", 64);
        assert_eq!(out, b"ij");
    }

    #[test]
    fn test_state_survives_split_input() {
        let mut state = ConnState::Idle;
        let (_, first) = run(&mut state, b"^a", 64);
        assert_eq!(state, ConnState::InFrame);
        let (_, second) = run(&mut state, b"bc$", 64);
        assert_eq!([first, second].concat(), b"bcd");
        assert_eq!(state, ConnState::Idle);
    }

    #[test]
    fn test_unterminated_frame_keeps_transforming() {
        let mut state = ConnState::Idle;
        let (_, out) = run(&mut state, b"^xyz", 64);
        assert_eq!(out, b"yz{");
        let (_, out) = run(&mut state, b"^^", 64);
        // A second '^' inside a frame is ordinary payload
        assert_eq!(out, b"__");
        assert_eq!(state, ConnState::InFrame);
    }

    #[test]
    fn test_transform_wraps() {
        assert_eq!(transform(0xFF), 0x00);
        assert_eq!(transform(b'a'), b'b');

        let mut state = ConnState::InFrame;
        let (_, out) = run(&mut state, &[0xFE, 0xFF], 8);
        assert_eq!(out, [0xFF, 0x00]);
    }

    #[test]
    fn test_output_full_stops_before_byte() {
        let mut state = ConnState::Idle;
        let (result, out) = run(&mut state, b"^abcd$x", 2);
        assert_eq!(out, b"bc");
        assert_eq!(
            result,
            ProcessResult::OutputFull {
                consumed: 3,
                produced: 2
            }
        );
        assert_eq!(result.consumed(7), 3);
        // Still inside the frame: 'c' is re-offered after the drain
        assert_eq!(state, ConnState::InFrame);
    }

    #[test]
    fn test_delimiters_do_not_need_space() {
        let mut state = ConnState::InFrame;
        let mut out = OutboundBuffer::new(1);
        out.push(b'z').unwrap();

        // '$' and out-of-frame bytes fit even with a full buffer
        let result = process(&mut state, b"$junk", &mut out);
        assert_eq!(result, ProcessResult::Complete { produced: 0 });
        assert_eq!(state, ConnState::Idle);
    }

    #[test]
    fn test_init_discards() {
        let mut state = ConnState::Init;
        assert_eq!(step(&mut state, b'^'), Step::Discard);
        assert_eq!(state, ConnState::Init);
    }
}
