//! Request script shared by `frame-client` and the server tests.

use std::time::Duration;

/// Chunks sent in order, with the pause taken after each one.
pub const SCRIPT: &[(&[u8], Duration)] = &[
    (b"abc^def$gh^ij$k", Duration::from_millis(1000)),
    (b"abc^123", Duration::from_millis(500)),
    (b"abc$^xy123$okok", Duration::from_millis(100)),
    (b"$^00000$", Duration::ZERO),
];

/// Reply produced by the server for `SCRIPT`.
pub const EXPECTED: &[u8] = b"efgjk234bcdyz23411111";
