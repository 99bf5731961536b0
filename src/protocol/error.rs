//! Typed decode-failure kind for the wire protocol, distinct from the
//! `anyhow::Error` used for context-carrying propagation elsewhere.

use std::fmt;

/// Frame/header/HELLO decode failures a caller needs to match on, as
/// opposed to inspecting an opaque `anyhow::Error` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A frame payload exceeded [`super::frame::MAX_PAYLOAD`] on encode.
    PayloadTooLarge { len: usize, max: usize },
    /// A frame header advertised a payload length exceeding
    /// [`super::frame::MAX_PAYLOAD`] on decode.
    FrameLengthTooLarge { length: usize, max: usize },
    /// A `HELLO` payload was not valid UTF-8, lacked exactly three
    /// NUL-separated parts, or carried a non-numeric port.
    MalformedHello(String),
    /// A `WELCOME` payload was not exactly 4 bytes, or decoded to a port
    /// out of `u16` range.
    MalformedWelcome(String),
    /// The first frame on a new control connection was not `HELLO`.
    UnexpectedFirstFrame(u8),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {len} bytes (max {max})")
            }
            ProtocolError::FrameLengthTooLarge { length, max } => {
                write!(f, "frame length {length} exceeds max payload {max}")
            }
            ProtocolError::MalformedHello(reason) => write!(f, "malformed HELLO: {reason}"),
            ProtocolError::MalformedWelcome(reason) => write!(f, "malformed WELCOME: {reason}"),
            ProtocolError::UnexpectedFirstFrame(frame_type) => {
                write!(f, "first frame on control connection was type {frame_type}, expected HELLO")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
