//! Wire framing for the tunnel control channel.
//!
//! Every frame is a fixed 9-byte header followed by its payload:
//!
//! ```text
//! [type: u8][stream_id: u32 BE][length: u32 BE][payload: length bytes]
//! ```
//!
//! `HELLO` and `WELCOME` always carry `stream_id = 0`; `OPEN`/`DATA`/`CLOSE`
//! carry the stream id of the public-side connection they concern.

use super::error::ProtocolError;

/// Maximum payload size for a single frame (1 MiB).
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Frame header size: 1 (type) + 4 (stream_id) + 4 (length).
const HEADER_LEN: usize = 9;

/// Message type constants.
pub mod message_type {
    /// Agent -> Broker, authenticate and declare the local endpoint.
    pub const HELLO: u8 = 1;
    /// Broker -> Agent, authentication succeeded, carries the public port.
    pub const WELCOME: u8 = 2;
    /// Broker -> Agent, a new external connection was accepted.
    pub const OPEN: u8 = 3;
    /// Bidirectional, raw bytes for a stream.
    pub const DATA: u8 = 4;
    /// Bidirectional, a stream has been torn down.
    pub const CLOSE: u8 = 5;
}

/// One decoded wire frame: a message type, a stream id, and a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type (see [`message_type`]).
    pub frame_type: u8,
    /// Stream identifier; `0` for `HELLO`/`WELCOME`.
    pub stream_id: u32,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encode this frame into `9 + payload.len()` wire bytes.
    ///
    /// # Errors
    ///
    /// Fails if the payload exceeds [`MAX_PAYLOAD`].
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                len: self.payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.frame_type);
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Incremental frame decoder that tolerates arbitrary TCP segmentation.
///
/// Feed bytes via [`FrameDecoder::feed`]; complete frames are returned in
/// the order they were received. Partial headers and partial payloads stay
/// buffered across calls.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the decoder and drain all frames that are now complete.
    ///
    /// # Errors
    ///
    /// Fails if a complete header advertises a payload length exceeding
    /// [`MAX_PAYLOAD`]; this is a fatal protocol error for the connection.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let frame_type = self.buf[0];
            let stream_id = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
            let length = u32::from_be_bytes([self.buf[5], self.buf[6], self.buf[7], self.buf[8]]) as usize;

            if length > MAX_PAYLOAD {
                return Err(ProtocolError::FrameLengthTooLarge { length, max: MAX_PAYLOAD });
            }

            let total = HEADER_LEN + length;
            if self.buf.len() < total {
                break;
            }

            let payload = self.buf[HEADER_LEN..total].to_vec();
            frames.push(Frame {
                frame_type,
                stream_id,
                payload,
            });
            self.buf.drain(..total);
        }

        Ok(frames)
    }

    /// True if bytes are buffered that don't yet form a complete frame.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
