//! Typed message payloads layered over [`crate::protocol::frame`].

use anyhow::Result;

use super::error::ProtocolError;
use super::frame::{message_type, Frame};

/// Decoded `HELLO` payload: the shared token and the agent's declared
/// local service endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Shared authentication token.
    pub token: String,
    /// Local service host the agent will dial on `OPEN`.
    pub local_host: String,
    /// Local service port the agent will dial on `OPEN`.
    pub local_port: u16,
}

/// Encode a `HELLO` frame: `token \0 local_host \0 local_port`.
pub fn encode_hello(token: &str, local_host: &str, local_port: u16) -> Result<Vec<u8>> {
    let payload = format!("{token}\0{local_host}\0{local_port}").into_bytes();
    Ok(Frame {
        frame_type: message_type::HELLO,
        stream_id: 0,
        payload,
    }
    .encode()?)
}

/// Decode a `HELLO` payload.
///
/// # Errors
///
/// Fails unless the payload is valid UTF-8 with exactly three
/// NUL-separated parts and a decimal port.
pub fn decode_hello(payload: &[u8]) -> Result<Hello, ProtocolError> {
    let text =
        std::str::from_utf8(payload).map_err(|e| ProtocolError::MalformedHello(format!("not valid UTF-8: {e}")))?;
    let parts: Vec<&str> = text.split('\0').collect();
    let [token, local_host, port_str] = parts.as_slice() else {
        return Err(ProtocolError::MalformedHello(format!(
            "must have exactly 3 NUL-separated parts, got {}",
            parts.len()
        )));
    };
    let local_port: u16 = port_str
        .parse()
        .map_err(|_| ProtocolError::MalformedHello(format!("local_port is not numeric: {port_str:?}")))?;
    Ok(Hello {
        token: (*token).to_string(),
        local_host: (*local_host).to_string(),
        local_port,
    })
}

/// Encode a `WELCOME` frame carrying the allocated public port.
pub fn encode_welcome(public_port: u16) -> Result<Vec<u8>> {
    Ok(Frame {
        frame_type: message_type::WELCOME,
        stream_id: 0,
        payload: u32::from(public_port).to_be_bytes().to_vec(),
    }
    .encode()?)
}

/// Decode a `WELCOME` payload into its public port.
///
/// # Errors
///
/// Fails if the payload is not exactly 4 bytes.
pub fn decode_welcome(payload: &[u8]) -> Result<u16, ProtocolError> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| ProtocolError::MalformedWelcome(format!("payload must be 4 bytes, got {}", payload.len())))?;
    let port = u32::from_be_bytes(bytes);
    u16::try_from(port).map_err(|_| ProtocolError::MalformedWelcome(format!("port out of range: {port}")))
}

/// Encode an `OPEN(stream_id)` frame; carries no payload.
pub fn encode_open(stream_id: u32) -> Result<Vec<u8>> {
    Ok(Frame {
        frame_type: message_type::OPEN,
        stream_id,
        payload: Vec::new(),
    }
    .encode()?)
}

/// Encode a `DATA(stream_id, bytes)` frame.
pub fn encode_data(stream_id: u32, bytes: &[u8]) -> Result<Vec<u8>> {
    Ok(Frame {
        frame_type: message_type::DATA,
        stream_id,
        payload: bytes.to_vec(),
    }
    .encode()?)
}

/// Encode a `CLOSE(stream_id)` frame; carries no payload.
pub fn encode_close(stream_id: u32) -> Result<Vec<u8>> {
    Ok(Frame {
        frame_type: message_type::CLOSE,
        stream_id,
        payload: Vec::new(),
    }
    .encode()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trip() {
        let encoded = encode_hello("secret", "127.0.0.1", 9000).unwrap();
        // Strip the 9-byte header to decode just the payload, mirroring how
        // the control handler splits frame header from typed payload.
        let hello = decode_hello(&encoded[9..]).unwrap();
        assert_eq!(hello.token, "secret");
        assert_eq!(hello.local_host, "127.0.0.1");
        assert_eq!(hello.local_port, 9000);
    }

    #[test]
    fn hello_rejects_wrong_part_count() {
        assert!(decode_hello(b"only_one_part").is_err());
        assert!(decode_hello(b"a\0b\0c\0d").is_err());
    }

    #[test]
    fn hello_rejects_non_numeric_port() {
        assert!(decode_hello(b"tok\0host\0notaport").is_err());
    }

    #[test]
    fn welcome_round_trip() {
        let encoded = encode_welcome(10100).unwrap();
        let port = decode_welcome(&encoded[9..]).unwrap();
        assert_eq!(port, 10100);
    }

    #[test]
    fn welcome_rejects_wrong_length() {
        assert!(decode_welcome(b"abc").is_err());
    }

    #[test]
    fn open_and_close_carry_no_payload() {
        let open = encode_open(5).unwrap();
        assert_eq!(open.len(), 9);
        let close = encode_close(5).unwrap();
        assert_eq!(close.len(), 9);
    }
}
