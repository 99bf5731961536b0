//! Binary multiplexing protocol shared by the broker and the agent.

pub mod codec;
pub mod error;
pub mod frame;

pub use error::ProtocolError;
pub use frame::{message_type, Frame, FrameDecoder, MAX_PAYLOAD};
