//! Control protocol: JSON message framing and the tagged message vocabulary spoken
//! over the long-lived control channel between a tunnel client and this server.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, ControlCodec, MAX_MESSAGE_SIZE};
pub use messages::{ControlMessage, ErrorCode, MessageType, Protocol, TunnelRequestPayload};
