//! Length-prefixed JSON framing for the control channel.
//!
//! Each frame is a 4-byte big-endian length prefix followed by that many bytes of
//! UTF-8 JSON. This keeps message boundaries unambiguous on a plain duplex byte stream
//! without requiring a full WebSocket upgrade, while the JSON payload itself is wire
//! compatible with a transport that delivers one message per frame natively.

use crate::messages::ControlMessage;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected before the body is read, so a hostile or
/// malformed length prefix cannot force an unbounded allocation.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message exceeds maximum size of {0} bytes")]
    MessageTooLarge(u32),

    #[error("malformed control message: {0}")]
    InvalidMessage(String),

    #[error("connection closed while reading a frame")]
    ConnectionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads and writes `ControlMessage`s over any async duplex stream.
pub struct ControlCodec;

impl ControlCodec {
    /// Serialize and write one message, prefixed with its length.
    pub async fn write<W: AsyncWrite + Unpin>(
        writer: &mut W,
        message: &ControlMessage,
    ) -> Result<(), CodecError> {
        let body = serde_json::to_vec(message)
            .map_err(|e| CodecError::InvalidMessage(e.to_string()))?;
        if body.len() > MAX_MESSAGE_SIZE as usize {
            return Err(CodecError::MessageTooLarge(MAX_MESSAGE_SIZE));
        }
        writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one length-prefixed frame and parse it as a `ControlMessage`.
    ///
    /// Returns `Err(ConnectionClosed)` if EOF is reached before any bytes of a new
    /// frame are read; a partial frame after that point is an `Io` error.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ControlMessage, CodecError> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(CodecError::ConnectionClosed)
            }
            Err(e) => return Err(CodecError::Io(e)),
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(MAX_MESSAGE_SIZE));
        }

        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await?;

        serde_json::from_slice(&body).map_err(|e| CodecError::InvalidMessage(e.to_string()))
    }
}
