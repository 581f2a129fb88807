//! Wire format for the stream multiplexer: a fixed 9-byte header followed by a
//! variable-length payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub type StreamId = u32;

/// 4 bytes stream id + 1 byte frame type + 4 bytes payload length.
pub const HEADER_SIZE: usize = 9;

/// Frames larger than this are refused by the reader before the payload is allocated.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("invalid frame type byte: {0}")]
    InvalidFrameType(u8),

    #[error("frame payload of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(u32, u32),

    #[error("stream {0} not found")]
    StreamNotFound(StreamId),

    #[error("no available stream ids")]
    NoAvailableStreamIds,

    #[error("mux session is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Carries a chunk of application bytes for `stream_id`.
    Data = 0,
    /// Half-closes `stream_id`; no more `Data` frames will follow for it.
    Close = 1,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::Close),
            other => Err(MuxError::InvalidFrameType(other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Data,
            payload,
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Close,
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, MuxError> {
        let len = self.payload.len();
        if len as u64 > MAX_FRAME_SIZE as u64 {
            return Err(MuxError::FrameTooLarge(len as u32, MAX_FRAME_SIZE));
        }
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + len);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(len as u32);
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parses the fixed header out of exactly `HEADER_SIZE` bytes, returning the
    /// stream id, frame type, and declared payload length.
    pub fn decode_header(mut header: &[u8]) -> Result<(StreamId, FrameType, u32), MuxError> {
        if header.len() < HEADER_SIZE {
            return Err(MuxError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short mux frame header",
            )));
        }
        let stream_id = header.get_u32();
        let frame_type = FrameType::try_from(header.get_u8())?;
        let len = header.get_u32();
        if len > MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(len, MAX_FRAME_SIZE));
        }
        Ok((stream_id, frame_type, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_encodes_and_decodes_header() {
        let frame = Frame::data(7, Bytes::from_static(b"hello"));
        let encoded = frame.encode().unwrap();
        let (stream_id, frame_type, len) = Frame::decode_header(&encoded[..HEADER_SIZE]).unwrap();
        assert_eq!(stream_id, 7);
        assert_eq!(frame_type, FrameType::Data);
        assert_eq!(len, 5);
        assert_eq!(&encoded[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn close_frame_has_empty_payload() {
        let frame = Frame::close(3);
        let encoded = frame.encode().unwrap();
        let (stream_id, frame_type, len) = Frame::decode_header(&encoded[..HEADER_SIZE]).unwrap();
        assert_eq!(stream_id, 3);
        assert_eq!(frame_type, FrameType::Close);
        assert_eq!(len, 0);
    }

    #[test]
    fn oversized_payload_is_rejected_at_encode_time() {
        let payload = vec![0u8; (MAX_FRAME_SIZE + 1) as usize];
        let frame = Frame::data(1, Bytes::from(payload));
        assert!(matches!(frame.encode(), Err(MuxError::FrameTooLarge(_, _))));
    }

    #[test]
    fn unknown_frame_type_byte_is_rejected() {
        assert!(matches!(FrameType::try_from(99), Err(MuxError::InvalidFrameType(99))));
    }
}
