//! Stream multiplexer: many independent bidirectional byte streams over one accepted
//! TCP connection, used to carry public traffic to a tunnel client once its mux
//! session has been established (§4.E).

pub mod frame;
pub mod session;

pub use frame::{Frame, FrameType, MuxError, StreamId, HEADER_SIZE, MAX_FRAME_SIZE};
pub use session::{MuxSession, MuxStream};
