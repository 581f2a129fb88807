//! A byte-oriented multiplexer over one accepted TCP connection, providing many
//! independent bidirectional streams. Wire-compatible in spirit with `yamux`: each
//! stream is identified by a `u32` id, and closing one stream does not affect others.
//!
//! Only the server side opens streams in this system — one per inbound public
//! connection (§4.E) — so there is no stream-accept path; the remote end is expected
//! to demultiplex by `stream_id` on its own.

use crate::frame::{Frame, FrameType, MuxError, StreamId, HEADER_SIZE};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

type InboundTx = mpsc::UnboundedSender<Bytes>;

struct Shared {
    streams: Mutex<HashMap<StreamId, InboundTx>>,
    next_stream_id: AtomicU32,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: AtomicBool,
}

/// A server-side multiplexed session over one accepted connection.
pub struct MuxSession {
    shared: std::sync::Arc<Shared>,
}

/// One bidirectional stream within a `MuxSession`, carrying exactly one inbound
/// public connection's bytes.
pub struct MuxStream {
    stream_id: StreamId,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: bool,
}

impl MuxSession {
    /// Wraps an already-accepted socket and spawns the reader/writer tasks that keep
    /// the session alive for as long as the underlying connection is open.
    pub fn new(socket: TcpStream) -> Self {
        let (read_half, write_half) = socket.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Frame>();

        let shared = std::sync::Arc::new(Shared {
            streams: Mutex::new(HashMap::new()),
            // Stream id 0 is reserved so a misrouted or default-initialized id is
            // never mistaken for a live stream.
            next_stream_id: AtomicU32::new(1),
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
        });

        tokio::spawn(Self::write_loop(write_half, outbound_rx));
        tokio::spawn(Self::read_loop(read_half, shared.clone()));

        Self { shared }
    }

    async fn write_loop(
        mut write_half: tokio::net::tcp::OwnedWriteHalf,
        mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
    ) {
        while let Some(frame) = outbound_rx.recv().await {
            let encoded = match frame.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "dropping unencodable mux frame");
                    continue;
                }
            };
            if let Err(e) = write_half.write_all(&encoded).await {
                warn!(error = %e, "mux session write failed, closing writer");
                return;
            }
            if write_half.flush().await.is_err() {
                return;
            }
        }
    }

    async fn read_loop(mut read_half: tokio::net::tcp::OwnedReadHalf, shared: std::sync::Arc<Shared>) {
        let mut header = [0u8; HEADER_SIZE];
        loop {
            if read_half.read_exact(&mut header).await.is_err() {
                break;
            }
            let (stream_id, frame_type, len) = match Frame::decode_header(&header) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "invalid mux frame header, closing session");
                    break;
                }
            };
            let mut payload = vec![0u8; len as usize];
            if read_half.read_exact(&mut payload).await.is_err() {
                break;
            }

            match frame_type {
                FrameType::Data => {
                    let senders = shared.streams.lock().unwrap();
                    if let Some(tx) = senders.get(&stream_id) {
                        let _ = tx.send(Bytes::from(payload));
                    } else {
                        debug!(stream_id, "data frame for unknown or closed stream dropped");
                    }
                }
                FrameType::Close => {
                    shared.streams.lock().unwrap().remove(&stream_id);
                }
            }
        }
        Self::close_shared(&shared);
    }

    fn close_shared(shared: &Shared) {
        shared.closed.store(true, Ordering::SeqCst);
        shared.streams.lock().unwrap().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Opens a new stream, returning an id the remote end is expected to demultiplex
    /// on its own. Fails once the session has observed the underlying connection
    /// close.
    pub fn open(&self) -> Result<MuxStream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::Closed);
        }

        let stream_id = self.shared.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let stream_id = if stream_id == 0 { 1 } else { stream_id };

        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.streams.lock().unwrap().insert(stream_id, tx);

        Ok(MuxStream {
            stream_id,
            inbound: rx,
            outbound: self.shared.outbound.clone(),
            closed: false,
        })
    }

    /// Closes the whole session; subsequent `open()` calls fail.
    pub fn close(&self) {
        Self::close_shared(&self.shared);
    }
}

impl MuxStream {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Sends one chunk of application bytes on this stream.
    pub fn send(&self, data: Bytes) -> Result<(), MuxError> {
        if self.closed {
            return Err(MuxError::Closed);
        }
        self.outbound
            .send(Frame::data(self.stream_id, data))
            .map_err(|_| MuxError::Closed)
    }

    /// Awaits the next inbound chunk. Returns `None` once the remote end has closed
    /// this stream or the session itself has gone away.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Half-closes this stream from the local side.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.outbound.send(Frame::close(self.stream_id));
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn open_stream_delivers_bytes_written_from_the_remote_side() {
        let (server_sock, client_sock) = connected_pair().await;
        let session = MuxSession::new(server_sock);

        let mut stream = session.open().unwrap();
        let id = stream.stream_id();

        // Simulate the remote multiplexer writing a Data frame back for this stream.
        let mut client_sock = client_sock;
        let reply = Frame::data(id, Bytes::from_static(b"hello")).encode().unwrap();
        client_sock.write_all(&reply).await.unwrap();

        let received = stream.recv().await.unwrap();
        assert_eq!(&received[..], b"hello");
    }

    #[tokio::test]
    async fn closing_the_session_fails_future_opens() {
        let (server_sock, client_sock) = connected_pair().await;
        let session = MuxSession::new(server_sock);
        drop(client_sock);

        // Give the reader task a chance to observe EOF.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(session.is_closed());
        assert!(matches!(session.open(), Err(MuxError::Closed)));
    }

    #[tokio::test]
    async fn stream_ids_never_reuse_the_reserved_zero_value() {
        let (server_sock, _client_sock) = connected_pair().await;
        let session = MuxSession::new(server_sock);
        for _ in 0..3 {
            let stream = session.open().unwrap();
            assert_ne!(stream.stream_id(), 0);
        }
    }
}
