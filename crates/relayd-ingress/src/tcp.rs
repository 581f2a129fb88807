//! TCP ingress: one listener per port in a configured range, forwarding raw bytes to
//! whatever tunnel the Registry has bound to that port. gRPC traffic is just TCP here
//! — no framing is imposed in either direction.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use relayd_registry::Registry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

const BUFFER_SIZE: usize = 16 * 1024;

pub struct TcpIngress {
    registry: Arc<Registry>,
}

impl TcpIngress {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Spawns one accept loop per port in `[start, end]`. Each loop runs until the
    /// process exits; a bind failure on one port logs and leaves the others running.
    pub fn spawn_listeners(self: Arc<Self>, start: u16, end: u16) {
        for port in start..=end {
            let ingress = self.clone();
            tokio::spawn(async move { ingress.listen_on(port).await });
        }
    }

    async fn listen_on(&self, port: u16) {
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(port, error = %e, "failed to bind tcp ingress listener");
                return;
            }
        };

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let registry = self.registry.clone();
                    tokio::spawn(async move { handle_connection(socket, peer_addr, port, registry).await });
                }
                Err(e) => warn!(port, error = %e, "tcp ingress accept failed"),
            }
        }
    }
}

async fn handle_connection(mut socket: TcpStream, peer_addr: SocketAddr, port: u16, registry: Arc<Registry>) {
    let Some(binding) = registry.get_by_port(port) else {
        debug!(port, %peer_addr, "no tunnel bound to this port, closing");
        return;
    };

    let Some(session) = binding.mux_session() else {
        debug!(port, %peer_addr, "tunnel has no mux session yet, closing");
        return;
    };

    let mut mux_stream = match session.open() {
        Ok(mux_stream) => mux_stream,
        Err(e) => {
            debug!(port, %peer_addr, error = %e, "mux open failed, closing");
            return;
        }
    };

    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        tokio::select! {
            result = socket.read(&mut buf) => {
                match result {
                    Ok(0) | Err(_) => {
                        mux_stream.close();
                        break;
                    }
                    Ok(n) => {
                        if mux_stream.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                }
            }
            chunk = mux_stream.recv() => {
                let Some(data) = chunk else { break };
                if socket.write_all(&data).await.is_err() {
                    break;
                }
            }
        }
    }
}
