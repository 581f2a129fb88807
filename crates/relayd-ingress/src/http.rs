//! HTTP/HTTPS ingress: terminates the public connection, resolves the subdomain to a
//! tunnel binding, and forwards the raw HTTP/1.1 bytes over a mux stream.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use relayd_registry::Registry;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

const INITIAL_READ_SIZE: usize = 16 * 1024;

#[derive(Clone)]
pub struct HttpIngress {
    registry: Arc<Registry>,
    server_domain: String,
}

impl HttpIngress {
    pub fn new(registry: Arc<Registry>, server_domain: impl Into<String>) -> Self {
        Self {
            registry,
            server_domain: server_domain.into(),
        }
    }

    /// Accepts plain HTTP connections and dispatches each one.
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "http ingress accept failed");
                    continue;
                }
            };
            let ingress = self.clone();
            tokio::spawn(async move { ingress.handle_connection(socket, peer_addr).await });
        }
    }

    /// Accepts TLS connections with a pre-built acceptor and dispatches each one.
    pub async fn serve_https(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) {
        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "https ingress accept failed");
                    continue;
                }
            };
            let ingress = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor.accept(socket).await {
                    Ok(tls_stream) => ingress.handle_connection(tls_stream, peer_addr).await,
                    Err(e) => warn!(%peer_addr, error = %e, "tls handshake failed"),
                }
            });
        }
    }

    async fn handle_connection<S>(&self, mut stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; INITIAL_READ_SIZE];
        let n = match stream.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!(%peer_addr, error = %e, "failed to read initial request");
                return;
            }
        };
        buf.truncate(n);

        let request_text = String::from_utf8_lossy(&buf).into_owned();
        let path = request_text
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/")
            .to_string();

        let Some(host) = extract_host(&request_text) else {
            write_simple_response(&mut stream, 400, "Bad Request").await;
            return;
        };

        if path == "/health" {
            let body = serde_json::json!({ "status": "healthy", "tunnels": self.registry.count() }).to_string();
            write_json_response(&mut stream, &body).await;
            return;
        }

        let Some(subdomain) = extract_subdomain(&host, &self.server_domain) else {
            write_simple_response(&mut stream, 400, "Bad Request").await;
            return;
        };

        let Some(binding) = self.registry.get_by_subdomain(&subdomain) else {
            write_simple_response(&mut stream, 404, "Not Found").await;
            return;
        };

        let Some(session) = binding.mux_session() else {
            write_simple_response(&mut stream, 502, "Bad Gateway").await;
            return;
        };

        let mut mux_stream = match session.open() {
            Ok(mux_stream) => mux_stream,
            Err(e) => {
                debug!(error = %e, "mux open failed");
                write_simple_response(&mut stream, 502, "Bad Gateway").await;
                return;
            }
        };

        if mux_stream.send(Bytes::from(buf)).is_err() {
            write_simple_response(&mut stream, 502, "Bad Gateway").await;
            return;
        }

        forward(stream, mux_stream).await;
    }
}

/// Extracts the `Host:` header value, case-insensitively, from a raw request.
fn extract_host(request: &str) -> Option<String> {
    request
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("host:"))
        .and_then(|line| line.splitn(2, ':').nth(1))
        .map(|h| h.trim().to_string())
}

/// `host.example.com` under server domain `example.com` yields `host`. The host
/// equaling the server domain, or not ending with it, is rejected.
fn extract_subdomain(host: &str, server_domain: &str) -> Option<String> {
    let host_without_port = host.split(':').next().unwrap_or(host);
    if host_without_port == server_domain {
        return None;
    }
    let suffix = format!(".{server_domain}");
    host_without_port.strip_suffix(&suffix).map(|s| s.to_string())
}

fn is_streaming_response(buf: &[u8]) -> bool {
    let text = String::from_utf8_lossy(buf).to_ascii_lowercase();
    text.contains("text/event-stream") || text.contains("transfer-encoding: chunked") || text.contains("x-accel-buffering: no")
}

/// Pipes bytes bidirectionally between the public connection and the mux stream.
/// Whether the response looks streaming-sensitive is decided once, from the first
/// chunk that contains the end of the response headers; every subsequent chunk is
/// flushed immediately if so, left to the normal write buffering otherwise.
async fn forward<S>(mut client: S, mut mux_stream: relayd_mux::MuxStream)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; INITIAL_READ_SIZE];
    let mut sniffed = Vec::new();
    let mut streaming: Option<bool> = None;

    loop {
        tokio::select! {
            result = client.read(&mut client_buf) => {
                match result {
                    Ok(0) | Err(_) => {
                        mux_stream.close();
                        break;
                    }
                    Ok(n) => {
                        if mux_stream.send(Bytes::copy_from_slice(&client_buf[..n])).is_err() {
                            break;
                        }
                    }
                }
            }
            chunk = mux_stream.recv() => {
                let Some(data) = chunk else { break };

                if streaming.is_none() {
                    if sniffed.len() < INITIAL_READ_SIZE {
                        sniffed.extend_from_slice(&data);
                    }
                    if sniffed.windows(4).any(|w| w == b"\r\n\r\n") || sniffed.len() >= INITIAL_READ_SIZE {
                        streaming = Some(is_streaming_response(&sniffed));
                    }
                }

                if client.write_all(&data).await.is_err() {
                    break;
                }
                if streaming == Some(true) && client.flush().await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn write_simple_response<S: AsyncWrite + Unpin>(stream: &mut S, status: u16, reason: &str) {
    let body = reason;
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

async fn write_json_response<S: AsyncWrite + Unpin>(stream: &mut S, body: &str) {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
}
