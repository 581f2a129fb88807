//! Per-client control session: authenticate, provision tunnels, relay heartbeats,
//! and clean up on disconnect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use relayd_db::{Client as DbClient, Repository, Tunnel as DbTunnel};
use relayd_mux::MuxSession;
use relayd_proto::{CodecError, ControlCodec, ControlMessage, ErrorCode, MessageType, TunnelRequestPayload};
use relayd_registry::{PortAllocator, Registry, TunnelBinding};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ControlSessionError, MuxBrokerError};

#[derive(Debug, Clone)]
pub struct ControlSessionConfig {
    pub server_domain: String,
    pub auth_timeout: Duration,
    pub heartbeat_idle_timeout: Duration,
    pub mux_accept_timeout: Duration,
}

impl Default for ControlSessionConfig {
    fn default() -> Self {
        Self {
            server_domain: "tunnel.local".to_string(),
            auth_timeout: Duration::from_secs(30),
            heartbeat_idle_timeout: Duration::from_secs(60),
            mux_accept_timeout: Duration::from_secs(30),
        }
    }
}

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

async fn send(writer: &SharedWriter, msg: &ControlMessage) -> Result<(), CodecError> {
    let mut guard = writer.lock().await;
    ControlCodec::write(&mut *guard, msg).await
}

/// Drives one client connection end to end: authenticate, serve tunnel requests and
/// heartbeats until disconnect, then clean up everything the client owned.
pub async fn run(
    stream: TcpStream,
    peer_addr: SocketAddr,
    repository: Arc<dyn Repository>,
    registry: Arc<Registry>,
    port_allocator: Arc<PortAllocator>,
    config: ControlSessionConfig,
) {
    let (mut reader, writer) = stream.into_split();
    let writer: SharedWriter = Arc::new(Mutex::new(writer));

    let client = match authenticate(&mut reader, &writer, &repository, config.auth_timeout).await {
        Ok(client) => client,
        Err(e) => {
            debug!(%peer_addr, error = %e, "control session authentication failed");
            return;
        }
    };

    info!(client_id = %client.id, %peer_addr, "client authenticated");

    run_ready_loop(reader, writer, &client, &repository, &registry, &port_allocator, &config).await;

    cleanup_client(&client.id, &repository, &registry).await;
}

async fn authenticate(
    reader: &mut OwnedReadHalf,
    writer: &SharedWriter,
    repository: &Arc<dyn Repository>,
    auth_timeout: Duration,
) -> Result<DbClient, ControlSessionError> {
    let msg = timeout(auth_timeout, ControlCodec::read(reader))
        .await
        .map_err(|_| ControlSessionError::AuthTimeout)??;

    if msg.message_type != MessageType::Auth {
        send(
            writer,
            &ControlMessage::error(msg.request_id.clone(), ErrorCode::InvalidMessage, "expected auth message"),
        )
        .await
        .ok();
        return Err(ControlSessionError::InvalidToken);
    }

    let token = msg.payload_str("token").unwrap_or_default();
    if token.is_empty() {
        send(writer, &ControlMessage::auth_response_failed(msg.request_id, ErrorCode::InvalidToken, "missing token"))
            .await
            .ok();
        return Err(ControlSessionError::InvalidToken);
    }

    let found = repository.get_client_by_token(token).await?;

    let client = match found {
        Some(client) if client.is_active() => client,
        Some(_) => {
            send(
                writer,
                &ControlMessage::auth_response_failed(msg.request_id, ErrorCode::AuthFailed, "account is not active"),
            )
            .await
            .ok();
            return Err(ControlSessionError::ClientInactive);
        }
        None => {
            send(writer, &ControlMessage::auth_response_failed(msg.request_id, ErrorCode::AuthFailed, "unknown token"))
                .await
                .ok();
            return Err(ControlSessionError::AuthFailed);
        }
    };

    send(writer, &ControlMessage::auth_response_ok(msg.request_id, &client.id)).await?;
    Ok(client)
}

/// Serves requests until the client disconnects, a read fails, or no message of any
/// kind (heartbeat or otherwise) arrives within the idle window.
async fn run_ready_loop(
    mut reader: OwnedReadHalf,
    writer: SharedWriter,
    client: &DbClient,
    repository: &Arc<dyn Repository>,
    registry: &Arc<Registry>,
    port_allocator: &Arc<PortAllocator>,
    config: &ControlSessionConfig,
) {
    loop {
        let idle = tokio::time::sleep(config.heartbeat_idle_timeout);
        tokio::pin!(idle);

        tokio::select! {
            _ = &mut idle => {
                warn!(client_id = %client.id, "no activity within the idle window, closing session");
                return;
            }
            read_result = ControlCodec::read(&mut reader) => {
                let msg = match read_result {
                    Ok(msg) => msg,
                    Err(CodecError::ConnectionClosed) => {
                        debug!(client_id = %client.id, "client disconnected");
                        return;
                    }
                    Err(e) => {
                        warn!(client_id = %client.id, error = %e, "control read failed, closing session");
                        return;
                    }
                };

                match msg.message_type {
                    MessageType::Heartbeat => {
                        if let Err(e) = send(&writer, &ControlMessage::heartbeat(msg.request_id)).await {
                            warn!(client_id = %client.id, error = %e, "failed to answer heartbeat, closing session");
                            return;
                        }
                    }
                    MessageType::TunnelRequest | MessageType::TcpRequest | MessageType::GrpcRequest => {
                        if provision_tunnel(&msg, client, repository, registry, port_allocator, &writer, config)
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    MessageType::CloseConnection => {
                        if let Some(tunnel_id) = msg.payload_str("tunnel_id") {
                            registry.unregister(tunnel_id);
                            if let Err(e) = repository.close_tunnel(tunnel_id).await {
                                warn!(tunnel_id, error = %e, "failed to mark tunnel closed in repository");
                            }
                        }
                    }
                    other => {
                        debug!(client_id = %client.id, ?other, "unexpected message type in ready state");
                        send(&writer, &ControlMessage::error(msg.request_id, ErrorCode::InvalidMessage, "unexpected message type"))
                            .await
                            .ok();
                    }
                }
            }
        }
    }
}

/// Implements the provisioning contract: validate, check the allowlist, check
/// subdomain uniqueness, allocate identity/port, persist, register, respond, and
/// spawn mux establishment. Returns `Err` only when the response itself could not be
/// delivered, since that is the one failure the caller must treat as fatal to the
/// whole session; every other rejection is reported to the client as an `error`
/// message and the session continues.
async fn provision_tunnel(
    msg: &ControlMessage,
    client: &DbClient,
    repository: &Arc<dyn Repository>,
    registry: &Arc<Registry>,
    port_allocator: &Arc<PortAllocator>,
    writer: &SharedWriter,
    config: &ControlSessionConfig,
) -> Result<(), ()> {
    let request_id = msg.request_id.clone();

    let payload = match TunnelRequestPayload::from_message(msg) {
        Some(payload) => payload,
        None => {
            send(writer, &ControlMessage::error(request_id, ErrorCode::InvalidMessage, "malformed tunnel request"))
                .await
                .ok();
            return Ok(());
        }
    };

    if payload.protocol.is_http_family() && !client.allowed_subdomains.is_empty() {
        let subdomain = payload.subdomain.as_deref().unwrap_or_default();
        if !client.allowed_subdomains.contains(subdomain) {
            send(writer, &ControlMessage::error(request_id, ErrorCode::InvalidRequest, "subdomain not in allowlist"))
                .await
                .ok();
            return Ok(());
        }
    }

    if let Some(subdomain) = &payload.subdomain {
        match repository.get_tunnel_by_subdomain(subdomain).await {
            Ok(Some(_)) => {
                send(writer, &ControlMessage::error(request_id, ErrorCode::SubdomainTaken, "subdomain already in use"))
                    .await
                    .ok();
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "repository lookup failed while checking subdomain uniqueness");
                send(writer, &ControlMessage::error(request_id, ErrorCode::InternalError, "internal error"))
                    .await
                    .ok();
                return Ok(());
            }
        }
    }

    let tunnel_id = Uuid::new_v4().to_string();

    let (public_url, public_port) = if payload.protocol.is_http_family() {
        let subdomain = payload.subdomain.as_deref().unwrap_or_default();
        (Some(format!("https://{subdomain}.{}", config.server_domain)), None)
    } else {
        match port_allocator.allocate(registry, payload.public_port) {
            Ok(port) => (None, Some(port)),
            Err(e) => {
                warn!(error = %e, "port allocation failed");
                send(writer, &ControlMessage::error(request_id, ErrorCode::PortAllocationFailed, "no ports available"))
                    .await
                    .ok();
                return Ok(());
            }
        }
    };

    let db_tunnel = DbTunnel {
        id: tunnel_id.clone(),
        client_id: client.id.clone(),
        subdomain: payload.subdomain.clone(),
        protocol: payload.protocol.as_str().to_string(),
        local_host: payload.local_host.clone(),
        local_port: payload.local_port,
        public_url: public_url.clone(),
        public_port,
        status: "active".to_string(),
    };

    if let Err(e) = repository.create_tunnel(&db_tunnel).await {
        error!(error = %e, "failed to persist tunnel");
        send(writer, &ControlMessage::error(request_id, ErrorCode::InternalError, "internal error"))
            .await
            .ok();
        return Ok(());
    }

    let binding = Arc::new(TunnelBinding::new(
        tunnel_id.clone(),
        client.id.clone(),
        payload.subdomain.clone(),
        public_port,
        payload.protocol,
    ));

    if let Err(e) = registry.register(binding) {
        warn!(error = %e, "registry rejected the binding after a successful repository write, rolling back");
        if let Err(e) = repository.close_tunnel(&tunnel_id).await {
            warn!(error = %e, "failed to roll back repository row after registration failure");
        }
        send(writer, &ControlMessage::error(request_id, ErrorCode::RegistrationFailed, "registration failed"))
            .await
            .ok();
        return Ok(());
    }

    let response_type = msg
        .message_type
        .response_type()
        .expect("tunnel/tcp/grpc requests all have a matching response type");
    let response = ControlMessage::tunnel_response(request_id, response_type, &tunnel_id, public_url.as_deref(), public_port);

    if let Err(e) = send(writer, &response).await {
        warn!(error = %e, "failed to deliver tunnel response, tearing down and closing session");
        registry.unregister(&tunnel_id);
        repository.close_tunnel(&tunnel_id).await.ok();
        return Err(());
    }

    spawn_mux_establishment(tunnel_id, registry.clone(), writer.clone(), config.mux_accept_timeout);

    Ok(())
}

fn spawn_mux_establishment(tunnel_id: String, registry: Arc<Registry>, writer: SharedWriter, accept_timeout: Duration) {
    tokio::spawn(async move {
        if let Err(e) = establish_mux(&tunnel_id, &registry, &writer, accept_timeout).await {
            warn!(tunnel_id, error = %e, "mux establishment failed, tearing down tunnel");
            registry.unregister(&tunnel_id);
        }
    });
}

/// Implements the mux broker handshake (binds an ephemeral listener, tells the client
/// where to connect, accepts exactly one connection, and attaches it to the binding).
async fn establish_mux(
    tunnel_id: &str,
    registry: &Arc<Registry>,
    writer: &SharedWriter,
    accept_timeout: Duration,
) -> Result<(), MuxBrokerError> {
    let listener = TcpListener::bind("0.0.0.0:0").await?;
    let local_addr = listener.local_addr()?;

    let request_id = Uuid::new_v4().to_string();
    send(
        writer,
        &ControlMessage::new_connection(request_id, tunnel_id, local_addr.port(), &local_addr.ip().to_string()),
    )
    .await?;

    let (socket, _) = timeout(accept_timeout, listener.accept())
        .await
        .map_err(|_| MuxBrokerError::AcceptTimeout)??;

    let session = Arc::new(MuxSession::new(socket));
    registry.set_mux_session(tunnel_id, session)?;

    debug!(tunnel_id, "mux session established");
    Ok(())
}

/// Unregisters every binding the client owns and marks its durable rows closed.
/// Idempotent: calling this again for a client with nothing left to clean up is a
/// no-op. Does not wait for in-flight forwarding tasks to drain — closing each mux
/// session EOFs them and they exit on their own.
pub async fn cleanup_client(client_id: &str, repository: &Arc<dyn Repository>, registry: &Arc<Registry>) {
    let bindings = registry.get_by_client(client_id);
    for binding in &bindings {
        registry.unregister(&binding.tunnel_id);
    }

    match repository.get_active_tunnels_by_client(client_id).await {
        Ok(tunnels) => {
            for tunnel in tunnels {
                if let Err(e) = repository.close_tunnel(&tunnel.id).await {
                    warn!(client_id, tunnel_id = %tunnel.id, error = %e, "failed to close tunnel row during cleanup");
                }
            }
        }
        Err(e) => warn!(client_id, error = %e, "failed to enumerate active tunnels during cleanup"),
    }

    info!(client_id, tunnels_closed = bindings.len(), "client session cleaned up");
}
