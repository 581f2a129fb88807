//! Wiring for the relay process: connects the control plane, the registry, and both
//! ingress dispatchers. Split out of `main` so scenario tests can spawn a full server
//! against ephemeral ports without going through the CLI.

pub mod config;
pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use relayd_control::ControlSessionConfig;
use relayd_db::{Repository, SqliteRepository};
use relayd_ingress::{HttpIngress, TcpIngress};
use relayd_registry::{PortAllocator, Registry};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use config::ServerConfig;

/// A running server's bound addresses and the handles needed to tear it down. Dropping
/// this without calling `shutdown` leaves the spawned tasks running.
pub struct RunningServer {
    pub control_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub https_addr: Option<SocketAddr>,
    pub registry: Arc<Registry>,
    pub repository: Arc<dyn Repository>,
    control_handle: JoinHandle<()>,
    http_handle: JoinHandle<()>,
    https_handle: Option<JoinHandle<()>>,
}

impl RunningServer {
    /// Aborts the control and HTTP(S) accept loops. TCP ingress listeners are
    /// fire-and-forget tasks (matching `TcpIngress::spawn_listeners`'s own contract)
    /// and outlive this call; acceptable for a process-lifetime server and harmless in
    /// tests, where the listening ports die with the test binary.
    pub fn shutdown(self) {
        self.control_handle.abort();
        self.http_handle.abort();
        if let Some(handle) = self.https_handle {
            handle.abort();
        }
    }
}

pub async fn spawn(config: ServerConfig) -> Result<RunningServer> {
    let session_config = ControlSessionConfig {
        server_domain: config.domain.clone(),
        ..ControlSessionConfig::default()
    };
    spawn_with_session_config(config, session_config).await
}

/// Like `spawn`, but with an explicit `ControlSessionConfig` — the timeouts in
/// particular are worth shortening in a scenario test rather than waiting out the
/// production 30s deadlines.
pub async fn spawn_with_session_config(config: ServerConfig, session_config: ControlSessionConfig) -> Result<RunningServer> {
    let db = relayd_db::connect(&config.database_url).await.context("failed to connect to database")?;
    relayd_db::migrate(&db).await.context("failed to run database migrations")?;

    let repository: Arc<dyn Repository> = Arc::new(SqliteRepository::new(db));
    let closed = repository
        .close_all_active_tunnels()
        .await
        .context("failed to close stale tunnel rows at startup")?;
    if closed > 0 {
        info!(closed, "marked stale tunnel rows closed at startup");
    }

    let registry = Arc::new(Registry::new());
    let (port_start, port_end) = config.parse_tcp_port_range()?;
    let port_allocator = Arc::new(PortAllocator::new(port_start, port_end));

    let control_listener = TcpListener::bind(config.control_addr)
        .await
        .with_context(|| format!("failed to bind control plane address {}", config.control_addr))?;
    let control_addr = control_listener.local_addr()?;
    let control_handle = {
        let repository = repository.clone();
        let registry = registry.clone();
        let port_allocator = port_allocator.clone();
        tokio::spawn(async move {
            loop {
                match control_listener.accept().await {
                    Ok((socket, peer_addr)) => {
                        let repository = repository.clone();
                        let registry = registry.clone();
                        let port_allocator = port_allocator.clone();
                        let session_config = session_config.clone();
                        tokio::spawn(async move {
                            relayd_control::run(socket, peer_addr, repository, registry, port_allocator, session_config).await;
                        });
                    }
                    Err(e) => error!(error = %e, "control plane accept failed"),
                }
            }
        })
    };

    let http_listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind http address {}", config.http_addr))?;
    let http_addr = http_listener.local_addr()?;
    let http_ingress = Arc::new(HttpIngress::new(registry.clone(), config.domain.clone()));
    let http_handle = tokio::spawn(http_ingress.clone().serve_http(http_listener));

    let (https_addr, https_handle) = if let Some(https_addr) = config.https_addr {
        let cert_path = config.tls_cert.as_ref().context("--https-addr requires --tls-cert")?;
        let key_path = config.tls_key.as_ref().context("--https-addr requires --tls-key")?;
        let acceptor = tls::build_acceptor(cert_path, key_path)?;
        let https_listener = TcpListener::bind(https_addr)
            .await
            .with_context(|| format!("failed to bind https address {https_addr}"))?;
        let bound = https_listener.local_addr()?;
        info!(%bound, "https ingress listening");
        (Some(bound), Some(tokio::spawn(http_ingress.clone().serve_https(https_listener, acceptor))))
    } else {
        (None, None)
    };

    let tcp_ingress = Arc::new(TcpIngress::new(registry.clone()));
    tcp_ingress.spawn_listeners(port_start, port_end);

    info!(%http_addr, %control_addr, "relay server ready");

    Ok(RunningServer {
        control_addr,
        http_addr,
        https_addr,
        registry,
        repository,
        control_handle,
        http_handle,
        https_handle,
    })
}
