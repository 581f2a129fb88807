use std::net::SocketAddr;

use clap::Parser;

/// Bind addresses, server domain, TCP port range, and storage/TLS paths for a running
/// relay process. Constructible either from CLI flags or directly as a struct literal
/// from an embedding test.
#[derive(Parser, Debug, Clone)]
#[command(name = "relayd-server")]
#[command(about = "Run a tunnel relay server", long_about = None)]
pub struct ServerConfig {
    /// Control plane bind address for tunnel clients.
    #[arg(long, env = "RELAYD_CONTROL_ADDR", default_value = "0.0.0.0:4443")]
    pub control_addr: SocketAddr,

    /// HTTP ingress bind address.
    #[arg(long, env = "RELAYD_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub http_addr: SocketAddr,

    /// HTTPS ingress bind address. Requires `--tls-cert` and `--tls-key`.
    #[arg(long, env = "RELAYD_HTTPS_ADDR")]
    pub https_addr: Option<SocketAddr>,

    /// TLS certificate, PEM format.
    #[arg(long, env = "RELAYD_TLS_CERT")]
    pub tls_cert: Option<String>,

    /// TLS private key, PEM format.
    #[arg(long, env = "RELAYD_TLS_KEY")]
    pub tls_key: Option<String>,

    /// Public domain this relay answers for; subdomains are minted as `{name}.{domain}`.
    #[arg(long, env = "RELAYD_DOMAIN", default_value = "localhost")]
    pub domain: String,

    /// TCP port range for raw TCP/gRPC tunnels, "start-end".
    #[arg(long, env = "RELAYD_TCP_PORT_RANGE", default_value = "10000-20000")]
    pub tcp_port_range: String,

    /// SQLite database URL.
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite::memory:")]
    pub database_url: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "RELAYD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl ServerConfig {
    pub fn parse_tcp_port_range(&self) -> anyhow::Result<(u16, u16)> {
        let (start, end) = self
            .tcp_port_range
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("invalid --tcp-port-range {:?}, expected \"start-end\"", self.tcp_port_range))?;
        Ok((start.trim().parse()?, end.trim().parse()?))
    }
}
