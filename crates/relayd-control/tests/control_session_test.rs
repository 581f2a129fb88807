//! End-to-end tests driving a real `relayd_control::run` session over a loopback TCP
//! connection, backed by an in-memory fake `Repository`.

use async_trait::async_trait;
use relayd_control::ControlSessionConfig;
use relayd_db::{Client, Repository, RepositoryError, Tunnel};
use relayd_proto::{ControlCodec, ControlMessage, MessageType, Protocol};
use relayd_registry::{PortAllocator, Registry};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

struct FakeRepository {
    clients_by_token: HashMap<String, Client>,
    tunnels: Mutex<HashMap<String, Tunnel>>,
}

impl FakeRepository {
    fn with_client(token: &str, client: Client) -> Self {
        let mut clients_by_token = HashMap::new();
        clients_by_token.insert(token.to_string(), client);
        Self {
            clients_by_token,
            tunnels: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Repository for FakeRepository {
    async fn get_client_by_token(&self, token: &str) -> Result<Option<Client>, RepositoryError> {
        Ok(self.clients_by_token.get(token).cloned())
    }

    async fn create_tunnel(&self, tunnel: &Tunnel) -> Result<(), RepositoryError> {
        self.tunnels.lock().unwrap().insert(tunnel.id.clone(), tunnel.clone());
        Ok(())
    }

    async fn get_tunnel_by_subdomain(&self, subdomain: &str) -> Result<Option<Tunnel>, RepositoryError> {
        Ok(self
            .tunnels
            .lock()
            .unwrap()
            .values()
            .find(|t| t.subdomain.as_deref() == Some(subdomain) && t.status == "active")
            .cloned())
    }

    async fn close_tunnel(&self, id: &str) -> Result<(), RepositoryError> {
        if let Some(tunnel) = self.tunnels.lock().unwrap().get_mut(id) {
            tunnel.status = "closed".to_string();
        }
        Ok(())
    }

    async fn get_active_tunnels_by_client(&self, client_id: &str) -> Result<Vec<Tunnel>, RepositoryError> {
        Ok(self
            .tunnels
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.client_id == client_id && t.status == "active")
            .cloned()
            .collect())
    }

    async fn close_all_active_tunnels(&self) -> Result<u64, RepositoryError> {
        let mut tunnels = self.tunnels.lock().unwrap();
        let mut count = 0;
        for tunnel in tunnels.values_mut() {
            if tunnel.status == "active" {
                tunnel.status = "closed".to_string();
                count += 1;
            }
        }
        Ok(count)
    }
}

fn active_client(id: &str) -> Client {
    Client {
        id: id.to_string(),
        name: "test client".to_string(),
        max_tunnels: 10,
        allowed_subdomains: HashSet::new(),
        status: "active".to_string(),
    }
}

/// Reads messages off the control stream until one matching `request_id` arrives,
/// discarding any push messages (like `new_connection`) that race ahead of it — the
/// same request_id-based correlation a real client performs.
async fn read_response_for(stream: &mut TcpStream, request_id: &str) -> ControlMessage {
    loop {
        let msg = ControlCodec::read(stream).await.unwrap();
        if msg.request_id == request_id {
            return msg;
        }
    }
}

async fn spawn_session(repository: Arc<dyn Repository>, registry: Arc<Registry>) -> TcpStream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let allocator = Arc::new(PortAllocator::new(31000, 31010));
    let config = ControlSessionConfig {
        auth_timeout: Duration::from_secs(5),
        heartbeat_idle_timeout: Duration::from_secs(5),
        mux_accept_timeout: Duration::from_secs(2),
        ..ControlSessionConfig::default()
    };

    tokio::spawn(async move {
        let (socket, peer_addr) = listener.accept().await.unwrap();
        relayd_control::run(socket, peer_addr, repository, registry, allocator, config).await;
    });

    TcpStream::connect(addr).await.unwrap()
}

#[tokio::test]
async fn unknown_token_is_rejected_with_auth_failed_and_session_closes() {
    let repository: Arc<dyn Repository> = Arc::new(FakeRepository::with_client("good-token", active_client("c1")));
    let registry = Arc::new(Registry::new());
    let mut client_sock = spawn_session(repository, registry).await;

    ControlCodec::write(&mut client_sock, &ControlMessage::auth("r1", "wrong-token"))
        .await
        .unwrap();
    let response = ControlCodec::read(&mut client_sock).await.unwrap();
    assert_eq!(response.message_type, MessageType::AuthResponse);
    assert_eq!(response.payload.get("success").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(response.payload.get("code").and_then(|v| v.as_str()), Some("AUTH_FAILED"));

    let after = ControlCodec::read(&mut client_sock).await;
    assert!(after.is_err());
}

#[tokio::test]
async fn missing_token_is_rejected_with_invalid_token_and_session_closes() {
    let repository: Arc<dyn Repository> = Arc::new(FakeRepository::with_client("good-token", active_client("c1")));
    let registry = Arc::new(Registry::new());
    let mut client_sock = spawn_session(repository, registry).await;

    ControlCodec::write(&mut client_sock, &ControlMessage::new(MessageType::Auth, "r1", serde_json::json!({})))
        .await
        .unwrap();
    let response = ControlCodec::read(&mut client_sock).await.unwrap();
    assert_eq!(response.message_type, MessageType::AuthResponse);
    assert_eq!(response.payload.get("success").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(response.payload.get("code").and_then(|v| v.as_str()), Some("INVALID_TOKEN"));

    let after = ControlCodec::read(&mut client_sock).await;
    assert!(after.is_err());
}

#[tokio::test]
async fn tcp_tunnel_request_allocates_a_port_and_registers_a_binding() {
    let repository: Arc<dyn Repository> = Arc::new(FakeRepository::with_client("good-token", active_client("c1")));
    let registry = Arc::new(Registry::new());
    let mut client_sock = spawn_session(repository, registry.clone()).await;

    ControlCodec::write(&mut client_sock, &ControlMessage::auth("r1", "good-token"))
        .await
        .unwrap();
    let auth_response = read_response_for(&mut client_sock, "r1").await;
    assert_eq!(auth_response.payload.get("success").and_then(|v| v.as_bool()), Some(true));

    let request = ControlMessage::new(
        MessageType::TcpRequest,
        "r2",
        serde_json::json!({ "subdomain": "ssh-box", "local_port": 22 }),
    );
    ControlCodec::write(&mut client_sock, &request).await.unwrap();

    let response = read_response_for(&mut client_sock, "r2").await;
    assert_eq!(response.message_type, MessageType::TcpResponse);
    let port = response.payload.get("public_port").and_then(|v| v.as_u64()).unwrap();
    assert!((31000..=31010).contains(&port));

    let binding = registry.get_by_port(port as u16).unwrap();
    assert_eq!(binding.protocol, Protocol::Tcp);
    assert_eq!(binding.client_id, "c1");
}

#[tokio::test]
async fn duplicate_subdomain_is_reported_as_an_error_without_closing_the_session() {
    let repository: Arc<dyn Repository> = Arc::new(FakeRepository::with_client("good-token", active_client("c1")));
    let registry = Arc::new(Registry::new());
    let mut client_sock = spawn_session(repository, registry).await;

    ControlCodec::write(&mut client_sock, &ControlMessage::auth("r1", "good-token"))
        .await
        .unwrap();
    read_response_for(&mut client_sock, "r1").await;

    let first = ControlMessage::new(
        MessageType::TunnelRequest,
        "r2",
        serde_json::json!({ "subdomain": "myapp", "protocol": "http", "local_port": 3000 }),
    );
    ControlCodec::write(&mut client_sock, &first).await.unwrap();
    let first_response = read_response_for(&mut client_sock, "r2").await;
    assert_eq!(first_response.message_type, MessageType::TunnelResponse);

    let second = ControlMessage::new(
        MessageType::TunnelRequest,
        "r3",
        serde_json::json!({ "subdomain": "myapp", "protocol": "http", "local_port": 3001 }),
    );
    ControlCodec::write(&mut client_sock, &second).await.unwrap();
    let second_response = read_response_for(&mut client_sock, "r3").await;
    assert_eq!(second_response.message_type, MessageType::Error);
    assert_eq!(
        second_response.payload.get("code").and_then(|v| v.as_str()),
        Some("SUBDOMAIN_TAKEN")
    );

    // The session is still alive after a rejected request.
    ControlCodec::write(&mut client_sock, &ControlMessage::heartbeat("r4"))
        .await
        .unwrap();
    let heartbeat_reply = read_response_for(&mut client_sock, "r4").await;
    assert_eq!(heartbeat_reply.message_type, MessageType::Heartbeat);
}
