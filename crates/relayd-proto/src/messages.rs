//! Control channel message types.
//!
//! A control message is a JSON object `{type, request_id, payload, timestamp}`. `type`
//! selects a fixed vocabulary of message kinds; `payload` is a free-form object whose
//! recognized keys depend on `type`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// The fixed vocabulary of control message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Auth,
    AuthResponse,
    TunnelRequest,
    TunnelResponse,
    TcpRequest,
    TcpResponse,
    GrpcRequest,
    GrpcResponse,
    NewConnection,
    CloseConnection,
    Heartbeat,
    Error,
}

impl MessageType {
    /// The response type that answers a request of this type, if any.
    pub fn response_type(self) -> Option<MessageType> {
        match self {
            MessageType::TunnelRequest => Some(MessageType::TunnelResponse),
            MessageType::TcpRequest => Some(MessageType::TcpResponse),
            MessageType::GrpcRequest => Some(MessageType::GrpcResponse),
            _ => None,
        }
    }
}

/// A single control channel frame: `{type, request_id, payload, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub request_id: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn obj(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Value {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert(k.to_string(), v);
    }
    Value::Object(map)
}

impl ControlMessage {
    pub fn new(message_type: MessageType, request_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type,
            request_id: request_id.into(),
            payload,
            timestamp: now_secs(),
        }
    }

    pub fn auth(request_id: impl Into<String>, token: &str) -> Self {
        Self::new(
            MessageType::Auth,
            request_id,
            obj([("token", Value::String(token.to_string()))]),
        )
    }

    pub fn auth_response_ok(request_id: impl Into<String>, client_id: &str) -> Self {
        Self::new(
            MessageType::AuthResponse,
            request_id,
            obj([
                ("success", Value::Bool(true)),
                ("client_id", Value::String(client_id.to_string())),
            ]),
        )
    }

    pub fn auth_response_failed(request_id: impl Into<String>, code: ErrorCode, message: &str) -> Self {
        Self::new(
            MessageType::AuthResponse,
            request_id,
            obj([
                ("success", Value::Bool(false)),
                ("code", Value::String(code.as_str().to_string())),
                ("message", Value::String(message.to_string())),
            ]),
        )
    }

    pub fn tunnel_response(
        request_id: impl Into<String>,
        message_type: MessageType,
        tunnel_id: &str,
        public_url: Option<&str>,
        public_port: Option<u16>,
    ) -> Self {
        let mut pairs: Vec<(&'static str, Value)> = vec![
            ("tunnel_id", Value::String(tunnel_id.to_string())),
            ("status", Value::String("active".to_string())),
        ];
        if let Some(url) = public_url {
            pairs.push(("public_url", Value::String(url.to_string())));
        }
        if let Some(port) = public_port {
            pairs.push(("public_port", Value::from(port)));
        }
        Self::new(message_type, request_id, obj(pairs))
    }

    pub fn new_connection(
        request_id: impl Into<String>,
        tunnel_id: &str,
        mux_port: u16,
        mux_addr: &str,
    ) -> Self {
        Self::new(
            MessageType::NewConnection,
            request_id,
            obj([
                ("action", Value::String("establish_mux".to_string())),
                ("tunnel_id", Value::String(tunnel_id.to_string())),
                ("mux_port", Value::from(mux_port)),
                ("mux_addr", Value::String(mux_addr.to_string())),
            ]),
        )
    }

    pub fn heartbeat(request_id: impl Into<String>) -> Self {
        Self::new(
            MessageType::Heartbeat,
            request_id,
            obj([("timestamp", Value::from(now_secs()))]),
        )
    }

    pub fn error(request_id: impl Into<String>, code: ErrorCode, message: &str) -> Self {
        Self::new(
            MessageType::Error,
            request_id,
            obj([
                ("code", Value::String(code.as_str().to_string())),
                ("message", Value::String(message.to_string())),
            ]),
        )
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn payload_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }
}

/// The stable wire error codes surfaced in `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidMessage,
    InvalidToken,
    AuthFailed,
    InvalidRequest,
    SubdomainTaken,
    PortAllocationFailed,
    RegistrationFailed,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::SubdomainTaken => "SUBDOMAIN_TAKEN",
            ErrorCode::PortAllocationFailed => "PORT_ALLOCATION_FAILED",
            ErrorCode::RegistrationFailed => "REGISTRATION_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Tunnel protocol, normalized to lowercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Tcp,
    Grpc,
}

impl Protocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            "tcp" => Some(Protocol::Tcp),
            "grpc" => Some(Protocol::Grpc),
            _ => None,
        }
    }

    pub fn is_http_family(self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tcp => "tcp",
            Protocol::Grpc => "grpc",
        }
    }
}

/// A parsed, validated tunnel request extracted from a `tunnel_request`/`tcp_request`/
/// `grpc_request` message's payload.
#[derive(Debug, Clone)]
pub struct TunnelRequestPayload {
    pub subdomain: Option<String>,
    pub protocol: Protocol,
    pub local_host: String,
    pub local_port: u16,
    pub public_port: Option<u16>,
}

impl TunnelRequestPayload {
    /// Parse and validate a request payload for the given message type. Returns `None`
    /// (to be surfaced as `INVALID_MESSAGE`) when required fields are missing or
    /// wrong-typed.
    pub fn from_message(msg: &ControlMessage) -> Option<Self> {
        let protocol = match msg.message_type {
            MessageType::TunnelRequest => {
                Protocol::parse(msg.payload_str("protocol")?).filter(|p| p.is_http_family())?
            }
            MessageType::TcpRequest => Protocol::Tcp,
            MessageType::GrpcRequest => Protocol::Grpc,
            _ => return None,
        };

        let local_port = msg.payload_u64("local_port")?;
        if local_port == 0 || local_port > u16::MAX as u64 {
            return None;
        }

        // Required on the wire for every request type, including tcp/grpc — those
        // protocols route by port, not subdomain, but the subdomain is still stored
        // as the tunnel's label and participates in the registry's subdomain
        // uniqueness check like any other tunnel.
        let subdomain = msg.payload_str("subdomain").map(|s| s.to_string());
        if subdomain.as_deref().unwrap_or("").is_empty() {
            return None;
        }

        let local_host = msg
            .payload_str("local_host")
            .filter(|s| !s.is_empty())
            .unwrap_or("localhost")
            .to_string();

        let public_port = msg
            .payload
            .get("public_port")
            .and_then(Value::as_u64)
            .map(|p| p as u16);

        Some(Self {
            subdomain,
            protocol,
            local_host,
            local_port: local_port as u16,
            public_port,
        })
    }
}
