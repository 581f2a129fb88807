//! The Repository interface the control session consumes during authentication and
//! tunnel provisioning, plus a SQLite-backed implementation of it.

use crate::entities::{client, tunnel};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("invalid id: {0}")]
    InvalidId(String),
}

/// Durable identity read during authentication. Read-only from the core's
/// perspective.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub max_tunnels: i32,
    pub allowed_subdomains: HashSet<String>,
    pub status: String,
}

impl Client {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// The durable half of a tunnel, mirrored by an in-memory `TunnelBinding` while
/// active.
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub id: String,
    pub client_id: String,
    pub subdomain: Option<String>,
    pub protocol: String,
    pub local_host: String,
    pub local_port: u16,
    pub public_url: Option<String>,
    pub public_port: Option<u16>,
    pub status: String,
}

/// Deterministic hash used both to store a client's token and to look it up by the
/// token a connecting client presents. SHA-256 rather than a salted password hash
/// because equality lookup on a high-entropy API token, not password verification,
/// is what's needed here.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_client_by_token(&self, token: &str) -> Result<Option<Client>, RepositoryError>;
    async fn create_tunnel(&self, tunnel: &Tunnel) -> Result<(), RepositoryError>;
    async fn get_tunnel_by_subdomain(&self, subdomain: &str) -> Result<Option<Tunnel>, RepositoryError>;
    async fn close_tunnel(&self, id: &str) -> Result<(), RepositoryError>;
    async fn get_active_tunnels_by_client(&self, client_id: &str) -> Result<Vec<Tunnel>, RepositoryError>;

    /// Marks every `active` tunnel row closed without touching the Registry, which
    /// has no entries yet at process start. Clients reconnect and re-provision; this
    /// only prevents stale rows from a previous process from shadowing fresh
    /// subdomain/port allocations under the partial unique indexes.
    async fn close_all_active_tunnels(&self) -> Result<u64, RepositoryError>;
}

pub struct SqliteRepository {
    db: DatabaseConnection,
}

impl SqliteRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn parse_uuid(id: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(id).map_err(|_| RepositoryError::InvalidId(id.to_string()))
}

impl From<client::Model> for Client {
    fn from(model: client::Model) -> Self {
        let allowed_subdomains = model.allowed_subdomains_set();
        Client {
            id: model.id.to_string(),
            name: model.name,
            max_tunnels: model.max_tunnels,
            allowed_subdomains,
            status: model.status,
        }
    }
}

impl From<tunnel::Model> for Tunnel {
    fn from(model: tunnel::Model) -> Self {
        Tunnel {
            id: model.id.to_string(),
            client_id: model.client_id.to_string(),
            subdomain: model.subdomain,
            protocol: model.protocol,
            local_host: model.local_host,
            local_port: model.local_port as u16,
            public_url: model.public_url,
            public_port: model.public_port.map(|p| p as u16),
            status: model.status,
        }
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn get_client_by_token(&self, token: &str) -> Result<Option<Client>, RepositoryError> {
        let hashed = hash_token(token);
        let model = client::Entity::find()
            .filter(client::Column::TokenHash.eq(hashed))
            .one(&self.db)
            .await?;
        Ok(model.map(Client::from))
    }

    async fn create_tunnel(&self, tunnel: &Tunnel) -> Result<(), RepositoryError> {
        let active = tunnel::ActiveModel {
            id: Set(parse_uuid(&tunnel.id)?),
            client_id: Set(parse_uuid(&tunnel.client_id)?),
            subdomain: Set(tunnel.subdomain.clone()),
            protocol: Set(tunnel.protocol.clone()),
            local_host: Set(tunnel.local_host.clone()),
            local_port: Set(tunnel.local_port as i32),
            public_url: Set(tunnel.public_url.clone()),
            public_port: Set(tunnel.public_port.map(|p| p as i32)),
            created_at: Set(Utc::now().into()),
            closed_at: Set(None),
            status: Set(tunnel.status.clone()),
        };
        active.insert(&self.db).await?;
        Ok(())
    }

    async fn get_tunnel_by_subdomain(&self, subdomain: &str) -> Result<Option<Tunnel>, RepositoryError> {
        let model = tunnel::Entity::find()
            .filter(tunnel::Column::Subdomain.eq(subdomain))
            .filter(tunnel::Column::Status.eq("active"))
            .one(&self.db)
            .await?;
        Ok(model.map(Tunnel::from))
    }

    async fn close_tunnel(&self, id: &str) -> Result<(), RepositoryError> {
        let uuid = parse_uuid(id)?;
        if let Some(model) = tunnel::Entity::find_by_id(uuid).one(&self.db).await? {
            let mut active: tunnel::ActiveModel = model.into();
            active.status = Set("closed".to_string());
            active.closed_at = Set(Some(Utc::now().into()));
            active.update(&self.db).await?;
        }
        Ok(())
    }

    async fn get_active_tunnels_by_client(&self, client_id: &str) -> Result<Vec<Tunnel>, RepositoryError> {
        let uuid = parse_uuid(client_id)?;
        let models = tunnel::Entity::find()
            .filter(tunnel::Column::ClientId.eq(uuid))
            .filter(tunnel::Column::Status.eq("active"))
            .all(&self.db)
            .await?;
        Ok(models.into_iter().map(Tunnel::from).collect())
    }

    async fn close_all_active_tunnels(&self) -> Result<u64, RepositoryError> {
        let active = tunnel::Entity::find()
            .filter(tunnel::Column::Status.eq("active"))
            .all(&self.db)
            .await?;
        let count = active.len() as u64;
        for model in active {
            let mut active_model: tunnel::ActiveModel = model.into();
            active_model.status = Set("closed".to_string());
            active_model.closed_at = Set(Some(Utc::now().into()));
            active_model.update(&self.db).await?;
        }
        Ok(count)
    }
}
