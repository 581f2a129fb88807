//! Durable client identity. Authoritative in storage; the core only ever reads it.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "clients")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub name: String,

    /// API token presented in the `auth` control message. Hashed at rest; lookups
    /// compare against the hash of the presented token, never the plaintext column.
    #[sea_orm(unique)]
    pub token_hash: String,

    pub max_tunnels: i32,

    /// Comma-separated allowlist of subdomains this client may request. Empty or
    /// NULL means any subdomain is permitted.
    #[sea_orm(column_type = "Text", nullable)]
    pub allowed_subdomains: Option<String>,

    /// "active" | "disabled"
    pub status: String,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::tunnel::Entity")]
    Tunnel,
}

impl Related<super::tunnel::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tunnel.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn allowed_subdomains_set(&self) -> HashSet<String> {
        self.allowed_subdomains
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}
