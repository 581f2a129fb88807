//! The durable row half of a tunnel; the other half is the in-memory
//! `TunnelBinding` the Registry holds while the tunnel is active.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnels")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub client_id: Uuid,

    /// Required for `http`/`https`, NULL for `tcp`/`grpc`.
    pub subdomain: Option<String>,

    /// "http" | "https" | "tcp" | "grpc"
    pub protocol: String,

    pub local_host: String,
    pub local_port: i32,

    /// Set for `http`/`https`; NULL for `tcp`/`grpc`.
    pub public_url: Option<String>,

    /// Set for `tcp`/`grpc`; NULL for `http`/`https`.
    pub public_port: Option<i32>,

    pub created_at: ChronoDateTimeUtc,
    pub closed_at: Option<ChronoDateTimeUtc>,

    /// "active" | "closed"
    pub status: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::client::Entity",
        from = "Column::ClientId",
        to = "super::client::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Client,
    #[sea_orm(has_many = "super::connection_log::Entity")]
    ConnectionLog,
}

impl Related<super::client::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Client.def()
    }
}

impl Related<super::connection_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ConnectionLog.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
