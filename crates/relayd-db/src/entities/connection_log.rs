//! Per-connection audit record. Not written by the data path today — the source this
//! system is modeled on does not specify connection-log writes there either — but the
//! table exists so a future auditing layer has somewhere to land without a schema
//! migration.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "connection_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub tunnel_id: Uuid,
    pub opened_at: ChronoDateTimeUtc,
    pub closed_at: Option<ChronoDateTimeUtc>,
    pub bytes_in: i64,
    pub bytes_out: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tunnel::Entity",
        from = "Column::TunnelId",
        to = "super::tunnel::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Tunnel,
}

impl Related<super::tunnel::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tunnel.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
