//! SQLite-backed Repository implementation: entities, migrations, and connection
//! setup for the persisted half of the tunnel data model.

pub mod entities;
pub mod migrator;
pub mod repository;

pub use repository::{hash_token, Client, Repository, RepositoryError, SqliteRepository, Tunnel};

use sea_orm::{Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;
use tracing::info;

pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    info!(database_url, "connecting to tunnel database");
    Database::connect(database_url).await
}

pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    migrator::Migrator::up(db, None).await
}
