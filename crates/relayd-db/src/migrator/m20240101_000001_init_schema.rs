use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Clients::Table)
                    .if_not_exists()
                    .col(uuid(Clients::Id).primary_key())
                    .col(string(Clients::Name))
                    .col(string_len(Clients::TokenHash, 255).not_null().unique_key())
                    .col(integer(Clients::MaxTunnels).default(10))
                    .col(text_null(Clients::AllowedSubdomains))
                    .col(string(Clients::Status).default("active"))
                    .col(timestamp_with_time_zone(Clients::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Tunnels::Table)
                    .if_not_exists()
                    .col(uuid(Tunnels::Id).primary_key())
                    .col(uuid(Tunnels::ClientId))
                    .col(string_null(Tunnels::Subdomain))
                    .col(string(Tunnels::Protocol))
                    .col(string(Tunnels::LocalHost))
                    .col(integer(Tunnels::LocalPort))
                    .col(string_null(Tunnels::PublicUrl))
                    .col(integer_null(Tunnels::PublicPort))
                    .col(timestamp_with_time_zone(Tunnels::CreatedAt))
                    .col(timestamp_with_time_zone_null(Tunnels::ClosedAt))
                    .col(string(Tunnels::Status).default("active"))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tunnels_client_id")
                            .from(Tunnels::Table, Tunnels::ClientId)
                            .to(Clients::Table, Clients::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ConnectionLogs::Table)
                    .if_not_exists()
                    .col(pk_auto(ConnectionLogs::Id))
                    .col(uuid(ConnectionLogs::TunnelId))
                    .col(timestamp_with_time_zone(ConnectionLogs::OpenedAt))
                    .col(timestamp_with_time_zone_null(ConnectionLogs::ClosedAt))
                    .col(big_integer(ConnectionLogs::BytesIn).default(0))
                    .col(big_integer(ConnectionLogs::BytesOut).default(0))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_connection_logs_tunnel_id")
                            .from(ConnectionLogs::Table, ConnectionLogs::TunnelId)
                            .to(Tunnels::Table, Tunnels::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Partial unique indexes enforce invariants 1 and 2 (at most one active
        // tunnel per subdomain / per public port) at the storage layer, not just in
        // the in-memory Registry. sea-orm-migration's portable index builder has no
        // WHERE-clause support, so these are raw SQL.
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX idx_tunnels_active_subdomain \
                 ON tunnels (subdomain) WHERE status = 'active'",
            )
            .await?;
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX idx_tunnels_active_public_port \
                 ON tunnels (public_port) WHERE status = 'active'",
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ConnectionLogs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Tunnels::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Clients::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Clients {
    Table,
    Id,
    Name,
    TokenHash,
    MaxTunnels,
    AllowedSubdomains,
    Status,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Tunnels {
    Table,
    Id,
    ClientId,
    Subdomain,
    Protocol,
    LocalHost,
    LocalPort,
    PublicUrl,
    PublicPort,
    CreatedAt,
    ClosedAt,
    Status,
}

#[derive(DeriveIden)]
enum ConnectionLogs {
    Table,
    Id,
    TunnelId,
    OpenedAt,
    ClosedAt,
    BytesIn,
    BytesOut,
}
