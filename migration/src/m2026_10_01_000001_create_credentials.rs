//! Migration to create the credentials table.
//!
//! Each row holds the encrypted token pair for one user/account link along with
//! the bookkeeping the refresh scheduler needs.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Credentials::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Credentials::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Credentials::UserId).uuid().not_null())
                    .col(
                        ColumnDef::new(Credentials::AccessTokenCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Credentials::RefreshTokenCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Credentials::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Credentials::ConsecutiveRefreshFailures)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Credentials::LastError).text().null())
                    .col(
                        ColumnDef::new(Credentials::ProactiveRefreshEnabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Credentials::LastRefreshedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Credentials::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Credentials::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Backs the "enabled and expiring before T" scan
        manager
            .create_index(
                Index::create()
                    .name("idx_credentials_enabled_expires_at")
                    .table(Credentials::Table)
                    .col(Credentials::ProactiveRefreshEnabled)
                    .col(Credentials::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_credentials_user_id")
                    .table(Credentials::Table)
                    .col(Credentials::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_credentials_enabled_expires_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_credentials_user_id").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Credentials::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Credentials {
    Table,
    Id,
    UserId,
    AccessTokenCiphertext,
    RefreshTokenCiphertext,
    ExpiresAt,
    ConsecutiveRefreshFailures,
    LastError,
    ProactiveRefreshEnabled,
    LastRefreshedAt,
    CreatedAt,
    UpdatedAt,
}
