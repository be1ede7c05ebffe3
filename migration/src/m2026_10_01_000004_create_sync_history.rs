//! Migration to create the append-only sync_history table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncHistory::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncHistory::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncHistory::UserId).uuid().not_null())
                    .col(ColumnDef::new(SyncHistory::CredentialId).uuid().null())
                    .col(ColumnDef::new(SyncHistory::Status).text().not_null())
                    .col(
                        ColumnDef::new(SyncHistory::RequestedCategories)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncHistory::CategoryResults)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SyncHistory::Errors).json_binary().not_null())
                    .col(
                        ColumnDef::new(SyncHistory::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncHistory::CompletedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_history_user_started")
                    .table(SyncHistory::Table)
                    .col(SyncHistory::UserId)
                    .col(SyncHistory::StartedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_history_user_started")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(SyncHistory::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncHistory {
    Table,
    Id,
    UserId,
    CredentialId,
    Status,
    RequestedCategories,
    CategoryResults,
    Errors,
    StartedAt,
    CompletedAt,
}
