//! Migration to create the accounts table.
//!
//! Accounts are the normalized advertising, DSP and AMC records produced by
//! synchronization. The external identifier is unique per user and category.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Accounts::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Accounts::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Accounts::UserId).uuid().not_null())
                    .col(ColumnDef::new(Accounts::Category).text().not_null())
                    .col(ColumnDef::new(Accounts::ExternalId).text().not_null())
                    .col(ColumnDef::new(Accounts::DisplayName).text().not_null())
                    .col(
                        ColumnDef::new(Accounts::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(Accounts::Metadata).json_binary().not_null())
                    .col(
                        ColumnDef::new(Accounts::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Accounts::SyncStatus)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Accounts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Accounts::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_accounts_user_category_external")
                    .table(Accounts::Table)
                    .col(Accounts::UserId)
                    .col(Accounts::Category)
                    .col(Accounts::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_accounts_user_category_external")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Accounts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Accounts {
    Table,
    Id,
    UserId,
    Category,
    ExternalId,
    DisplayName,
    Status,
    Metadata,
    LastSyncedAt,
    SyncStatus,
    CreatedAt,
    UpdatedAt,
}
