//! Migration to create the account_relationships table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AccountRelationships::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AccountRelationships::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(AccountRelationships::ParentAccountId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AccountRelationships::ChildAccountId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(AccountRelationships::Kind).text().not_null())
                    .col(
                        ColumnDef::new(AccountRelationships::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_account_relationships_parent")
                            .from(
                                AccountRelationships::Table,
                                AccountRelationships::ParentAccountId,
                            )
                            .to(Accounts::Table, Accounts::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_account_relationships_child")
                            .from(
                                AccountRelationships::Table,
                                AccountRelationships::ChildAccountId,
                            )
                            .to(Accounts::Table, Accounts::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_account_relationships_edge")
                    .table(AccountRelationships::Table)
                    .col(AccountRelationships::ParentAccountId)
                    .col(AccountRelationships::ChildAccountId)
                    .col(AccountRelationships::Kind)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Reverse lookups (parents of an account)
        manager
            .create_index(
                Index::create()
                    .name("idx_account_relationships_child")
                    .table(AccountRelationships::Table)
                    .col(AccountRelationships::ChildAccountId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_account_relationships_edge")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_account_relationships_child")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(AccountRelationships::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AccountRelationships {
    Table,
    Id,
    ParentAccountId,
    ChildAccountId,
    Kind,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Accounts {
    Table,
    Id,
}
