//! Database migrations for the ads-connect service.

pub use sea_orm_migration::prelude::*;

mod m2026_10_01_000001_create_credentials;
mod m2026_10_01_000002_create_accounts;
mod m2026_10_01_000003_create_account_relationships;
mod m2026_10_01_000004_create_sync_history;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_10_01_000001_create_credentials::Migration),
            Box::new(m2026_10_01_000002_create_accounts::Migration),
            Box::new(m2026_10_01_000003_create_account_relationships::Migration),
            Box::new(m2026_10_01_000004_create_sync_history::Migration),
        ]
    }
}
