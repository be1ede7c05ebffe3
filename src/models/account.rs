//! Account entity model
//!
//! Normalized record for one advertising account, DSP advertiser or AMC
//! instance. `category`, `status` and `sync_status` hold the string forms of
//! [`AccountCategory`], [`AccountStatus`] and [`AccountSyncStatus`].

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{AccountCategory, AccountStatus, AccountSyncStatus, UnknownVariant};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "accounts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub user_id: Uuid,

    pub category: String,

    /// Amazon-side identifier, unique per (user, category)
    pub external_id: String,

    pub display_name: String,

    pub status: String,

    /// Category-specific payload (country profiles, seats, linked advertisers)
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: JsonValue,

    pub last_synced_at: Option<DateTimeWithTimeZone>,

    pub sync_status: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn category(&self) -> Result<AccountCategory, UnknownVariant> {
        self.category.parse()
    }

    pub fn status(&self) -> Result<AccountStatus, UnknownVariant> {
        self.status.parse()
    }

    pub fn sync_status(&self) -> Result<AccountSyncStatus, UnknownVariant> {
        self.sync_status.parse()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
