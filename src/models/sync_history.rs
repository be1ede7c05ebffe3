//! Sync history entity model
//!
//! Append-only audit row written once per completed sync pass.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_history")]
pub struct Model {
    /// Sync identifier handed back by `trigger_sync`
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub user_id: Uuid,

    /// Credential used for the pass, absent when none was usable
    pub credential_id: Option<Uuid>,

    /// Overall status (`success` or `partial`)
    pub status: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub requested_categories: JsonValue,

    /// Map of category to its result (outcome and counts)
    #[sea_orm(column_type = "JsonBinary")]
    pub category_results: JsonValue,

    /// Structured error details, one object per failure
    #[sea_orm(column_type = "JsonBinary")]
    pub errors: JsonValue,

    pub started_at: DateTimeWithTimeZone,

    pub completed_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
