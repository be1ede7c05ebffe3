//! Credential entity model
//!
//! One row per user/account link. Token fields only ever hold AES-GCM
//! ciphertext; plaintext is produced by the credential store on demand.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "credentials")]
pub struct Model {
    /// Link identifier (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    pub access_token_ciphertext: Vec<u8>,

    pub refresh_token_ciphertext: Vec<u8>,

    /// Absolute expiry of the access token
    pub expires_at: DateTimeWithTimeZone,

    pub consecutive_refresh_failures: i32,

    /// Last refresh error text (cleared on success)
    pub last_error: Option<String>,

    /// False once the record is disabled and needs the user to reconnect
    pub proactive_refresh_enabled: bool,

    pub last_refreshed_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
