//! Credential store
//!
//! Encrypted token pairs per user/account link. Tokens are encrypted on the
//! way in and decrypted on demand into [`Zeroizing`] strings, so plaintext only
//! lives for the single call that needs it. This is the only module that
//! touches the crypto primitives.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{CryptoKey, TokenBinding, TokenCipher};
use crate::error::AdsError;
use crate::models::credential::{self, Entity as Credential};

/// Token pair handed over by the consent handshake or a manual import.
#[derive(Clone)]
pub struct CredentialInput {
    pub user_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for CredentialInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialInput")
            .field("user_id", &self.user_id)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    db: Arc<DatabaseConnection>,
    cipher: TokenCipher,
    failure_threshold: u32,
}

fn timestamp(at: DateTime<Utc>) -> DateTimeWithTimeZone {
    at.into()
}

impl CredentialStore {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey, failure_threshold: u32) -> Self {
        Self {
            db,
            cipher: TokenCipher::new(crypto_key),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Store the first token pair for a new link and return its id.
    pub async fn create(&self, input: CredentialInput) -> Result<credential::Model, AdsError> {
        self.put(Uuid::new_v4(), input).await
    }

    /// Insert or replace the token pair for `link_id`. Replacing re-enables the
    /// record and clears its failure history, as after a reconnect.
    pub async fn put(
        &self,
        link_id: Uuid,
        input: CredentialInput,
    ) -> Result<credential::Model, AdsError> {
        let binding = TokenBinding::new(input.user_id, link_id);
        let access = self.cipher.seal(&binding, &input.access_token)?;
        let refresh = self.cipher.seal(&binding, &input.refresh_token)?;
        let now = timestamp(Utc::now());

        let record = credential::ActiveModel {
            id: Set(link_id),
            user_id: Set(input.user_id),
            access_token_ciphertext: Set(access),
            refresh_token_ciphertext: Set(refresh),
            expires_at: Set(timestamp(input.expires_at)),
            consecutive_refresh_failures: Set(0),
            last_error: Set(None),
            proactive_refresh_enabled: Set(true),
            last_refreshed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Credential::insert(record)
            .on_conflict(
                OnConflict::column(credential::Column::Id)
                    .update_columns([
                        credential::Column::UserId,
                        credential::Column::AccessTokenCiphertext,
                        credential::Column::RefreshTokenCiphertext,
                        credential::Column::ExpiresAt,
                        credential::Column::ConsecutiveRefreshFailures,
                        credential::Column::LastError,
                        credential::Column::ProactiveRefreshEnabled,
                        credential::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await?;

        info!(link_id = %link_id, user_id = %input.user_id, "Stored credential");
        self.get(link_id).await
    }

    pub async fn get(&self, link_id: Uuid) -> Result<credential::Model, AdsError> {
        Credential::find_by_id(link_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| AdsError::not_found("credential", link_id))
    }

    /// Most recently updated enabled credential of a user.
    pub async fn find_active_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<credential::Model>, AdsError> {
        Ok(Credential::find()
            .filter(credential::Column::UserId.eq(user_id))
            .filter(credential::Column::ProactiveRefreshEnabled.eq(true))
            .order_by_desc(credential::Column::UpdatedAt)
            .one(self.db.as_ref())
            .await?)
    }

    /// Users owning at least one enabled credential.
    pub async fn list_enabled_user_ids(&self) -> Result<Vec<Uuid>, AdsError> {
        Ok(Credential::find()
            .select_only()
            .column(credential::Column::UserId)
            .filter(credential::Column::ProactiveRefreshEnabled.eq(true))
            .distinct()
            .into_tuple::<Uuid>()
            .all(self.db.as_ref())
            .await?)
    }

    /// Enabled records expiring at or before `now + window`, soonest first.
    /// Served by the `(proactive_refresh_enabled, expires_at)` index.
    pub async fn list_expiring_within(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<credential::Model>, AdsError> {
        let horizon = timestamp(now + window);
        Ok(Credential::find()
            .filter(credential::Column::ProactiveRefreshEnabled.eq(true))
            .filter(credential::Column::ExpiresAt.lte(horizon))
            .order_by_asc(credential::Column::ExpiresAt)
            .all(self.db.as_ref())
            .await?)
    }

    pub fn access_token(&self, record: &credential::Model) -> Result<Zeroizing<String>, AdsError> {
        self.decrypt(record, &record.access_token_ciphertext)
    }

    pub fn refresh_token(&self, record: &credential::Model) -> Result<Zeroizing<String>, AdsError> {
        self.decrypt(record, &record.refresh_token_ciphertext)
    }

    fn decrypt(
        &self,
        record: &credential::Model,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<String>, AdsError> {
        let binding = TokenBinding::new(record.user_id, record.id);
        self.cipher.open(&binding, ciphertext).map_err(|e| {
            warn!(link_id = %record.id, user_id = %record.user_id, "Token decryption failed");
            AdsError::Crypto(e)
        })
    }

    /// Replace the token pair and expiry in one statement, resetting the
    /// failure counter. When `refresh_token` is `None` the stored one is kept.
    pub async fn record_refresh_success(
        &self,
        record: &credential::Model,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AdsError> {
        let binding = TokenBinding::new(record.user_id, record.id);
        let access = self.cipher.seal(&binding, access_token)?;
        let refresh = refresh_token
            .map(|token| self.cipher.seal(&binding, token))
            .transpose()?;
        let now = timestamp(Utc::now());

        let mut update = Credential::update_many()
            .col_expr(credential::Column::AccessTokenCiphertext, Expr::value(access))
            .col_expr(credential::Column::ExpiresAt, Expr::value(timestamp(expires_at)))
            .col_expr(credential::Column::ConsecutiveRefreshFailures, Expr::value(0))
            .col_expr(credential::Column::LastError, Expr::value(Option::<String>::None))
            .col_expr(credential::Column::LastRefreshedAt, Expr::value(now))
            .col_expr(credential::Column::UpdatedAt, Expr::value(now));
        if let Some(refresh) = refresh {
            update = update.col_expr(credential::Column::RefreshTokenCiphertext, Expr::value(refresh));
        }

        let result = update
            .filter(credential::Column::Id.eq(record.id))
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected == 0 {
            return Err(AdsError::not_found("credential", record.id));
        }
        Ok(())
    }

    /// Count a failed refresh. The record is disabled once the consecutive
    /// failure count reaches the threshold. Existing tokens are left intact.
    pub async fn mark_refresh_failure(
        &self,
        link_id: Uuid,
        error: &str,
    ) -> Result<credential::Model, AdsError> {
        let txn = self.db.begin().await?;
        let record = Credential::find_by_id(link_id)
            .one(&txn)
            .await?
            .ok_or_else(|| AdsError::not_found("credential", link_id))?;

        let failures = record.consecutive_refresh_failures.saturating_add(1);
        let disable = failures as u32 >= self.failure_threshold;

        let mut active: credential::ActiveModel = record.into();
        active.consecutive_refresh_failures = Set(failures);
        active.last_error = Set(Some(error.to_string()));
        if disable {
            active.proactive_refresh_enabled = Set(false);
        }
        active.updated_at = Set(timestamp(Utc::now()));
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        if disable {
            warn!(link_id = %link_id, failures, "Credential disabled after repeated refresh failures");
        }
        Ok(updated)
    }

    /// Disable a record that cannot recover without the user reconnecting.
    pub async fn disable(&self, link_id: Uuid, reason: &str) -> Result<(), AdsError> {
        let result = Credential::update_many()
            .col_expr(credential::Column::ProactiveRefreshEnabled, Expr::value(false))
            .col_expr(credential::Column::LastError, Expr::value(reason))
            .col_expr(credential::Column::UpdatedAt, Expr::value(timestamp(Utc::now())))
            .filter(credential::Column::Id.eq(link_id))
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected == 0 {
            return Err(AdsError::not_found("credential", link_id));
        }
        warn!(link_id = %link_id, reason, "Credential disabled, reconnect required");
        Ok(())
    }

    pub async fn re_enable(&self, link_id: Uuid) -> Result<(), AdsError> {
        let result = Credential::update_many()
            .col_expr(credential::Column::ProactiveRefreshEnabled, Expr::value(true))
            .col_expr(credential::Column::ConsecutiveRefreshFailures, Expr::value(0))
            .col_expr(credential::Column::LastError, Expr::value(Option::<String>::None))
            .col_expr(credential::Column::UpdatedAt, Expr::value(timestamp(Utc::now())))
            .filter(credential::Column::Id.eq(link_id))
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected == 0 {
            return Err(AdsError::not_found("credential", link_id));
        }
        Ok(())
    }

    /// Remove the record when the user disconnects.
    pub async fn delete(&self, link_id: Uuid) -> Result<(), AdsError> {
        let result = Credential::delete_by_id(link_id)
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected == 0 {
            return Err(AdsError::not_found("credential", link_id));
        }
        info!(link_id = %link_id, "Credential deleted");
        Ok(())
    }
}
