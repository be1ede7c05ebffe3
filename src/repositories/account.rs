//! Account repository: upsert-by-external-id for synced accounts plus the
//! explicit disconnect path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapters::NormalizedAccount;
use crate::error::AdsError;
use crate::models::account::{self, Entity as Account};
use crate::models::account_relationship::{self, Entity as AccountRelationship};
use crate::models::{AccountCategory, AccountSyncStatus};

#[derive(Debug, Clone)]
pub struct AccountRepository {
    db: Arc<DatabaseConnection>,
}

impl AccountRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Insert a new account or update the existing one with the same
    /// `(user, category, external_id)`. Returns the stored row and whether it
    /// was inserted.
    pub async fn upsert_by_external_id(
        &self,
        user_id: Uuid,
        account: &NormalizedAccount,
        synced_at: DateTime<Utc>,
    ) -> Result<(account::Model, bool), AdsError> {
        let existing = self
            .find_in_category(user_id, account.category, &account.external_id)
            .await?;
        let inserted = existing.is_none();
        let now: DateTimeWithTimeZone = synced_at.into();

        let row = account::ActiveModel {
            id: Set(existing.as_ref().map_or_else(Uuid::new_v4, |a| a.id)),
            user_id: Set(user_id),
            category: Set(account.category.as_str().to_string()),
            external_id: Set(account.external_id.clone()),
            display_name: Set(account.display_name.clone()),
            status: Set(account.status.as_str().to_string()),
            metadata: Set(account.metadata.clone()),
            last_synced_at: Set(Some(now)),
            sync_status: Set(AccountSyncStatus::Completed.as_str().to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Account::insert(row)
            .on_conflict(
                OnConflict::columns([
                    account::Column::UserId,
                    account::Column::Category,
                    account::Column::ExternalId,
                ])
                .update_columns([
                    account::Column::DisplayName,
                    account::Column::Status,
                    account::Column::Metadata,
                    account::Column::LastSyncedAt,
                    account::Column::SyncStatus,
                    account::Column::UpdatedAt,
                ])
                .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await?;

        let stored = self
            .find_in_category(user_id, account.category, &account.external_id)
            .await?
            .ok_or_else(|| AdsError::not_found("account", &account.external_id))?;

        debug!(
            account_id = %stored.id,
            category = %account.category,
            inserted,
            "Upserted account"
        );
        Ok((stored, inserted))
    }

    pub async fn find_in_category(
        &self,
        user_id: Uuid,
        category: AccountCategory,
        external_id: &str,
    ) -> Result<Option<account::Model>, AdsError> {
        Ok(Account::find()
            .filter(account::Column::UserId.eq(user_id))
            .filter(account::Column::Category.eq(category.as_str()))
            .filter(account::Column::ExternalId.eq(external_id))
            .one(self.db.as_ref())
            .await?)
    }

    /// Resolve an external id against the given categories, in order.
    pub async fn find_by_external_id(
        &self,
        user_id: Uuid,
        categories: &[AccountCategory],
        external_id: &str,
    ) -> Result<Option<account::Model>, AdsError> {
        for category in categories {
            if let Some(found) = self.find_in_category(user_id, *category, external_id).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    pub async fn get(&self, account_id: Uuid) -> Result<account::Model, AdsError> {
        Account::find_by_id(account_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| AdsError::not_found("account", account_id))
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<account::Model>, AdsError> {
        Ok(Account::find()
            .filter(account::Column::UserId.eq(user_id))
            .order_by_asc(account::Column::Category)
            .order_by_asc(account::Column::ExternalId)
            .all(self.db.as_ref())
            .await?)
    }

    /// Set the sync status of every account of one category for a user.
    pub async fn mark_category_sync_status(
        &self,
        user_id: Uuid,
        category: AccountCategory,
        status: AccountSyncStatus,
    ) -> Result<u64, AdsError> {
        let result = Account::update_many()
            .col_expr(account::Column::SyncStatus, Expr::value(status.as_str()))
            .col_expr(
                account::Column::UpdatedAt,
                Expr::value(DateTimeWithTimeZone::from(Utc::now())),
            )
            .filter(account::Column::UserId.eq(user_id))
            .filter(account::Column::Category.eq(category.as_str()))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected)
    }

    /// Settle accounts of a category that the pass did not touch: they are
    /// still `in_progress` and move to `status`.
    pub async fn settle_in_progress(
        &self,
        user_id: Uuid,
        category: AccountCategory,
        status: AccountSyncStatus,
    ) -> Result<u64, AdsError> {
        let result = Account::update_many()
            .col_expr(account::Column::SyncStatus, Expr::value(status.as_str()))
            .filter(account::Column::UserId.eq(user_id))
            .filter(account::Column::Category.eq(category.as_str()))
            .filter(account::Column::SyncStatus.eq(AccountSyncStatus::InProgress.as_str()))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected)
    }

    /// Delete an account the user disconnected, together with its edges.
    pub async fn disconnect(&self, account_id: Uuid) -> Result<(), AdsError> {
        let txn = self.db.begin().await?;

        let edges = AccountRelationship::delete_many()
            .filter(
                Condition::any()
                    .add(account_relationship::Column::ParentAccountId.eq(account_id))
                    .add(account_relationship::Column::ChildAccountId.eq(account_id)),
            )
            .exec(&txn)
            .await?;
        let deleted = Account::delete_by_id(account_id).exec(&txn).await?;
        if deleted.rows_affected == 0 {
            txn.rollback().await?;
            return Err(AdsError::not_found("account", account_id));
        }
        txn.commit().await?;

        info!(
            account_id = %account_id,
            edges_removed = edges.rows_affected,
            "Account disconnected"
        );
        Ok(())
    }
}
