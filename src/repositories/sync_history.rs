//! Append-only sync history.

use std::sync::Arc;

use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait};
use uuid::Uuid;

use crate::error::AdsError;
use crate::models::sync_history::{self, Entity as SyncHistory};

#[derive(Debug, Clone)]
pub struct SyncHistoryRepository {
    db: Arc<DatabaseConnection>,
}

impl SyncHistoryRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Write a completed entry. Entries are never updated afterwards.
    pub async fn append(&self, entry: sync_history::Model) -> Result<sync_history::Model, AdsError> {
        let active = sync_history::ActiveModel::from(entry).reset_all();
        Ok(active.insert(self.db.as_ref()).await?)
    }

    pub async fn get(&self, sync_id: Uuid) -> Result<Option<sync_history::Model>, AdsError> {
        Ok(SyncHistory::find_by_id(sync_id)
            .one(self.db.as_ref())
            .await?)
    }
}
