//! # Relationship graph
//!
//! Directed edges between accounts of different categories. An edge
//! `(parent, child, kind)` is stored at most once; self-edges, missing
//! endpoints and endpoints whose categories do not match `kind` are rejected
//! with [`AdsError::GraphValidation`]. The graph may contain cycles, so the
//! transitive queries track visited nodes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set};
use tracing::debug;
use uuid::Uuid;

use crate::error::AdsError;
use crate::models::account::{self, Entity as Account};
use crate::models::account_relationship::{self, Entity as AccountRelationship};
use crate::models::RelationshipKind;

/// An account adjacent to the queried one, with the kind of the connecting edge.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedAccount {
    pub account: account::Model,
    pub kind: RelationshipKind,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelatedAccounts {
    pub parents: Vec<RelatedAccount>,
    pub children: Vec<RelatedAccount>,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct RelationshipGraph {
    db: Arc<DatabaseConnection>,
}

impl RelationshipGraph {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Insert the edge if absent. Returns `true` when a new edge was stored.
    pub async fn upsert_edge(
        &self,
        parent_id: Uuid,
        child_id: Uuid,
        kind: RelationshipKind,
    ) -> Result<bool, AdsError> {
        if parent_id == child_id {
            return Err(AdsError::GraphValidation(format!(
                "self-edge on account {}",
                parent_id
            )));
        }

        let parent = self.endpoint(parent_id, "parent").await?;
        let child = self.endpoint(child_id, "child").await?;

        let (parent_category, child_category) = kind.endpoints();
        if parent.category != parent_category.as_str() || child.category != child_category.as_str()
        {
            return Err(AdsError::GraphValidation(format!(
                "{} edge cannot link {} account to {} account",
                kind, parent.category, child.category
            )));
        }

        let edge = account_relationship::ActiveModel {
            id: Set(Uuid::new_v4()),
            parent_account_id: Set(parent_id),
            child_account_id: Set(child_id),
            kind: Set(kind.as_str().to_string()),
            created_at: Set(Utc::now().into()),
        };

        let inserted = AccountRelationship::insert(edge)
            .on_conflict(
                OnConflict::columns([
                    account_relationship::Column::ParentAccountId,
                    account_relationship::Column::ChildAccountId,
                    account_relationship::Column::Kind,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await;

        let created = match inserted {
            Ok(rows) => rows > 0,
            Err(DbErr::RecordNotInserted) => false,
            Err(e) => return Err(e.into()),
        };

        debug!(parent = %parent_id, child = %child_id, kind = %kind, created, "Upserted relationship edge");
        Ok(created)
    }

    async fn endpoint(&self, account_id: Uuid, role: &str) -> Result<account::Model, AdsError> {
        Account::find_by_id(account_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| {
                AdsError::GraphValidation(format!("{} account {} does not exist", role, account_id))
            })
    }

    /// Direct parents and children of an account.
    pub async fn get_related(&self, account_id: Uuid) -> Result<RelatedAccounts, AdsError> {
        if Account::find_by_id(account_id)
            .one(self.db.as_ref())
            .await?
            .is_none()
        {
            return Err(AdsError::not_found("account", account_id));
        }

        let parents = self.neighbours(account_id, Direction::Up).await?;
        let children = self.neighbours(account_id, Direction::Down).await?;
        Ok(RelatedAccounts { parents, children })
    }

    async fn neighbours(
        &self,
        account_id: Uuid,
        direction: Direction,
    ) -> Result<Vec<RelatedAccount>, AdsError> {
        let edges = self.edges_from(&[account_id], direction).await?;
        let ids: Vec<Uuid> = edges.iter().map(|(_, other, _)| *other).collect();
        let mut accounts = self.accounts_by_id(ids).await?;

        let mut related = Vec::with_capacity(edges.len());
        for (_, other, kind) in edges {
            if let Some(account) = accounts.remove(&other) {
                related.push(RelatedAccount { account, kind });
            }
        }
        related.sort_by(|a, b| {
            (a.account.category.as_str(), a.account.external_id.as_str())
                .cmp(&(b.account.category.as_str(), b.account.external_id.as_str()))
        });
        Ok(related)
    }

    /// Every account reachable by following edges towards parents.
    pub async fn ancestors(&self, account_id: Uuid) -> Result<Vec<account::Model>, AdsError> {
        self.reachable(account_id, Direction::Up).await
    }

    /// Every account reachable by following edges towards children.
    pub async fn descendants(&self, account_id: Uuid) -> Result<Vec<account::Model>, AdsError> {
        self.reachable(account_id, Direction::Down).await
    }

    async fn reachable(
        &self,
        account_id: Uuid,
        direction: Direction,
    ) -> Result<Vec<account::Model>, AdsError> {
        let mut visited: HashSet<Uuid> = HashSet::from([account_id]);
        let mut order = Vec::new();
        let mut frontier = vec![account_id];

        while !frontier.is_empty() {
            let edges = self.edges_from(&frontier, direction).await?;
            frontier = Vec::new();
            for (_, other, _) in edges {
                if visited.insert(other) {
                    order.push(other);
                    frontier.push(other);
                }
            }
        }

        let mut accounts = self.accounts_by_id(order.clone()).await?;
        Ok(order
            .into_iter()
            .filter_map(|id| accounts.remove(&id))
            .collect())
    }

    /// Edges touching `ids` as `(from, to, kind)` in the walking direction.
    async fn edges_from(
        &self,
        ids: &[Uuid],
        direction: Direction,
    ) -> Result<Vec<(Uuid, Uuid, RelationshipKind)>, AdsError> {
        let column = match direction {
            Direction::Up => account_relationship::Column::ChildAccountId,
            Direction::Down => account_relationship::Column::ParentAccountId,
        };
        let rows = AccountRelationship::find()
            .filter(column.is_in(ids.iter().copied()))
            .all(self.db.as_ref())
            .await?;

        rows.into_iter()
            .map(|edge| {
                let kind = edge
                    .kind
                    .parse::<RelationshipKind>()
                    .map_err(|e| AdsError::CorruptRecord(e.to_string()))?;
                Ok(match direction {
                    Direction::Up => (edge.child_account_id, edge.parent_account_id, kind),
                    Direction::Down => (edge.parent_account_id, edge.child_account_id, kind),
                })
            })
            .collect()
    }

    async fn accounts_by_id(
        &self,
        ids: Vec<Uuid>,
    ) -> Result<HashMap<Uuid, account::Model>, AdsError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let accounts = Account::find()
            .filter(account::Column::Id.is_in(ids))
            .all(self.db.as_ref())
            .await?;
        Ok(accounts.into_iter().map(|a| (a.id, a)).collect())
    }
}
