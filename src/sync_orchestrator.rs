//! # Sync Orchestrator
//!
//! Runs one synchronization pass per user: lists every requested category
//! concurrently, reconciles the results into the account store, links AMC
//! instances to the advertisers they reference and appends a sync history
//! entry.
//!
//! Categories are isolated. Each listing runs in its own task with its own
//! deadline and its failure is captured into that category's result; it never
//! cancels the siblings. Accounts that upstream stops returning are left in
//! place, since removal is an explicit user action.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::adapters::{ListingContext, NormalizedAccount, SourceListing, SourceRegistry};
use crate::config::SyncConfig;
use crate::error::AdsError;
use crate::models::{
    AccountCategory, AccountSyncStatus, CategoryOutcome, RelationshipKind, SyncStatus,
    account, sync_history,
};
use crate::repositories::{
    AccountRepository, CredentialStore, RelationshipGraph, SyncHistoryRepository,
};
use crate::telemetry::{METRIC_ADAPTER_LATENCY, METRIC_SYNC_CATEGORY_OUTCOMES, METRIC_SYNCS_RUNNING};
use crate::token_refresh::{RefreshOutcome, RefreshScheduler};

/// Grace period past the listing deadline before the task itself is abandoned.
const LISTING_BACKSTOP: Duration = Duration::from_secs(5);

/// Error recorded against a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CategoryError {
    /// Stable error code, e.g. `RATE_LIMIT_EXCEEDED`
    pub code: String,
    pub message: String,
}

impl From<&AdsError> for CategoryError {
    fn from(error: &AdsError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Outcome and counts for one category of a sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CategoryResult {
    pub category: AccountCategory,
    pub outcome: CategoryOutcome,
    /// Accounts returned upstream and stored
    pub accounts_synced: u32,
    /// Subset of `accounts_synced` that did not exist before
    pub accounts_created: u32,
    /// Accounts returned upstream that could not be stored
    pub accounts_failed: u32,
    pub edges_created: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CategoryError>,
}

impl CategoryResult {
    fn new(category: AccountCategory, outcome: CategoryOutcome) -> Self {
        Self {
            category,
            outcome,
            accounts_synced: 0,
            accounts_created: 0,
            accounts_failed: 0,
            edges_created: 0,
            error: None,
        }
    }

    fn failed(category: AccountCategory, error: &AdsError) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(category, CategoryOutcome::Failed)
        }
    }
}

/// State of a sync pass as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct SyncReport {
    pub sync_id: Uuid,
    pub user_id: Uuid,
    pub status: SyncStatus,
    pub requested_categories: Vec<AccountCategory>,
    /// Per-category results, empty while the pass is running
    pub categories: Vec<CategoryResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncReport {
    fn from_history(entry: sync_history::Model) -> Result<Self, AdsError> {
        let corrupt = |e: &dyn std::fmt::Display| {
            AdsError::CorruptRecord(format!("sync history {}: {}", entry.id, e))
        };
        let status = entry.status.parse::<SyncStatus>().map_err(|e| corrupt(&e))?;
        let requested_categories = serde_json::from_value(entry.requested_categories.clone())
            .map_err(|e| corrupt(&e))?;
        let categories =
            serde_json::from_value(entry.category_results.clone()).map_err(|e| corrupt(&e))?;

        Ok(Self {
            sync_id: entry.id,
            user_id: entry.user_id,
            status,
            requested_categories,
            categories,
            started_at: entry.started_at.with_timezone(&Utc),
            completed_at: Some(entry.completed_at.with_timezone(&Utc)),
        })
    }
}

#[derive(Debug, Clone)]
struct RunningSync {
    user_id: Uuid,
    categories: Vec<AccountCategory>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// A registered pass about to run.
struct SyncPlan {
    sync_id: Uuid,
    user_id: Uuid,
    credential_id: Uuid,
    categories: Vec<AccountCategory>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    config: SyncConfig,
    credentials: CredentialStore,
    accounts: AccountRepository,
    graph: RelationshipGraph,
    history: SyncHistoryRepository,
    sources: SourceRegistry,
    refresher: RefreshScheduler,
    running: Arc<Mutex<HashMap<Uuid, RunningSync>>>,
    /// Parent of every pass's cancellation token.
    shutdown: CancellationToken,
    /// Background passes started by `trigger_sync`.
    passes: TaskTracker,
}

impl SyncOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConfig,
        credentials: CredentialStore,
        accounts: AccountRepository,
        graph: RelationshipGraph,
        history: SyncHistoryRepository,
        sources: SourceRegistry,
        refresher: RefreshScheduler,
    ) -> Self {
        Self {
            config,
            credentials,
            accounts,
            graph,
            history,
            sources,
            refresher,
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            passes: TaskTracker::new(),
        }
    }

    /// Start a pass in the background and return its id immediately.
    /// `None` requests every registered category.
    pub async fn trigger_sync(
        &self,
        user_id: Uuid,
        categories: Option<Vec<AccountCategory>>,
    ) -> Result<Uuid, AdsError> {
        let plan = self.register(user_id, categories).await?;
        let sync_id = plan.sync_id;

        let orchestrator = self.clone();
        self.passes.spawn(async move {
            if let Err(e) = orchestrator.run_registered(plan).await {
                error!(sync_id = %sync_id, error = %e, "Sync pass failed");
            }
        });

        Ok(sync_id)
    }

    /// Run a pass to completion and return its report.
    pub async fn sync_user(
        &self,
        user_id: Uuid,
        categories: Option<Vec<AccountCategory>>,
    ) -> Result<SyncReport, AdsError> {
        let plan = self.register(user_id, categories).await?;
        self.run_registered(plan).await
    }

    /// Running passes report `running`; finished ones are read from history.
    pub async fn get_sync_status(&self, sync_id: Uuid) -> Result<SyncReport, AdsError> {
        if let Some(running) = self.running.lock().await.get(&sync_id) {
            return Ok(SyncReport {
                sync_id,
                user_id: running.user_id,
                status: SyncStatus::Running,
                requested_categories: running.categories.clone(),
                categories: Vec::new(),
                started_at: running.started_at,
                completed_at: None,
            });
        }

        match self.history.get(sync_id).await? {
            Some(entry) => SyncReport::from_history(entry),
            None => Err(AdsError::not_found("sync", sync_id)),
        }
    }

    /// Ask a running pass to stop. Listings stop cooperatively and whatever
    /// they already fetched is still stored. Returns `false` if the pass has
    /// already completed.
    pub async fn cancel(&self, sync_id: Uuid) -> Result<bool, AdsError> {
        if let Some(running) = self.running.lock().await.get(&sync_id) {
            info!(sync_id = %sync_id, "Cancelling sync");
            running.cancel.cancel();
            return Ok(true);
        }

        match self.history.get(sync_id).await? {
            Some(_) => Ok(false),
            None => Err(AdsError::not_found("sync", sync_id)),
        }
    }

    /// Refuse new passes, cancel the running ones and wait until each of
    /// them has settled its accounts and written its history entry.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.passes.close();
        let running = self.running.lock().await.len();
        info!(running, "Waiting for sync passes to finish");
        self.passes.wait().await;
    }

    pub async fn is_running_for(&self, user_id: Uuid) -> bool {
        self.running
            .lock()
            .await
            .values()
            .any(|running| running.user_id == user_id)
    }

    /// Re-sync every user with an enabled credential on the configured
    /// interval until `shutdown` fires. Does nothing when the interval is 0.
    #[instrument(skip_all)]
    pub async fn run_periodic(&self, shutdown: CancellationToken) {
        if self.config.interval_seconds == 0 {
            info!("Periodic sync disabled");
            return;
        }
        info!(interval_seconds = self.config.interval_seconds, "Starting periodic sync");
        let interval = Duration::from_secs(self.config.interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Periodic sync shutdown requested");
                    break;
                }
                _ = sleep(interval) => {
                    if let Err(e) = self.sync_all_users().await {
                        error!(error = %e, "Periodic sync round failed");
                    }
                }
            }
        }
    }

    /// Sync every user with an enabled credential, at most
    /// `max_concurrent` users at a time. Returns the number of passes run.
    pub async fn sync_all_users(&self) -> Result<usize, AdsError> {
        let user_ids = self.credentials.list_enabled_user_ids().await?;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1) as usize));

        let mut handles = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            if self.is_running_for(user_id).await {
                debug!(user_id = %user_id, "Sync already running, skipping");
                continue;
            }
            let semaphore = semaphore.clone();
            let orchestrator = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                orchestrator.sync_user(user_id, None).await
            }));
        }

        let mut completed = 0;
        for handle in handles {
            match handle.await {
                Ok(Ok(_)) => completed += 1,
                Ok(Err(e)) => warn!(error = %e, "Periodic sync for user failed"),
                Err(e) => error!(error = ?e, "Periodic sync task panicked"),
            }
        }
        Ok(completed)
    }

    async fn register(
        &self,
        user_id: Uuid,
        categories: Option<Vec<AccountCategory>>,
    ) -> Result<SyncPlan, AdsError> {
        let categories: Vec<AccountCategory> = match categories {
            Some(requested) if !requested.is_empty() => requested
                .into_iter()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            _ => self.sources.categories(),
        };

        if self.shutdown.is_cancelled() {
            return Err(AdsError::Cancelled);
        }

        let credential = self
            .credentials
            .find_active_for_user(user_id)
            .await?
            .ok_or_else(|| AdsError::not_found("active credential for user", user_id))?;

        let plan = SyncPlan {
            sync_id: Uuid::new_v4(),
            user_id,
            credential_id: credential.id,
            categories,
            started_at: Utc::now(),
            cancel: self.shutdown.child_token(),
        };

        let mut running = self.running.lock().await;
        if let Some((sync_id, _)) = running.iter().find(|(_, r)| r.user_id == user_id) {
            return Err(AdsError::SyncInProgress {
                user_id,
                sync_id: *sync_id,
            });
        }
        running.insert(
            plan.sync_id,
            RunningSync {
                user_id,
                categories: plan.categories.clone(),
                started_at: plan.started_at,
                cancel: plan.cancel.clone(),
            },
        );
        gauge!(METRIC_SYNCS_RUNNING).set(running.len() as f64);
        drop(running);

        info!(sync_id = %plan.sync_id, user_id = %user_id, categories = ?plan.categories, "Sync registered");
        Ok(plan)
    }

    async fn run_registered(&self, plan: SyncPlan) -> Result<SyncReport, AdsError> {
        let sync_id = plan.sync_id;
        let result = self.run_sync(plan).await;

        let mut running = self.running.lock().await;
        running.remove(&sync_id);
        gauge!(METRIC_SYNCS_RUNNING).set(running.len() as f64);
        result
    }

    #[instrument(skip_all, fields(sync_id = %plan.sync_id, user_id = %plan.user_id))]
    async fn run_sync(&self, plan: SyncPlan) -> Result<SyncReport, AdsError> {
        let results = match self.usable_access_token(plan.credential_id).await {
            Ok(access_token) => self.sync_categories(&plan, access_token).await,
            Err(e) => {
                warn!(error = %e, "No usable access token, failing every category");
                plan.categories
                    .iter()
                    .map(|category| CategoryResult::failed(*category, &e))
                    .collect()
            }
        };

        if results
            .iter()
            .filter_map(|r| r.error.as_ref())
            .any(|e| e.code == AdsError::AccessTokenRejected.code())
        {
            match self.refresher.refresh_now(plan.credential_id).await {
                Ok(outcome) => info!(?outcome, "Refreshed credential after rejected access token"),
                Err(e) => warn!(error = %e, "Refresh after rejected access token failed"),
            }
        }

        let status = SyncStatus::from_outcomes(results.iter().map(|r| &r.outcome));
        let completed_at = Utc::now();

        let errors: Vec<_> = results
            .iter()
            .filter_map(|r| {
                r.error.as_ref().map(|e| {
                    json!({"category": r.category, "code": e.code, "message": e.message})
                })
            })
            .collect();
        let entry = sync_history::Model {
            id: plan.sync_id,
            user_id: plan.user_id,
            credential_id: Some(plan.credential_id),
            status: status.as_str().to_string(),
            requested_categories: json!(plan.categories),
            category_results: serde_json::to_value(&results)
                .map_err(|e| AdsError::Internal(e.to_string()))?,
            errors: json!(errors),
            started_at: plan.started_at.into(),
            completed_at: completed_at.into(),
        };
        self.history.append(entry).await?;

        for result in &results {
            counter!(
                METRIC_SYNC_CATEGORY_OUTCOMES,
                "category" => result.category.as_str(),
                "outcome" => result.outcome.as_str()
            )
            .increment(1);
        }
        info!(status = %status, "Sync completed");

        Ok(SyncReport {
            sync_id: plan.sync_id,
            user_id: plan.user_id,
            status,
            requested_categories: plan.categories,
            categories: results,
            started_at: plan.started_at,
            completed_at: Some(completed_at),
        })
    }

    /// Decrypted access token, refreshed first if it has already expired.
    async fn usable_access_token(&self, credential_id: Uuid) -> Result<Zeroizing<String>, AdsError> {
        let mut record = self.credentials.get(credential_id).await?;
        if !record.proactive_refresh_enabled {
            return Err(AdsError::CredentialDisabled(credential_id));
        }

        if record.expires_at.with_timezone(&Utc) <= Utc::now() {
            info!(credential_id = %credential_id, "Access token expired, refreshing before sync");
            match self.refresher.refresh_now(credential_id).await? {
                RefreshOutcome::Refreshed { .. } | RefreshOutcome::Reused | RefreshOutcome::Skipped => {}
                RefreshOutcome::Disabled { .. } => {
                    return Err(AdsError::CredentialDisabled(credential_id));
                }
                RefreshOutcome::Failed { error, .. } => {
                    return Err(AdsError::UpstreamUnavailable {
                        attempts: 0,
                        reason: format!("token refresh failed: {}", error),
                    });
                }
            }
            record = self.credentials.get(credential_id).await?;
        }

        self.credentials.access_token(&record)
    }

    async fn sync_categories(
        &self,
        plan: &SyncPlan,
        access_token: Zeroizing<String>,
    ) -> Vec<CategoryResult> {
        for category in &plan.categories {
            if let Err(e) = self
                .accounts
                .mark_category_sync_status(plan.user_id, *category, AccountSyncStatus::InProgress)
                .await
            {
                warn!(category = %category, error = %e, "Failed to mark accounts in progress");
            }
        }

        let access_token = Arc::new(access_token);
        let timeout = self.config.adapter_timeout();
        let mut listings: Vec<(AccountCategory, Result<SourceListing, AdsError>)> = Vec::new();
        let mut handles = Vec::new();

        for category in &plan.categories {
            let Some(source) = self.sources.get(*category) else {
                listings.push((
                    *category,
                    Err(AdsError::Internal(format!("no source registered for {}", category))),
                ));
                continue;
            };
            let access_token = access_token.clone();
            let ctx = ListingContext::new(plan.cancel.child_token(), timeout);
            let category = *category;

            handles.push((
                category,
                tokio::spawn(async move {
                    let started = std::time::Instant::now();
                    let listed = tokio::time::timeout(
                        timeout + LISTING_BACKSTOP,
                        source.list_accounts(&access_token, &ctx),
                    )
                    .await
                    .unwrap_or(Err(AdsError::DeadlineExceeded {
                        seconds: timeout.as_secs(),
                    }));
                    histogram!(METRIC_ADAPTER_LATENCY, "category" => category.as_str())
                        .record(started.elapsed().as_secs_f64());
                    listed
                }),
            ));
        }

        for (category, handle) in handles {
            let listed = handle
                .await
                .unwrap_or_else(|e| Err(AdsError::Internal(format!("listing task failed: {}", e))));
            listings.push((category, listed));
        }
        drop(access_token);

        // AMC last: its edges resolve against freshly stored advertisers.
        listings.sort_by_key(|(category, _)| *category);

        let mut results = Vec::with_capacity(listings.len());
        for (category, listed) in listings {
            results.push(self.reconcile(plan.user_id, category, listed).await);
        }
        results
    }

    #[instrument(skip(self, listed, category), fields(category = %category))]
    async fn reconcile(
        &self,
        user_id: Uuid,
        category: AccountCategory,
        listed: Result<SourceListing, AdsError>,
    ) -> CategoryResult {
        let result = match listed {
            Err(e) => {
                warn!(error = %e, "Category listing failed");
                CategoryResult::failed(category, &e)
            }
            Ok(listing) if listing.access_denied => {
                CategoryResult::new(category, CategoryOutcome::NoAccess)
            }
            Ok(listing) => self.store_listing(user_id, category, listing).await,
        };

        let leftover = if result.outcome == CategoryOutcome::Success {
            AccountSyncStatus::Pending
        } else {
            AccountSyncStatus::Failed
        };
        if let Err(e) = self
            .accounts
            .settle_in_progress(user_id, category, leftover)
            .await
        {
            warn!(error = %e, "Failed to settle account sync status");
        }
        result
    }

    async fn store_listing(
        &self,
        user_id: Uuid,
        category: AccountCategory,
        listing: SourceListing,
    ) -> CategoryResult {
        let mut result = CategoryResult::new(category, CategoryOutcome::Success);
        let synced_at = Utc::now();

        for normalized in &listing.accounts {
            match self
                .accounts
                .upsert_by_external_id(user_id, normalized, synced_at)
                .await
            {
                Ok((stored, inserted)) => {
                    result.accounts_synced += 1;
                    if inserted {
                        result.accounts_created += 1;
                    }
                    if category == AccountCategory::Amc {
                        result.edges_created += self.link_amc_instance(user_id, &stored, normalized).await;
                    }
                }
                Err(e) => {
                    result.accounts_failed += 1;
                    warn!(external_id = %normalized.external_id, error = %e, "Failed to store account");
                }
            }
        }

        if let Some(failure) = &listing.partial_failure {
            result.outcome = CategoryOutcome::Partial;
            result.error = Some(failure.into());
        } else if result.accounts_failed > 0 {
            result.outcome = CategoryOutcome::Partial;
        }
        result
    }

    /// Upsert edges from the advertisers an AMC instance references. Returns
    /// the number of new edges. References to unknown accounts are skipped.
    async fn link_amc_instance(
        &self,
        user_id: Uuid,
        instance: &account::Model,
        normalized: &NormalizedAccount,
    ) -> u32 {
        let mut created = 0;
        for linked in &normalized.linked_advertisers {
            let candidates = match linked.category_hint {
                Some(category) => vec![category],
                None => vec![AccountCategory::Advertising, AccountCategory::Dsp],
            };

            let parent = match self
                .accounts
                .find_by_external_id(user_id, &candidates, &linked.external_id)
                .await
            {
                Ok(Some(parent)) => parent,
                Ok(None) => {
                    debug!(advertiser_id = %linked.external_id, "Linked advertiser not synced yet, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(advertiser_id = %linked.external_id, error = %e, "Failed to resolve linked advertiser");
                    continue;
                }
            };

            let Some(kind) = parent
                .category()
                .ok()
                .and_then(|category| RelationshipKind::between(category, AccountCategory::Amc))
            else {
                continue;
            };

            match self.graph.upsert_edge(parent.id, instance.id, kind).await {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => warn!(parent = %parent.id, child = %instance.id, error = %e, "Failed to link AMC instance"),
            }
        }
        created
    }
}
