//! # Refresh Scheduler
//!
//! Background task that periodically refreshes credentials nearing expiry,
//! plus the forced refresh used when a sync finds an expired or rejected
//! access token.
//!
//! Per record the lifecycle is `Valid -> NearingExpiry -> Refreshing -> Valid`
//! on success, `Refreshing -> Failed` on error and `Failed -> Disabled` once
//! the failure threshold is reached. Refreshes of one record are serialized
//! through a per-record lock because Amazon refresh tokens rotate: two
//! overlapping refreshes would race to invalidate each other's token.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge, histogram};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{Duration as TokioDuration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::ads_api::AdsApi;
use crate::config::CredentialRefreshConfig;
use crate::error::AdsError;
use crate::models::credential;
use crate::rate_limit::RateLimitedExecutor;
use crate::repositories::CredentialStore;
use crate::telemetry::{
    METRIC_CREDENTIALS_DISABLED, METRIC_REFRESH_ATTEMPTS, METRIC_REFRESH_FAILURE,
    METRIC_REFRESH_SUCCESS, METRIC_REFRESH_TICK_CANDIDATES,
};

/// Where a credential sits in the refresh lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Valid,
    NearingExpiry,
    Refreshing,
    /// Last refresh failed; the existing token stays in use until expiry
    Failed,
    /// Threshold reached or refresh token rejected; user must reconnect
    Disabled,
}

impl RefreshState {
    /// Classify a record that is not currently being refreshed.
    pub fn classify(record: &credential::Model, now: DateTime<Utc>, lead: Duration) -> Self {
        if !record.proactive_refresh_enabled {
            RefreshState::Disabled
        } else if record.consecutive_refresh_failures > 0 {
            RefreshState::Failed
        } else if record.expires_at.with_timezone(&Utc) <= now + lead {
            RefreshState::NearingExpiry
        } else {
            RefreshState::Valid
        }
    }
}

/// Why a refresh was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Picked up by a tick; skipped if the record no longer qualifies
    Scheduled,
    /// Requested by a caller at `requested_at`; reuses any refresh that
    /// completed after that instant
    Forced { requested_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed { expires_at: DateTime<Utc> },
    /// A refresh finished while this one waited for the record lock
    Reused,
    /// The record no longer needed a refresh when the lock was taken
    Skipped,
    Failed { failures: i32, error: String },
    Disabled { reason: String },
}

/// Summary of one scheduler tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub candidates: usize,
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub disabled: usize,
    pub errors: usize,
}

type LockTable = Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>;

#[derive(Clone)]
pub struct RefreshScheduler {
    config: CredentialRefreshConfig,
    store: CredentialStore,
    api: Arc<dyn AdsApi>,
    executor: Arc<RateLimitedExecutor>,
    locks: LockTable,
}

impl RefreshScheduler {
    pub fn new(
        config: CredentialRefreshConfig,
        store: CredentialStore,
        api: Arc<dyn AdsApi>,
        executor: Arc<RateLimitedExecutor>,
    ) -> Self {
        Self {
            config,
            store,
            api,
            executor,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lead_time(&self) -> Duration {
        Duration::seconds(self.config.lead_time_seconds as i64)
    }

    /// Run ticks on the configured interval until `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            tick_seconds = self.config.tick_seconds,
            lead_time_seconds = self.config.lead_time_seconds,
            "Starting refresh scheduler"
        );
        let tick_interval = TokioDuration::from_secs(self.config.tick_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Refresh scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = std::time::Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "Refresh tick failed");
                    }
                    histogram!("ads_connect_refresh_tick_duration_seconds")
                        .record(tick_started.elapsed().as_secs_f64());
                }
            }
        }

        info!("Refresh scheduler stopped");
    }

    /// Refresh every enabled credential expiring within the lead window, at
    /// most `concurrency` at a time.
    #[instrument(skip_all)]
    pub async fn tick(&self) -> Result<TickReport, AdsError> {
        let candidates = self
            .store
            .list_expiring_within(Utc::now(), self.lead_time())
            .await?;
        gauge!(METRIC_REFRESH_TICK_CANDIDATES).set(candidates.len() as f64);

        let mut report = TickReport {
            candidates: candidates.len(),
            ..TickReport::default()
        };
        if candidates.is_empty() {
            debug!("No credentials due for refresh");
            return Ok(report);
        }
        info!(candidates = candidates.len(), "Refreshing credentials nearing expiry");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1) as usize));
        let mut handles = Vec::with_capacity(candidates.len());
        for record in candidates {
            let semaphore = semaphore.clone();
            let scheduler = self.clone();
            let link_id = record.id;
            handles.push((
                link_id,
                tokio::spawn(async move {
                    let _permit = semaphore.acquire().await;
                    scheduler.refresh_record(link_id, RefreshMode::Scheduled).await
                }),
            ));
        }

        for (link_id, handle) in handles {
            match handle.await {
                Ok(Ok(RefreshOutcome::Refreshed { .. })) => report.refreshed += 1,
                Ok(Ok(RefreshOutcome::Skipped | RefreshOutcome::Reused)) => report.skipped += 1,
                Ok(Ok(RefreshOutcome::Failed { .. })) => report.failed += 1,
                Ok(Ok(RefreshOutcome::Disabled { .. })) => report.disabled += 1,
                Ok(Err(e)) => {
                    report.errors += 1;
                    error!(link_id = %link_id, error = %e, "Credential refresh errored");
                }
                Err(e) => {
                    report.errors += 1;
                    error!(link_id = %link_id, error = ?e, "Refresh task panicked or was cancelled");
                }
            }
        }

        info!(
            candidates = report.candidates,
            refreshed = report.refreshed,
            skipped = report.skipped,
            failed = report.failed,
            disabled = report.disabled,
            errors = report.errors,
            "Refresh tick completed"
        );
        Ok(report)
    }

    /// Refresh `link_id` now, regardless of how far its expiry is. Serializes
    /// with any in-flight refresh of the same record and returns
    /// [`RefreshOutcome::Reused`] if that refresh finished after this call.
    pub async fn refresh_now(&self, link_id: Uuid) -> Result<RefreshOutcome, AdsError> {
        self.refresh_record(
            link_id,
            RefreshMode::Forced {
                requested_at: Utc::now(),
            },
        )
        .await
    }

    /// Lifecycle state of a record, including whether a refresh holds its lock.
    pub async fn state(&self, record: &credential::Model) -> RefreshState {
        if record.proactive_refresh_enabled {
            let locks = self.locks.lock().await;
            if let Some(lock) = locks.get(&record.id)
                && lock.try_lock().is_err()
            {
                return RefreshState::Refreshing;
            }
        }
        RefreshState::classify(record, Utc::now(), self.lead_time())
    }

    #[instrument(skip(self), fields(link_id = %link_id))]
    pub async fn refresh_record(
        &self,
        link_id: Uuid,
        mode: RefreshMode,
    ) -> Result<RefreshOutcome, AdsError> {
        let lock = self.lock_for(link_id).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.refresh_locked(link_id, mode).await
        };
        drop(lock);
        self.release_lock(link_id).await;
        outcome
    }

    async fn lock_for(&self, link_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(link_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the table entry once no other refresh holds or awaits it.
    async fn release_lock(&self, link_id: Uuid) {
        let mut locks = self.locks.lock().await;
        if let Some(lock) = locks.get(&link_id)
            && Arc::strong_count(lock) == 1
        {
            locks.remove(&link_id);
        }
    }

    async fn refresh_locked(
        &self,
        link_id: Uuid,
        mode: RefreshMode,
    ) -> Result<RefreshOutcome, AdsError> {
        let record = self.store.get(link_id).await?;

        match mode {
            RefreshMode::Scheduled => {
                let due = record.expires_at.with_timezone(&Utc) <= Utc::now() + self.lead_time();
                if !record.proactive_refresh_enabled || !due {
                    debug!(
                        enabled = record.proactive_refresh_enabled,
                        due, "Record no longer due, skipping"
                    );
                    return Ok(RefreshOutcome::Skipped);
                }
            }
            RefreshMode::Forced { requested_at } => {
                if !record.proactive_refresh_enabled {
                    return Err(AdsError::CredentialDisabled(link_id));
                }
                if let Some(last) = record.last_refreshed_at
                    && last.with_timezone(&Utc) >= requested_at
                {
                    debug!("Refresh completed while waiting, reusing it");
                    return Ok(RefreshOutcome::Reused);
                }
            }
        }

        counter!(METRIC_REFRESH_ATTEMPTS).increment(1);
        let started = std::time::Instant::now();

        let refresh_token = self.store.refresh_token(&record)?;
        let api = self.api.as_ref();
        let token: &str = &refresh_token;
        let result = self
            .executor
            .execute("refresh_token", move || api.refresh_token(token))
            .await;

        match result {
            Ok(grant) => {
                let access_token = Zeroizing::new(grant.access_token);
                let rotated = grant.refresh_token.map(Zeroizing::new);
                let expires_at = Utc::now() + Duration::seconds(grant.expires_in.max(0));

                self.store
                    .record_refresh_success(
                        &record,
                        &access_token,
                        rotated.as_ref().map(|t| t.as_str()),
                        expires_at,
                    )
                    .await?;

                counter!(METRIC_REFRESH_SUCCESS).increment(1);
                info!(
                    expires_at = %expires_at,
                    rotated = rotated.is_some(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Refreshed credential"
                );
                Ok(RefreshOutcome::Refreshed { expires_at })
            }
            Err(error) if error.requires_reconnect() => {
                let reason = error.to_string();
                self.store.disable(link_id, &reason).await?;
                counter!(METRIC_REFRESH_FAILURE, "code" => error.code()).increment(1);
                counter!(METRIC_CREDENTIALS_DISABLED, "reason" => "auth_expired").increment(1);
                warn!(error = %reason, "Refresh token rejected, reconnect required");
                Ok(RefreshOutcome::Disabled { reason })
            }
            Err(error) => {
                let reason = error.to_string();
                let updated = self.store.mark_refresh_failure(link_id, &reason).await?;
                counter!(METRIC_REFRESH_FAILURE, "code" => error.code()).increment(1);

                if !updated.proactive_refresh_enabled {
                    counter!(METRIC_CREDENTIALS_DISABLED, "reason" => "failure_threshold")
                        .increment(1);
                    return Ok(RefreshOutcome::Disabled { reason });
                }
                warn!(
                    failures = updated.consecutive_refresh_failures,
                    error = %reason,
                    "Refresh failed, existing token kept"
                );
                Ok(RefreshOutcome::Failed {
                    failures: updated.consecutive_refresh_failures,
                    error: reason,
                })
            }
        }
    }
}
