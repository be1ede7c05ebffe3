//! Shared fixtures for integration tests: an in-memory SQLite database with
//! migrations applied, a scripted in-process [`AdsApi`] and a fast executor
//! configuration.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ads_connect::ads_api::{
    AdsApi, AdvertisingAccount, AdvertisingAccountPage, AlternateId, AmcInstance, DspAdvertiser,
    LinkedAdvertiser, TokenGrant, UpstreamError,
};
use ads_connect::config::{AppConfig, CredentialRefreshConfig, RateLimitConfig, SyncConfig};
use ads_connect::crypto::CryptoKey;
use ads_connect::repositories::CredentialInput;
use ads_connect::server::Services;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    Ok(Arc::new(setup_test_db().await?))
}

pub fn test_key() -> CryptoKey {
    CryptoKey::new(vec![42u8; 32]).expect("32-byte key")
}

/// Executor settings that keep retry tests in the millisecond range.
pub fn fast_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        ops_per_window: 1_000,
        window_ms: 1_000,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter_factor: 0.0,
        max_retries: 2,
        max_transient_retries: 1,
        request_timeout_seconds: 5,
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        operator_tokens: vec!["operator-token".to_string()],
        rate_limit: fast_rate_limit(),
        credential_refresh: CredentialRefreshConfig {
            tick_seconds: 60,
            lead_time_seconds: 600,
            concurrency: 4,
            failure_threshold: 3,
        },
        sync: SyncConfig {
            adapter_timeout_seconds: 5,
            interval_seconds: 0,
            max_concurrent: 2,
            advertising_page_size: 2,
        },
        ..Default::default()
    }
}

/// Services over a fresh database and the given fake upstream.
pub async fn build_services(config: AppConfig, api: Arc<FakeAdsApi>) -> Result<Services> {
    let db = setup_test_db_arc().await?;
    Ok(Services::build(Arc::new(config), db, test_key(), api))
}

/// Store a credential whose refresh token the fake upstream accepts.
pub async fn seed_credential(
    services: &Services,
    api: &FakeAdsApi,
    user_id: Uuid,
    expires_at: DateTime<Utc>,
) -> Result<ads_connect::models::credential::Model> {
    let refresh_token = format!("refresh-seed-{}", Uuid::new_v4().simple());
    api.accept_refresh_token(&refresh_token);
    let record = services
        .credentials
        .create(CredentialInput {
            user_id,
            access_token: "access-seed".to_string(),
            refresh_token,
            expires_at,
        })
        .await?;
    Ok(record)
}

pub fn advertising_account(id: &str, name: &str) -> AdvertisingAccount {
    AdvertisingAccount {
        ads_account_id: id.to_string(),
        account_name: name.to_string(),
        status: Some("CREATED".to_string()),
        alternate_ids: vec![AlternateId {
            country_code: "US".to_string(),
            profile_id: Some(1_000),
            entity_id: Some(format!("ENTITY-{}", id)),
        }],
    }
}

pub fn dsp_advertiser(id: &str, name: &str) -> DspAdvertiser {
    DspAdvertiser {
        advertiser_id: id.to_string(),
        name: name.to_string(),
        country_code: Some("US".to_string()),
        currency: Some("USD".to_string()),
        timezone: Some("America/Los_Angeles".to_string()),
        status: Some("ACTIVE".to_string()),
        seats: Vec::new(),
    }
}

pub fn amc_instance(id: &str, linked: &[(&str, Option<&str>)]) -> AmcInstance {
    AmcInstance {
        instance_id: id.to_string(),
        instance_name: format!("Instance {}", id),
        status: Some("ACTIVE".to_string()),
        region: Some("NA".to_string()),
        linked_advertisers: linked
            .iter()
            .map(|(advertiser_id, advertiser_type)| LinkedAdvertiser {
                advertiser_id: advertiser_id.to_string(),
                advertiser_type: advertiser_type.map(str::to_string),
            })
            .collect(),
    }
}

/// Scripted upstream. Listings return whatever was configured last; refresh
/// tokens are single use and every successful refresh rotates them.
#[derive(Default)]
pub struct FakeAdsApi {
    advertising_pages: Mutex<HashMap<Option<String>, Result<AdvertisingAccountPage, UpstreamError>>>,
    dsp: Mutex<Option<Result<Vec<DspAdvertiser>, UpstreamError>>>,
    amc: Mutex<Option<Result<Vec<AmcInstance>, UpstreamError>>>,
    refresh_failure: Mutex<Option<UpstreamError>>,
    valid_refresh_tokens: Mutex<HashSet<String>>,
    listing_delay: Mutex<Duration>,
    page_delays: Mutex<HashMap<Option<String>, Duration>>,
    refresh_delay: Mutex<Duration>,
    access_tokens_seen: Mutex<Vec<String>>,
    minted: AtomicUsize,
    pub advertising_calls: AtomicUsize,
    pub dsp_calls: AtomicUsize,
    pub amc_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
}

impl FakeAdsApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script one advertising page, keyed by the page token that requests it.
    pub fn advertising_page(
        &self,
        page_token: Option<&str>,
        response: Result<AdvertisingAccountPage, UpstreamError>,
    ) {
        self.advertising_pages
            .lock()
            .unwrap()
            .insert(page_token.map(str::to_string), response);
    }

    /// Hold back the advertising page requested with `page_token`.
    pub fn delay_advertising_page(&self, page_token: Option<&str>, delay: Duration) {
        self.page_delays
            .lock()
            .unwrap()
            .insert(page_token.map(str::to_string), delay);
    }

    pub fn advertising_accounts(&self, accounts: Vec<AdvertisingAccount>) {
        self.advertising_pages.lock().unwrap().clear();
        self.advertising_page(
            None,
            Ok(AdvertisingAccountPage {
                ads_accounts: accounts,
                next_token: None,
            }),
        );
    }

    pub fn dsp_advertisers(&self, response: Result<Vec<DspAdvertiser>, UpstreamError>) {
        *self.dsp.lock().unwrap() = Some(response);
    }

    pub fn amc_instances(&self, response: Result<Vec<AmcInstance>, UpstreamError>) {
        *self.amc.lock().unwrap() = Some(response);
    }

    pub fn fail_refresh_with(&self, error: Option<UpstreamError>) {
        *self.refresh_failure.lock().unwrap() = error;
    }

    pub fn accept_refresh_token(&self, token: &str) {
        self.valid_refresh_tokens
            .lock()
            .unwrap()
            .insert(token.to_string());
    }

    pub fn set_listing_delay(&self, delay: Duration) {
        *self.listing_delay.lock().unwrap() = delay;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn access_tokens_seen(&self) -> Vec<String> {
        self.access_tokens_seen.lock().unwrap().clone()
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    async fn listing(&self, access_token: &str) {
        self.access_tokens_seen
            .lock()
            .unwrap()
            .push(access_token.to_string());
        let delay = *self.listing_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl AdsApi for FakeAdsApi {
    async fn list_advertising_accounts(
        &self,
        access_token: &str,
        page_token: Option<&str>,
        _page_size: u32,
    ) -> Result<AdvertisingAccountPage, UpstreamError> {
        self.advertising_calls.fetch_add(1, Ordering::SeqCst);
        self.listing(access_token).await;
        let page_delay = self
            .page_delays
            .lock()
            .unwrap()
            .get(&page_token.map(str::to_string))
            .copied();
        if let Some(delay) = page_delay {
            tokio::time::sleep(delay).await;
        }
        self.advertising_pages
            .lock()
            .unwrap()
            .get(&page_token.map(str::to_string))
            .cloned()
            .unwrap_or(Ok(AdvertisingAccountPage {
                ads_accounts: Vec::new(),
                next_token: None,
            }))
    }

    async fn list_dsp_advertisers(
        &self,
        access_token: &str,
    ) -> Result<Vec<DspAdvertiser>, UpstreamError> {
        self.dsp_calls.fetch_add(1, Ordering::SeqCst);
        self.listing(access_token).await;
        self.dsp.lock().unwrap().clone().unwrap_or(Ok(Vec::new()))
    }

    async fn list_amc_instances(
        &self,
        access_token: &str,
    ) -> Result<Vec<AmcInstance>, UpstreamError> {
        self.amc_calls.fetch_add(1, Ordering::SeqCst);
        self.listing(access_token).await;
        self.amc.lock().unwrap().clone().unwrap_or(Ok(Vec::new()))
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, UpstreamError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.refresh_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.refresh_failure.lock().unwrap().clone() {
            return Err(error);
        }

        let mut valid = self.valid_refresh_tokens.lock().unwrap();
        if !valid.remove(refresh_token) {
            return Err(UpstreamError::InvalidGrant("invalid_grant".to_string()));
        }
        let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
        let rotated = format!("refresh-{}", n);
        valid.insert(rotated.clone());

        Ok(TokenGrant {
            access_token: format!("access-{}", n),
            refresh_token: Some(rotated),
            expires_in: 3600,
        })
    }
}
