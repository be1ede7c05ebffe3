//! Configuration loading for the ads-connect service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `ADS_CONNECT_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "ADS_CONNECT_";

/// Application configuration derived from `ADS_CONNECT_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    #[serde(default)]
    pub amazon_ads: AmazonAdsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub credential_refresh: CredentialRefreshConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Amazon Ads API endpoints and application credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AmazonAdsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Regional Advertising API host
    ///
    /// Environment variable: `ADS_CONNECT_AMAZON_ADS_API_BASE`
    #[serde(default = "default_amazon_ads_api_base")]
    pub api_base: String,
    /// Login with Amazon token endpoint
    ///
    /// Environment variable: `ADS_CONNECT_AMAZON_ADS_TOKEN_URL`
    #[serde(default = "default_amazon_ads_token_url")]
    pub token_url: String,
}

/// Throughput cap and retry policy shared by every upstream call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RateLimitConfig {
    /// Operations admitted per rolling window (default: 2)
    ///
    /// Environment variable: `ADS_CONNECT_RATE_LIMIT_OPS_PER_WINDOW`
    #[serde(default = "default_rate_limit_ops_per_window")]
    pub ops_per_window: u32,

    /// Length of the rolling window in milliseconds (default: 1000)
    #[serde(default = "default_rate_limit_window_ms")]
    pub window_ms: u64,

    /// Starting backoff delay in milliseconds (default: 1000)
    ///
    /// Subsequent retries use `base_delay_ms * 2^attempt`, capped at `max_delay_ms`.
    #[serde(default = "default_rate_limit_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for computed backoff in milliseconds (default: 60000)
    #[serde(default = "default_rate_limit_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Random jitter applied on top of computed backoff (default: 0.1, range: 0.0-1.0)
    #[serde(default = "default_rate_limit_jitter_factor")]
    pub jitter_factor: f64,

    /// Retries after rate-limit responses before giving up (default: 5)
    #[serde(default = "default_rate_limit_max_retries")]
    pub max_retries: u32,

    /// Retries after network, timeout or 5xx failures (default: 3)
    #[serde(default = "default_rate_limit_max_transient_retries")]
    pub max_transient_retries: u32,

    /// Deadline for a single upstream attempt in seconds (default: 30)
    #[serde(default = "default_rate_limit_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

/// Proactive credential refresh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CredentialRefreshConfig {
    /// Background scan interval in seconds (default: 300)
    #[serde(default = "default_credential_refresh_tick_seconds")]
    pub tick_seconds: u64,

    /// Refresh tokens expiring within this many seconds (default: 600)
    #[serde(default = "default_credential_refresh_lead_time_seconds")]
    pub lead_time_seconds: u64,

    /// Maximum number of concurrent refresh operations (default: 10)
    #[serde(default = "default_credential_refresh_concurrency")]
    pub concurrency: u32,

    /// Consecutive failures after which a credential is disabled (default: 5)
    #[serde(default = "default_credential_refresh_failure_threshold")]
    pub failure_threshold: u32,
}

/// Account synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncConfig {
    /// Time budget for one category listing in seconds (default: 30)
    #[serde(default = "default_sync_adapter_timeout_seconds")]
    pub adapter_timeout_seconds: u64,

    /// Interval between scheduled syncs of every connected user; 0 disables (default: 0)
    #[serde(default)]
    pub interval_seconds: u64,

    /// Scheduled syncs allowed to run at once (default: 4)
    #[serde(default = "default_sync_max_concurrent")]
    pub max_concurrent: u32,

    /// Page size requested from the advertising accounts listing (default: 100)
    #[serde(default = "default_sync_advertising_page_size")]
    pub advertising_page_size: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            crypto_key: None,
            amazon_ads: AmazonAdsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            credential_refresh: CredentialRefreshConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for AmazonAdsConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            api_base: default_amazon_ads_api_base(),
            token_url: default_amazon_ads_token_url(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ops_per_window: default_rate_limit_ops_per_window(),
            window_ms: default_rate_limit_window_ms(),
            base_delay_ms: default_rate_limit_base_delay_ms(),
            max_delay_ms: default_rate_limit_max_delay_ms(),
            jitter_factor: default_rate_limit_jitter_factor(),
            max_retries: default_rate_limit_max_retries(),
            max_transient_retries: default_rate_limit_max_transient_retries(),
            request_timeout_seconds: default_rate_limit_request_timeout_seconds(),
        }
    }
}

impl Default for CredentialRefreshConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_credential_refresh_tick_seconds(),
            lead_time_seconds: default_credential_refresh_lead_time_seconds(),
            concurrency: default_credential_refresh_concurrency(),
            failure_threshold: default_credential_refresh_failure_threshold(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            adapter_timeout_seconds: default_sync_adapter_timeout_seconds(),
            interval_seconds: 0,
            max_concurrent: default_sync_max_concurrent(),
            advertising_page_size: default_sync_advertising_page_size(),
        }
    }
}

impl AmazonAdsConfig {
    /// Validate endpoint URLs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("api_base", &self.api_base), ("token_url", &self.token_url)] {
            Url::parse(value).map_err(|source| ConfigError::InvalidAmazonAdsUrl {
                field,
                value: value.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

impl RateLimitConfig {
    /// Validate rate limit configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ops_per_window == 0 || self.window_ms == 0 {
            return Err(ConfigError::InvalidRateLimitWindow {
                ops: self.ops_per_window,
                window_ms: self.window_ms,
            });
        }

        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::InvalidRateLimitBounds {
                base: self.base_delay_ms,
                max: self.max_delay_ms,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidRateLimitJitter {
                value: self.jitter_factor,
            });
        }

        if self.max_transient_retries > self.max_retries {
            return Err(ConfigError::InvalidRateLimitRetryBudgets {
                rate_limited: self.max_retries,
                transient: self.max_transient_retries,
            });
        }

        if self.request_timeout_seconds == 0 {
            return Err(ConfigError::InvalidRateLimitTimeout);
        }

        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl CredentialRefreshConfig {
    /// Validate credential refresh configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_seconds < 60 || self.tick_seconds > 3600 {
            return Err(ConfigError::InvalidRefreshTickInterval {
                value: self.tick_seconds,
            });
        }

        // A lead time shorter than the tick would let tokens expire between scans
        if self.lead_time_seconds < self.tick_seconds || self.lead_time_seconds > 86400 {
            return Err(ConfigError::InvalidRefreshLeadTime {
                value: self.lead_time_seconds,
                tick: self.tick_seconds,
            });
        }

        if self.concurrency == 0 || self.concurrency > 50 {
            return Err(ConfigError::InvalidRefreshConcurrency {
                value: self.concurrency,
            });
        }

        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidRefreshFailureThreshold);
        }

        Ok(())
    }
}

impl SyncConfig {
    /// Validate sync configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.adapter_timeout_seconds == 0 || self.adapter_timeout_seconds > 600 {
            return Err(ConfigError::InvalidSyncAdapterTimeout {
                value: self.adapter_timeout_seconds,
            });
        }

        if self.interval_seconds != 0 && self.interval_seconds < 300 {
            return Err(ConfigError::InvalidSyncInterval {
                value: self.interval_seconds,
            });
        }

        if self.max_concurrent == 0 {
            return Err(ConfigError::InvalidSyncConcurrency);
        }

        if !(1..=100).contains(&self.advertising_page_size) {
            return Err(ConfigError::InvalidSyncPageSize {
                value: self.advertising_page_size,
            });
        }

        Ok(())
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_seconds)
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    fn is_local_profile(&self) -> bool {
        matches!(self.profile.as_str(), "local" | "test")
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec!["[REDACTED]".to_string()];
        }
        if config.crypto_key.is_some() {
            config.crypto_key = Some(b"[REDACTED]".to_vec());
        }
        if config.amazon_ads.client_secret.is_some() {
            config.amazon_ads.client_secret = Some("[REDACTED]".to_string());
        }
        if let Ok(mut url) = Url::parse(&config.database_url)
            && url.password().is_some()
            && url.set_password(Some("REDACTED")).is_ok()
        {
            config.database_url = url.to_string();
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.crypto_key {
            Some(ref key) if key.len() != 32 => {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
            Some(_) => {}
            None => return Err(ConfigError::MissingCryptoKey),
        }

        if self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        // Local and test profiles talk to stub upstreams without app credentials
        if !self.is_local_profile() {
            if self.amazon_ads.client_id.is_none() {
                return Err(ConfigError::MissingAmazonAdsClientId);
            }
            if self.amazon_ads.client_secret.is_none() {
                return Err(ConfigError::MissingAmazonAdsClientSecret);
            }
        }

        self.amazon_ads.validate()?;
        self.rate_limit.validate()?;
        self.credential_refresh.validate()?;
        self.sync.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgresql://ads_connect@localhost:5432/ads_connect".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_amazon_ads_api_base() -> String {
    "https://advertising-api.amazon.com".to_string()
}

fn default_amazon_ads_token_url() -> String {
    "https://api.amazon.com/auth/o2/token".to_string()
}

fn default_rate_limit_ops_per_window() -> u32 {
    2
}

fn default_rate_limit_window_ms() -> u64 {
    1000 // 1 second
}

fn default_rate_limit_base_delay_ms() -> u64 {
    1000 // 1 second
}

fn default_rate_limit_max_delay_ms() -> u64 {
    60_000 // 1 minute
}

fn default_rate_limit_jitter_factor() -> f64 {
    0.1 // 10% jitter
}

fn default_rate_limit_max_retries() -> u32 {
    5
}

fn default_rate_limit_max_transient_retries() -> u32 {
    3
}

fn default_rate_limit_request_timeout_seconds() -> u64 {
    30
}

fn default_credential_refresh_tick_seconds() -> u64 {
    300 // 5 minutes
}

fn default_credential_refresh_lead_time_seconds() -> u64 {
    600 // 10 minutes
}

fn default_credential_refresh_concurrency() -> u32 {
    10
}

fn default_credential_refresh_failure_threshold() -> u32 {
    5
}

fn default_sync_adapter_timeout_seconds() -> u64 {
    30
}

fn default_sync_max_concurrent() -> u32 {
    4
}

fn default_sync_advertising_page_size() -> u32 {
    100
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error(
        "no operator tokens configured; set ADS_CONNECT_OPERATOR_TOKEN or ADS_CONNECT_OPERATOR_TOKENS"
    )]
    MissingOperatorTokens,
    #[error("crypto key is missing; set ADS_CONNECT_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("Amazon Ads client ID is missing; set ADS_CONNECT_AMAZON_ADS_CLIENT_ID")]
    MissingAmazonAdsClientId,
    #[error("Amazon Ads client secret is missing; set ADS_CONNECT_AMAZON_ADS_CLIENT_SECRET")]
    MissingAmazonAdsClientSecret,
    #[error("Amazon Ads {field} '{value}' is not a valid URL: {source}")]
    InvalidAmazonAdsUrl {
        field: &'static str,
        value: String,
        source: url::ParseError,
    },
    #[error("rate limit must admit at least one operation per non-empty window (ops: {ops}, window: {window_ms}ms)")]
    InvalidRateLimitWindow { ops: u32, window_ms: u64 },
    #[error("rate limit base delay ({base}ms) cannot be greater than max delay ({max}ms)")]
    InvalidRateLimitBounds { base: u64, max: u64 },
    #[error("rate limit jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidRateLimitJitter { value: f64 },
    #[error(
        "transient retry budget ({transient}) must not exceed the rate limit retry budget ({rate_limited})"
    )]
    InvalidRateLimitRetryBudgets { rate_limited: u32, transient: u32 },
    #[error("upstream request timeout must be at least 1 second")]
    InvalidRateLimitTimeout,
    #[error("credential refresh tick interval must be between 60 and 3600 seconds, got {value}")]
    InvalidRefreshTickInterval { value: u64 },
    #[error(
        "credential refresh lead time must be at least the tick interval ({tick}s) and at most 86400 seconds, got {value}"
    )]
    InvalidRefreshLeadTime { value: u64, tick: u64 },
    #[error("credential refresh concurrency must be between 1 and 50, got {value}")]
    InvalidRefreshConcurrency { value: u32 },
    #[error("credential refresh failure threshold must be at least 1")]
    InvalidRefreshFailureThreshold,
    #[error("sync adapter timeout must be between 1 and 600 seconds, got {value}")]
    InvalidSyncAdapterTimeout { value: u64 },
    #[error("sync interval must be 0 (disabled) or at least 300 seconds, got {value}")]
    InvalidSyncInterval { value: u64 },
    #[error("sync max concurrent must be at least 1")]
    InvalidSyncConcurrency,
    #[error("advertising page size must be between 1 and 100, got {value}")]
    InvalidSyncPageSize { value: u32 },
}

/// Loads configuration using layered `.env` files and `ADS_CONNECT_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.<profile>`, `.env.<profile>.local`, then
    /// the process environment, each layer overriding the previous one.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = non_empty(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let api_bind_addr =
            non_empty(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = non_empty(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format = non_empty(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            non_empty(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = parsed(&mut layered, "DB_MAX_CONNECTIONS")
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")
            .unwrap_or_else(default_db_acquire_timeout_ms);

        // Support both a single token and a comma-separated list
        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            tokens
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else if let Some(token) = non_empty(&mut layered, "OPERATOR_TOKEN") {
            vec![token]
        } else {
            Vec::new()
        };

        let crypto_key = match non_empty(&mut layered, "CRYPTO_KEY") {
            Some(key_str) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(key_str.trim()).map_err(|e| {
                    ConfigError::InvalidCryptoKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let amazon_ads = AmazonAdsConfig {
            client_id: non_empty(&mut layered, "AMAZON_ADS_CLIENT_ID"),
            client_secret: non_empty(&mut layered, "AMAZON_ADS_CLIENT_SECRET"),
            api_base: non_empty(&mut layered, "AMAZON_ADS_API_BASE")
                .unwrap_or_else(default_amazon_ads_api_base),
            token_url: non_empty(&mut layered, "AMAZON_ADS_TOKEN_URL")
                .unwrap_or_else(default_amazon_ads_token_url),
        };

        let rate_limit = RateLimitConfig {
            ops_per_window: parsed(&mut layered, "RATE_LIMIT_OPS_PER_WINDOW")
                .unwrap_or_else(default_rate_limit_ops_per_window),
            window_ms: parsed(&mut layered, "RATE_LIMIT_WINDOW_MS")
                .unwrap_or_else(default_rate_limit_window_ms),
            base_delay_ms: parsed(&mut layered, "RATE_LIMIT_BASE_DELAY_MS")
                .unwrap_or_else(default_rate_limit_base_delay_ms),
            max_delay_ms: parsed(&mut layered, "RATE_LIMIT_MAX_DELAY_MS")
                .unwrap_or_else(default_rate_limit_max_delay_ms),
            jitter_factor: parsed(&mut layered, "RATE_LIMIT_JITTER_FACTOR")
                .unwrap_or_else(default_rate_limit_jitter_factor),
            max_retries: parsed(&mut layered, "RATE_LIMIT_MAX_RETRIES")
                .unwrap_or_else(default_rate_limit_max_retries),
            max_transient_retries: parsed(&mut layered, "RATE_LIMIT_MAX_TRANSIENT_RETRIES")
                .unwrap_or_else(default_rate_limit_max_transient_retries),
            request_timeout_seconds: parsed(&mut layered, "RATE_LIMIT_REQUEST_TIMEOUT_SECONDS")
                .unwrap_or_else(default_rate_limit_request_timeout_seconds),
        };

        let credential_refresh = CredentialRefreshConfig {
            tick_seconds: parsed(&mut layered, "CREDENTIAL_REFRESH_TICK_SECONDS")
                .unwrap_or_else(default_credential_refresh_tick_seconds),
            lead_time_seconds: parsed(&mut layered, "CREDENTIAL_REFRESH_LEAD_TIME_SECONDS")
                .unwrap_or_else(default_credential_refresh_lead_time_seconds),
            concurrency: parsed(&mut layered, "CREDENTIAL_REFRESH_CONCURRENCY")
                .unwrap_or_else(default_credential_refresh_concurrency),
            failure_threshold: parsed(&mut layered, "CREDENTIAL_REFRESH_FAILURE_THRESHOLD")
                .unwrap_or_else(default_credential_refresh_failure_threshold),
        };

        let sync = SyncConfig {
            adapter_timeout_seconds: parsed(&mut layered, "SYNC_ADAPTER_TIMEOUT_SECONDS")
                .unwrap_or_else(default_sync_adapter_timeout_seconds),
            interval_seconds: parsed(&mut layered, "SYNC_INTERVAL_SECONDS").unwrap_or_default(),
            max_concurrent: parsed(&mut layered, "SYNC_MAX_CONCURRENT")
                .unwrap_or_else(default_sync_max_concurrent),
            advertising_page_size: parsed(&mut layered, "SYNC_ADVERTISING_PAGE_SIZE")
                .unwrap_or_else(default_sync_advertising_page_size),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            operator_tokens,
            crypto_key,
            amazon_ads,
            rate_limit,
            credential_refresh,
            sync,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(layered: &mut BTreeMap<String, String>, key: &str) -> Option<T> {
    layered.remove(key).and_then(|v| v.trim().parse().ok())
}
