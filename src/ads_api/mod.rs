//! # Amazon Ads upstream client
//!
//! The [`AdsApi`] trait is the seam between the sync core and the Amazon
//! Advertising API. [`HttpAdsApi`] is the production implementation; tests
//! substitute in-process fakes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::AdsError;

mod http;

pub use http::HttpAdsApi;

/// Per-country identifier attached to an advertising account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlternateId {
    pub country_code: String,
    #[serde(default)]
    pub profile_id: Option<i64>,
    #[serde(default)]
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisingAccount {
    pub ads_account_id: String,
    pub account_name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub alternate_ids: Vec<AlternateId>,
}

/// One page of the advertising accounts listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisingAccountPage {
    #[serde(default)]
    pub ads_accounts: Vec<AdvertisingAccount>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DspAdvertiser {
    pub advertiser_id: String,
    pub name: String,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Seat identifiers per exchange
    #[serde(default)]
    pub seats: Vec<DspSeat>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DspSeat {
    pub exchange_id: String,
    #[serde(default)]
    pub exchange_name: Option<String>,
    pub seat_id: String,
}

/// Advertiser reference carried inside an AMC instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedAdvertiser {
    pub advertiser_id: String,
    /// `SPONSORED_ADS` or `DSP` when the upstream reports it
    #[serde(default)]
    pub advertiser_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmcInstance {
    pub instance_id: String,
    pub instance_name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub linked_advertisers: Vec<LinkedAdvertiser>,
}

/// Token pair returned by a refresh grant.
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Amazon normally rotates the refresh token; absent means keep the old one
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Operations the sync core needs from the Amazon Advertising API.
#[async_trait]
pub trait AdsApi: Send + Sync {
    async fn list_advertising_accounts(
        &self,
        access_token: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<AdvertisingAccountPage, UpstreamError>;

    async fn list_dsp_advertisers(
        &self,
        access_token: &str,
    ) -> Result<Vec<DspAdvertiser>, UpstreamError>;

    async fn list_amc_instances(&self, access_token: &str)
    -> Result<Vec<AmcInstance>, UpstreamError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, UpstreamError>;
}

/// How the rate-limited executor treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 429; retried under the rate-limit budget
    RateLimit,
    /// Network, timeout or 5xx; retried under the smaller transient budget
    Transient,
    /// Everything else; surfaced immediately
    Fatal,
}

/// A single failed upstream attempt, classified from the HTTP exchange.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("access token rejected")]
    Unauthorized,
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),
    #[error("forbidden")]
    Forbidden,
    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },
    #[error("server error {status}")]
    Server { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl UpstreamError {
    pub fn class(&self) -> FailureClass {
        match self {
            UpstreamError::RateLimited { .. } => FailureClass::RateLimit,
            UpstreamError::Server { .. } | UpstreamError::Network(_) | UpstreamError::Timeout => {
                FailureClass::Transient
            }
            UpstreamError::Unauthorized
            | UpstreamError::InvalidGrant(_)
            | UpstreamError::Forbidden
            | UpstreamError::Client { .. }
            | UpstreamError::Malformed(_) => FailureClass::Fatal,
        }
    }

    /// Classify a non-success response. `token_endpoint` selects the OAuth
    /// error mapping, where 400/401 mean the refresh token is no longer valid.
    pub fn from_status(
        status: u16,
        retry_after: Option<Duration>,
        body: &str,
        token_endpoint: bool,
    ) -> Self {
        match status {
            429 => UpstreamError::RateLimited { retry_after },
            400 | 401 if token_endpoint => UpstreamError::InvalidGrant(oauth_error_code(body)),
            401 => UpstreamError::Unauthorized,
            403 => UpstreamError::Forbidden,
            500..=599 => UpstreamError::Server { status },
            _ => UpstreamError::Client {
                status,
                body: truncate(body, 200),
            },
        }
    }
}

impl From<UpstreamError> for AdsError {
    /// Maps failures that are not retried. Retry exhaustion is mapped by the executor.
    fn from(error: UpstreamError) -> Self {
        match error {
            UpstreamError::InvalidGrant(reason) => AdsError::AuthExpired(reason),
            UpstreamError::Unauthorized => AdsError::AccessTokenRejected,
            UpstreamError::Forbidden => AdsError::AccessDenied("upstream returned 403".to_string()),
            UpstreamError::Client { status, body } => AdsError::UpstreamRejected {
                status,
                message: body,
            },
            UpstreamError::Malformed(details) => AdsError::MalformedResponse(details),
            UpstreamError::RateLimited { .. } => AdsError::RateLimitExceeded { attempts: 1 },
            other @ (UpstreamError::Server { .. }
            | UpstreamError::Network(_)
            | UpstreamError::Timeout) => AdsError::UpstreamUnavailable {
                attempts: 1,
                reason: other.to_string(),
            },
        }
    }
}

/// Parse a `Retry-After` value: delta seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

fn oauth_error_code(body: &str) -> String {
    #[derive(Deserialize)]
    struct OAuthError {
        error: String,
        #[serde(default)]
        error_description: Option<String>,
    }

    match serde_json::from_str::<OAuthError>(body) {
        Ok(OAuthError {
            error,
            error_description: Some(description),
        }) => format!("{error}: {description}"),
        Ok(OAuthError { error, .. }) => error,
        Err(_) => truncate(body, 200),
    }
}

fn truncate(body: &str, max_chars: usize) -> String {
    if body.chars().count() > max_chars {
        let truncated: String = body.chars().take(max_chars).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            UpstreamError::from_status(429, Some(Duration::from_secs(3)), "", false).class(),
            FailureClass::RateLimit
        );
        assert_eq!(
            UpstreamError::from_status(503, None, "", false).class(),
            FailureClass::Transient
        );
        assert_eq!(
            UpstreamError::from_status(404, None, "missing", false),
            UpstreamError::Client {
                status: 404,
                body: "missing".to_string()
            }
        );
        assert_eq!(
            UpstreamError::from_status(403, None, "", false),
            UpstreamError::Forbidden
        );
    }

    #[test]
    fn test_token_endpoint_maps_invalid_grant() {
        let error = UpstreamError::from_status(
            400,
            None,
            r#"{"error":"invalid_grant","error_description":"The request has an invalid grant parameter"}"#,
            true,
        );

        assert!(matches!(error, UpstreamError::InvalidGrant(ref reason) if reason.starts_with("invalid_grant")));
        assert!(matches!(AdsError::from(error), AdsError::AuthExpired(_)));
    }

    #[test]
    fn test_retry_after_parsing() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        assert_eq!(parse_retry_after("30", now), Some(Duration::from_secs(30)));
        assert_eq!(
            parse_retry_after("Thu, 01 Jan 2026 12:00:45 GMT", now),
            Some(Duration::from_secs(45))
        );
        assert_eq!(
            parse_retry_after("Thu, 01 Jan 2026 11:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_token_grant_debug_is_redacted() {
        let grant = TokenGrant {
            access_token: "Atza|abc".to_string(),
            refresh_token: Some("Atzr|def".to_string()),
            expires_in: 3600,
        };

        let rendered = format!("{:?}", grant);
        assert!(!rendered.contains("Atza"));
        assert!(!rendered.contains("Atzr"));
    }
}
