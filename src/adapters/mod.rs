//! # Account source adapters
//!
//! One [`AccountSource`] per account category. Each lists the accounts of its
//! category for a user through the shared rate-limited executor and
//! normalizes them into [`NormalizedAccount`] records.
//!
//! Entitlement gaps are results, not errors: a 403 yields an empty
//! [`SourceListing`] with `access_denied` set. A listing interrupted after
//! some data was fetched returns that data with `partial_failure` set.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::AdsError;
use crate::models::{AccountCategory, AccountStatus};

pub mod advertising;
pub mod amc;
pub mod dsp;
pub mod registry;

pub use advertising::AdvertisingSource;
pub use amc::AmcSource;
pub use dsp::DspSource;
pub use registry::SourceRegistry;

/// Advertiser referenced by an AMC instance, to be resolved into an edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedAdvertiserRef {
    pub external_id: String,
    /// Category the upstream says the advertiser belongs to, if it says
    pub category_hint: Option<AccountCategory>,
}

/// Category-independent account shape written to the account store.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAccount {
    pub category: AccountCategory,
    pub external_id: String,
    pub display_name: String,
    pub status: AccountStatus,
    pub metadata: Value,
    pub linked_advertisers: Vec<LinkedAdvertiserRef>,
}

/// Result of listing one category.
#[derive(Debug, Default)]
pub struct SourceListing {
    pub accounts: Vec<NormalizedAccount>,
    pub access_denied: bool,
    /// Set when the listing stopped early; `accounts` holds what was fetched
    pub partial_failure: Option<AdsError>,
}

impl SourceListing {
    pub fn complete(accounts: Vec<NormalizedAccount>) -> Self {
        Self {
            accounts,
            ..Self::default()
        }
    }

    pub fn access_denied() -> Self {
        Self {
            access_denied: true,
            ..Self::default()
        }
    }

    pub fn partial(accounts: Vec<NormalizedAccount>, failure: AdsError) -> Self {
        Self {
            accounts,
            access_denied: false,
            partial_failure: Some(failure),
        }
    }
}

/// Cancellation and deadline shared by every upstream call of one listing.
#[derive(Debug, Clone)]
pub struct ListingContext {
    pub cancel: CancellationToken,
    pub deadline: Instant,
    timeout: Duration,
}

impl ListingContext {
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    /// Drive `future` unless the listing is cancelled or its deadline passes first.
    pub async fn run<T, F>(&self, future: F) -> Result<T, AdsError>
    where
        F: Future<Output = Result<T, AdsError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AdsError::Cancelled),
            _ = sleep_until(self.deadline) => Err(AdsError::DeadlineExceeded {
                seconds: self.timeout.as_secs(),
            }),
            result = future => result,
        }
    }
}

/// Lists the accounts of one category.
#[async_trait]
pub trait AccountSource: Send + Sync {
    fn category(&self) -> AccountCategory;

    async fn list_accounts(
        &self,
        access_token: &str,
        ctx: &ListingContext,
    ) -> Result<SourceListing, AdsError>;
}

/// Map an upstream status string onto the account lifecycle.
pub(crate) fn map_status(status: Option<&str>) -> AccountStatus {
    let Some(status) = status else {
        return AccountStatus::Active;
    };
    match status.to_ascii_uppercase().as_str() {
        "CREATED" | "ACTIVE" | "ENABLED" | "RUNNING" => AccountStatus::Active,
        "DISABLED" | "INACTIVE" | "SUSPENDED" | "ARCHIVED" | "DELETED" => AccountStatus::Disabled,
        "PARTIALLY_CREATED" => AccountStatus::Partial,
        "PENDING" | "PROVISIONING" | "CREATING" => AccountStatus::Pending,
        _ => AccountStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(map_status(None), AccountStatus::Active);
        assert_eq!(map_status(Some("CREATED")), AccountStatus::Active);
        assert_eq!(map_status(Some("partially_created")), AccountStatus::Partial);
        assert_eq!(map_status(Some("PROVISIONING")), AccountStatus::Pending);
        assert_eq!(map_status(Some("SUSPENDED")), AccountStatus::Disabled);
        assert_eq!(map_status(Some("FAILED")), AccountStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn listing_context_enforces_deadline() {
        let ctx = ListingContext::new(CancellationToken::new(), Duration::from_secs(30));

        let result: Result<(), AdsError> = ctx
            .run(async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(AdsError::DeadlineExceeded { seconds: 30 })));
    }

    #[tokio::test]
    async fn listing_context_observes_cancellation() {
        let cancel = CancellationToken::new();
        let ctx = ListingContext::new(cancel.clone(), Duration::from_secs(30));
        cancel.cancel();

        let result = ctx.run(async { Ok(1) }).await;

        assert!(matches!(result, Err(AdsError::Cancelled)));
    }
}
