//! Advertising accounts source. Follows `nextToken` pagination to the end and
//! folds the per-country alternate identifiers into the account metadata.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};

use super::{AccountSource, ListingContext, NormalizedAccount, SourceListing, map_status};
use crate::ads_api::{AdsApi, AdvertisingAccount};
use crate::error::AdsError;
use crate::models::AccountCategory;
use crate::rate_limit::RateLimitedExecutor;

pub struct AdvertisingSource {
    api: Arc<dyn AdsApi>,
    executor: Arc<RateLimitedExecutor>,
    page_size: u32,
}

impl AdvertisingSource {
    pub fn new(api: Arc<dyn AdsApi>, executor: Arc<RateLimitedExecutor>, page_size: u32) -> Self {
        Self {
            api,
            executor,
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl AccountSource for AdvertisingSource {
    fn category(&self) -> AccountCategory {
        AccountCategory::Advertising
    }

    #[instrument(skip_all, fields(category = "advertising"))]
    async fn list_accounts(
        &self,
        access_token: &str,
        ctx: &ListingContext,
    ) -> Result<SourceListing, AdsError> {
        let api = self.api.as_ref();
        let page_size = self.page_size;
        let mut accounts = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages_fetched: u32 = 0;

        loop {
            let token = page_token.as_deref();
            let page = ctx
                .run(self.executor.execute("list_advertising_accounts", move || {
                    api.list_advertising_accounts(access_token, token, page_size)
                }))
                .await;

            match page {
                Ok(page) => {
                    pages_fetched += 1;
                    accounts.extend(page.ads_accounts.iter().map(normalize));
                    debug!(pages_fetched, total = accounts.len(), "Fetched advertising page");

                    match page.next_token.filter(|t| !t.is_empty()) {
                        Some(next) => page_token = Some(next),
                        None => break,
                    }
                }
                Err(AdsError::AccessDenied(_)) if pages_fetched == 0 => {
                    return Ok(SourceListing::access_denied());
                }
                Err(error) if pages_fetched == 0 => return Err(error),
                Err(error) => {
                    warn!(pages_fetched, error = %error, "Advertising pagination interrupted");
                    return Ok(SourceListing::partial(
                        accounts,
                        AdsError::PartialPageFailure {
                            pages_fetched,
                            reason: error.to_string(),
                        },
                    ));
                }
            }
        }

        Ok(SourceListing::complete(accounts))
    }
}

fn normalize(account: &AdvertisingAccount) -> NormalizedAccount {
    let mut countries = Map::new();
    let mut profile_ids = Vec::new();
    for alternate in &account.alternate_ids {
        let entry = countries
            .entry(alternate.country_code.clone())
            .or_insert_with(|| json!({}));
        if let Some(profile_id) = alternate.profile_id {
            entry["profile_id"] = json!(profile_id);
            if !profile_ids.contains(&profile_id) {
                profile_ids.push(profile_id);
            }
        }
        if let Some(entity_id) = &alternate.entity_id {
            entry["entity_id"] = json!(entity_id);
        }
    }

    NormalizedAccount {
        category: AccountCategory::Advertising,
        external_id: account.ads_account_id.clone(),
        display_name: account.account_name.clone(),
        status: map_status(account.status.as_deref()),
        metadata: json!({
            "countries": Value::Object(countries),
            "profile_ids": profile_ids,
        }),
        linked_advertisers: Vec::new(),
    }
}
