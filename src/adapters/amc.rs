//! AMC instances source. Besides the instance itself, extracts the linked
//! advertiser identifiers the relationship graph is built from.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, instrument};

use super::{
    AccountSource, LinkedAdvertiserRef, ListingContext, NormalizedAccount, SourceListing,
    map_status,
};
use crate::ads_api::{AdsApi, AmcInstance};
use crate::error::AdsError;
use crate::models::AccountCategory;
use crate::rate_limit::RateLimitedExecutor;

pub struct AmcSource {
    api: Arc<dyn AdsApi>,
    executor: Arc<RateLimitedExecutor>,
}

impl AmcSource {
    pub fn new(api: Arc<dyn AdsApi>, executor: Arc<RateLimitedExecutor>) -> Self {
        Self { api, executor }
    }
}

#[async_trait]
impl AccountSource for AmcSource {
    fn category(&self) -> AccountCategory {
        AccountCategory::Amc
    }

    #[instrument(skip_all, fields(category = "amc"))]
    async fn list_accounts(
        &self,
        access_token: &str,
        ctx: &ListingContext,
    ) -> Result<SourceListing, AdsError> {
        let api = self.api.as_ref();
        let listed = ctx
            .run(self.executor.execute("list_amc_instances", move || {
                api.list_amc_instances(access_token)
            }))
            .await;

        match listed {
            Ok(instances) => Ok(SourceListing::complete(
                instances.iter().map(normalize).collect(),
            )),
            Err(AdsError::AccessDenied(_)) => {
                info!("User has no AMC entitlement");
                Ok(SourceListing::access_denied())
            }
            Err(error) => Err(error),
        }
    }
}

fn category_hint(advertiser_type: Option<&str>) -> Option<AccountCategory> {
    match advertiser_type?.to_ascii_uppercase().as_str() {
        "SPONSORED_ADS" => Some(AccountCategory::Advertising),
        "DSP" => Some(AccountCategory::Dsp),
        _ => None,
    }
}

fn normalize(instance: &AmcInstance) -> NormalizedAccount {
    let linked_advertisers: Vec<LinkedAdvertiserRef> = instance
        .linked_advertisers
        .iter()
        .filter(|linked| !linked.advertiser_id.is_empty())
        .map(|linked| LinkedAdvertiserRef {
            external_id: linked.advertiser_id.clone(),
            category_hint: category_hint(linked.advertiser_type.as_deref()),
        })
        .collect();

    let linked_metadata: Vec<_> = instance
        .linked_advertisers
        .iter()
        .map(|linked| {
            json!({
                "advertiser_id": linked.advertiser_id,
                "advertiser_type": linked.advertiser_type,
            })
        })
        .collect();

    NormalizedAccount {
        category: AccountCategory::Amc,
        external_id: instance.instance_id.clone(),
        display_name: instance.instance_name.clone(),
        status: map_status(instance.status.as_deref()),
        metadata: json!({
            "region": instance.region,
            "linked_advertisers": linked_metadata,
        }),
        linked_advertisers,
    }
}
