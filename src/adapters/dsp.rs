//! DSP advertisers source.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, instrument};

use super::{AccountSource, ListingContext, NormalizedAccount, SourceListing, map_status};
use crate::ads_api::{AdsApi, DspAdvertiser};
use crate::error::AdsError;
use crate::models::AccountCategory;
use crate::rate_limit::RateLimitedExecutor;

pub struct DspSource {
    api: Arc<dyn AdsApi>,
    executor: Arc<RateLimitedExecutor>,
}

impl DspSource {
    pub fn new(api: Arc<dyn AdsApi>, executor: Arc<RateLimitedExecutor>) -> Self {
        Self { api, executor }
    }
}

#[async_trait]
impl AccountSource for DspSource {
    fn category(&self) -> AccountCategory {
        AccountCategory::Dsp
    }

    #[instrument(skip_all, fields(category = "dsp"))]
    async fn list_accounts(
        &self,
        access_token: &str,
        ctx: &ListingContext,
    ) -> Result<SourceListing, AdsError> {
        let api = self.api.as_ref();
        let listed = ctx
            .run(self.executor.execute("list_dsp_advertisers", move || {
                api.list_dsp_advertisers(access_token)
            }))
            .await;

        match listed {
            Ok(advertisers) => Ok(SourceListing::complete(
                advertisers.iter().map(normalize).collect(),
            )),
            Err(AdsError::AccessDenied(_)) => {
                info!("User has no DSP entitlement");
                Ok(SourceListing::access_denied())
            }
            Err(error) => Err(error),
        }
    }
}

fn normalize(advertiser: &DspAdvertiser) -> NormalizedAccount {
    let seats: Vec<_> = advertiser
        .seats
        .iter()
        .map(|seat| {
            json!({
                "exchange_id": seat.exchange_id,
                "exchange_name": seat.exchange_name,
                "seat_id": seat.seat_id,
            })
        })
        .collect();

    NormalizedAccount {
        category: AccountCategory::Dsp,
        external_id: advertiser.advertiser_id.clone(),
        display_name: advertiser.name.clone(),
        status: map_status(advertiser.status.as_deref()),
        metadata: json!({
            "country_code": advertiser.country_code,
            "currency": advertiser.currency,
            "timezone": advertiser.timezone,
            "seats": seats,
        }),
        linked_advertisers: Vec::new(),
    }
}
