//! reqwest-backed [`AdsApi`] implementation.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{
    AdsApi, AdvertisingAccountPage, AmcInstance, DspAdvertiser, TokenGrant, UpstreamError,
    parse_retry_after,
};
use crate::config::AmazonAdsConfig;

const CLIENT_ID_HEADER: &str = "Amazon-Advertising-API-ClientId";

/// Amazon Ads client. Holds the application credentials; user tokens are
/// passed per call.
#[derive(Clone)]
pub struct HttpAdsApi {
    client: Client,
    api_base: String,
    token_url: String,
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct DspAdvertiserList {
    #[serde(default)]
    response: Vec<DspAdvertiser>,
}

#[derive(Deserialize)]
struct AmcInstanceList {
    #[serde(default)]
    instances: Vec<AmcInstance>,
}

impl HttpAdsApi {
    pub fn new(
        client: Client,
        api_base: impl Into<String>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Build from configuration. Missing app credentials become empty strings,
    /// which only local profiles accept.
    pub fn from_config(config: &AmazonAdsConfig) -> Self {
        Self::new(
            Client::new(),
            config.api_base.clone(),
            config.token_url.clone(),
            config.client_id.clone().unwrap_or_default(),
            config.client_secret.clone().unwrap_or_default(),
        )
    }

    fn authorized(&self, builder: RequestBuilder, access_token: &str) -> RequestBuilder {
        builder
            .bearer_auth(access_token)
            .header(CLIENT_ID_HEADER, &self.client_id)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        token_endpoint: bool,
    ) -> Result<T, UpstreamError> {
        let resp = request.send().await.map_err(classify_transport)?;
        let resp = check_status(resp, token_endpoint).await?;
        resp.json::<T>()
            .await
            .map_err(|e| UpstreamError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl AdsApi for HttpAdsApi {
    async fn list_advertising_accounts(
        &self,
        access_token: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<AdvertisingAccountPage, UpstreamError> {
        let mut body = json!({ "maxResults": page_size });
        if let Some(token) = page_token {
            body["nextToken"] = json!(token);
        }
        debug!(has_page_token = page_token.is_some(), "Listing advertising accounts");

        let request = self
            .authorized(
                self.client
                    .post(format!("{}/adsAccounts/list", self.api_base)),
                access_token,
            )
            .json(&body);
        self.send(request, false).await
    }

    async fn list_dsp_advertisers(
        &self,
        access_token: &str,
    ) -> Result<Vec<DspAdvertiser>, UpstreamError> {
        let request = self.authorized(
            self.client.get(format!("{}/dsp/advertisers", self.api_base)),
            access_token,
        );
        let list: DspAdvertiserList = self.send(request, false).await?;
        Ok(list.response)
    }

    async fn list_amc_instances(
        &self,
        access_token: &str,
    ) -> Result<Vec<AmcInstance>, UpstreamError> {
        let request = self.authorized(
            self.client.get(format!("{}/amc/instances", self.api_base)),
            access_token,
        );
        let list: AmcInstanceList = self.send(request, false).await?;
        Ok(list.instances)
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, UpstreamError> {
        let request = self.client.post(&self.token_url).form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ]);
        self.send(request, true).await
    }
}

async fn check_status(resp: Response, token_endpoint: bool) -> Result<Response, UpstreamError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
        resp.headers()
            .get("Retry-After")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| parse_retry_after(s, Utc::now()))
    } else {
        None
    };
    let body = resp.text().await.unwrap_or_default();

    warn!(
        status = status.as_u16(),
        retry_after_secs = retry_after.map(|d| d.as_secs()),
        "Amazon Ads request failed"
    );
    Err(UpstreamError::from_status(
        status.as_u16(),
        retry_after,
        &body,
        token_endpoint,
    ))
}

fn classify_transport(error: reqwest::Error) -> UpstreamError {
    if error.is_timeout() {
        UpstreamError::Timeout
    } else {
        UpstreamError::Network(error.to_string())
    }
}
