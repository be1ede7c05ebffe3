//! HTTP-level tests for the Amazon Ads client and the account sources built
//! on it, against a wiremock upstream.

mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use ads_connect::adapters::{
    AccountSource, AdvertisingSource, AmcSource, DspSource, ListingContext,
};
use ads_connect::ads_api::{AdsApi, HttpAdsApi, UpstreamError};
use ads_connect::error::AdsError;
use ads_connect::models::{AccountCategory, AccountStatus};
use ads_connect::rate_limit::RateLimitedExecutor;
use serde_json::json;
use test_utils::fast_rate_limit;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CLIENT_ID: &str = "amzn1.application-oa2-client.test";

fn client(server: &MockServer) -> Arc<HttpAdsApi> {
    Arc::new(HttpAdsApi::new(
        reqwest::Client::new(),
        server.uri(),
        format!("{}/auth/o2/token", server.uri()),
        CLIENT_ID,
        "secret",
    ))
}

fn executor() -> Arc<RateLimitedExecutor> {
    Arc::new(RateLimitedExecutor::new(&fast_rate_limit()))
}

fn ctx() -> ListingContext {
    ListingContext::new(CancellationToken::new(), Duration::from_secs(10))
}

fn advertising_page(ids: &[&str], next_token: Option<&str>) -> serde_json::Value {
    let accounts: Vec<_> = ids
        .iter()
        .map(|id| {
            json!({
                "adsAccountId": id,
                "accountName": format!("Account {}", id),
                "status": "CREATED",
                "alternateIds": [
                    {"countryCode": "US", "profileId": 42, "entityId": format!("ENTITY{}", id)}
                ]
            })
        })
        .collect();
    json!({ "adsAccounts": accounts, "nextToken": next_token })
}

#[tokio::test]
async fn advertising_listing_follows_next_token_with_required_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/adsAccounts/list"))
        .and(body_partial_json(json!({"nextToken": "page-2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(advertising_page(&["a3"], None)))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/adsAccounts/list"))
        .and(header("Authorization", "Bearer atza-token"))
        .and(header("Amazon-Advertising-API-ClientId", CLIENT_ID))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(advertising_page(&["a1", "a2"], Some("page-2"))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let source = AdvertisingSource::new(client(&server), executor(), 2);
    let listing = source.list_accounts("atza-token", &ctx()).await.unwrap();

    let ids: Vec<_> = listing.accounts.iter().map(|a| a.external_id.as_str()).collect();
    assert_eq!(ids, vec!["a1", "a2", "a3"]);
    assert!(listing.partial_failure.is_none());
    assert!(!listing.access_denied);
    let first = &listing.accounts[0];
    assert_eq!(first.category, AccountCategory::Advertising);
    assert_eq!(first.status, AccountStatus::Active);
    assert_eq!(first.metadata["countries"]["US"]["profile_id"], 42);
}

#[tokio::test]
async fn advertising_page_failure_returns_fetched_pages_as_partial() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/adsAccounts/list"))
        .and(body_partial_json(json!({"nextToken": "page-2"})))
        .respond_with(ResponseTemplate::new(503))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/adsAccounts/list"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(advertising_page(&["a1", "a2"], Some("page-2"))),
        )
        .mount(&server)
        .await;

    let source = AdvertisingSource::new(client(&server), executor(), 2);
    let listing = source.list_accounts("atza-token", &ctx()).await.unwrap();

    assert_eq!(listing.accounts.len(), 2);
    assert!(matches!(
        listing.partial_failure,
        Some(AdsError::PartialPageFailure { pages_fetched: 1, .. })
    ));
}

#[tokio::test]
async fn dsp_forbidden_is_reported_as_access_denied() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dsp/advertisers"))
        .respond_with(ResponseTemplate::new(403).set_body_string("not entitled"))
        .expect(1)
        .mount(&server)
        .await;

    let source = DspSource::new(client(&server), executor());
    let listing = source.list_accounts("atza-token", &ctx()).await.unwrap();

    assert!(listing.access_denied);
    assert!(listing.accounts.is_empty());
}

#[tokio::test]
async fn dsp_advertisers_are_normalized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dsp/advertisers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": [{
                "advertiserId": "dsp-1",
                "name": "DSP One",
                "countryCode": "GB",
                "currency": "GBP",
                "timezone": "Europe/London",
                "status": "ACTIVE",
                "seats": [{"exchangeId": "x1", "exchangeName": "Exchange", "seatId": "s1"}]
            }]
        })))
        .mount(&server)
        .await;

    let source = DspSource::new(client(&server), executor());
    let listing = source.list_accounts("atza-token", &ctx()).await.unwrap();

    assert_eq!(listing.accounts.len(), 1);
    let account = &listing.accounts[0];
    assert_eq!(account.category, AccountCategory::Dsp);
    assert_eq!(account.metadata["currency"], "GBP");
    assert_eq!(account.metadata["seats"][0]["seat_id"], "s1");
}

#[tokio::test]
async fn amc_instances_carry_linked_advertisers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/amc/instances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instances": [{
                "instanceId": "amc-1",
                "instanceName": "Clean room",
                "status": "ACTIVE",
                "region": "NA",
                "linkedAdvertisers": [
                    {"advertiserId": "a1", "advertiserType": "SPONSORED_ADS"},
                    {"advertiserId": "dsp-1", "advertiserType": "DSP"}
                ]
            }]
        })))
        .mount(&server)
        .await;

    let source = AmcSource::new(client(&server), executor());
    let listing = source.list_accounts("atza-token", &ctx()).await.unwrap();

    let instance = &listing.accounts[0];
    assert_eq!(instance.linked_advertisers.len(), 2);
    assert_eq!(
        instance.linked_advertisers[1].category_hint,
        Some(AccountCategory::Dsp)
    );
}

#[tokio::test]
async fn rate_limited_call_honors_retry_after_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/amc/instances"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/amc/instances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"instances": []})))
        .mount(&server)
        .await;

    let source = AmcSource::new(client(&server), executor());
    let started = std::time::Instant::now();
    let listing = source.list_accounts("atza-token", &ctx()).await.unwrap();

    assert!(listing.accounts.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn persistent_rate_limiting_exhausts_the_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dsp/advertisers"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let source = DspSource::new(client(&server), executor());
    let result = source.list_accounts("atza-token", &ctx()).await;

    // One initial attempt plus max_retries (2) in the fast configuration.
    assert!(matches!(result, Err(AdsError::RateLimitExceeded { attempts: 3 })));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dsp/advertisers"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such route"))
        .mount(&server)
        .await;

    let source = DspSource::new(client(&server), executor());
    let result = source.list_accounts("atza-token", &ctx()).await;

    assert!(matches!(
        result,
        Err(AdsError::UpstreamRejected { status: 404, .. })
    ));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn refresh_posts_the_grant_and_parses_the_token_pair() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/o2/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=atzr-old"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "atza-new",
            "refresh_token": "atzr-new",
            "token_type": "bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let grant = client(&server).refresh_token("atzr-old").await.unwrap();

    assert_eq!(grant.access_token, "atza-new");
    assert_eq!(grant.refresh_token.as_deref(), Some("atzr-new"));
    assert_eq!(grant.expires_in, 3600);
}

#[tokio::test]
async fn invalid_grant_maps_to_auth_expired() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/o2/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "The request has an invalid grant parameter"
        })))
        .mount(&server)
        .await;

    let api = client(&server);
    let raw = api.refresh_token("atzr-revoked").await;
    assert!(matches!(raw, Err(UpstreamError::InvalidGrant(ref code)) if code.starts_with("invalid_grant")));

    let executor = executor();
    let api_ref = api.as_ref();
    let result = executor
        .execute("refresh_token", move || api_ref.refresh_token("atzr-revoked"))
        .await;
    assert!(matches!(result, Err(AdsError::AuthExpired(_))));
    assert!(result.unwrap_err().requires_reconnect());
}

#[tokio::test]
async fn undecodable_body_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/amc/instances"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let result = client(&server).list_amc_instances("atza-token").await;

    assert!(matches!(result, Err(UpstreamError::Malformed(_))));
}
