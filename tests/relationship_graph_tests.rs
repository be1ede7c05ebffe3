//! Integration tests for relationship edges and account disconnection.

mod test_utils;

use ads_connect::adapters::NormalizedAccount;
use ads_connect::error::AdsError;
use ads_connect::models::{AccountCategory, AccountStatus, RelationshipKind, account};
use ads_connect::repositories::{AccountRepository, RelationshipGraph};
use chrono::Utc;
use serde_json::json;
use test_utils::setup_test_db_arc;
use uuid::Uuid;

struct Fixture {
    accounts: AccountRepository,
    graph: RelationshipGraph,
    user_id: Uuid,
}

impl Fixture {
    async fn new() -> Self {
        let db = setup_test_db_arc().await.expect("test db");
        Self {
            accounts: AccountRepository::new(db.clone()),
            graph: RelationshipGraph::new(db),
            user_id: Uuid::new_v4(),
        }
    }

    async fn account(&self, category: AccountCategory, external_id: &str) -> account::Model {
        let normalized = NormalizedAccount {
            category,
            external_id: external_id.to_string(),
            display_name: format!("{} {}", category, external_id),
            status: AccountStatus::Active,
            metadata: json!({}),
            linked_advertisers: Vec::new(),
        };
        let (model, inserted) = self
            .accounts
            .upsert_by_external_id(self.user_id, &normalized, Utc::now())
            .await
            .expect("upsert account");
        assert!(inserted);
        model
    }
}

#[tokio::test]
async fn upserting_the_same_edge_twice_stores_it_once() {
    let f = Fixture::new().await;
    let advertiser = f.account(AccountCategory::Advertising, "a1").await;
    let amc = f.account(AccountCategory::Amc, "amc-1").await;

    let first = f
        .graph
        .upsert_edge(advertiser.id, amc.id, RelationshipKind::AdvertisingToAmc)
        .await
        .unwrap();
    let second = f
        .graph
        .upsert_edge(advertiser.id, amc.id, RelationshipKind::AdvertisingToAmc)
        .await
        .unwrap();

    assert!(first);
    assert!(!second);
    let related = f.graph.get_related(amc.id).await.unwrap();
    assert_eq!(related.parents.len(), 1);
    assert_eq!(related.parents[0].account.id, advertiser.id);
    assert_eq!(related.parents[0].kind, RelationshipKind::AdvertisingToAmc);
    assert!(related.children.is_empty());

    let from_parent = f.graph.get_related(advertiser.id).await.unwrap();
    assert_eq!(from_parent.children.len(), 1);
    assert_eq!(from_parent.children[0].account.id, amc.id);
}

#[tokio::test]
async fn self_edges_are_rejected() {
    let f = Fixture::new().await;
    let advertiser = f.account(AccountCategory::Advertising, "a1").await;

    let result = f
        .graph
        .upsert_edge(advertiser.id, advertiser.id, RelationshipKind::AdvertisingToDsp)
        .await;

    assert!(matches!(result, Err(AdsError::GraphValidation(_))));
}

#[tokio::test]
async fn edges_to_missing_accounts_are_rejected() {
    let f = Fixture::new().await;
    let advertiser = f.account(AccountCategory::Advertising, "a1").await;

    let result = f
        .graph
        .upsert_edge(advertiser.id, Uuid::new_v4(), RelationshipKind::AdvertisingToAmc)
        .await;

    assert!(matches!(result, Err(AdsError::GraphValidation(_))));
}

#[tokio::test]
async fn edge_kind_must_match_endpoint_categories() {
    let f = Fixture::new().await;
    let dsp = f.account(AccountCategory::Dsp, "dsp-1").await;
    let amc = f.account(AccountCategory::Amc, "amc-1").await;

    let wrong_kind = f
        .graph
        .upsert_edge(dsp.id, amc.id, RelationshipKind::AdvertisingToAmc)
        .await;
    let reversed = f
        .graph
        .upsert_edge(amc.id, dsp.id, RelationshipKind::DspToAmc)
        .await;

    assert!(matches!(wrong_kind, Err(AdsError::GraphValidation(_))));
    assert!(matches!(reversed, Err(AdsError::GraphValidation(_))));
}

#[tokio::test]
async fn related_accounts_of_unknown_account_is_not_found() {
    let f = Fixture::new().await;

    let result = f.graph.get_related(Uuid::new_v4()).await;

    assert!(matches!(result, Err(AdsError::NotFound { .. })));
}

#[tokio::test]
async fn ancestors_and_descendants_are_transitive() {
    let f = Fixture::new().await;
    let advertiser = f.account(AccountCategory::Advertising, "a1").await;
    let dsp = f.account(AccountCategory::Dsp, "dsp-1").await;
    let amc = f.account(AccountCategory::Amc, "amc-1").await;

    f.graph
        .upsert_edge(advertiser.id, dsp.id, RelationshipKind::AdvertisingToDsp)
        .await
        .unwrap();
    f.graph
        .upsert_edge(dsp.id, amc.id, RelationshipKind::DspToAmc)
        .await
        .unwrap();
    f.graph
        .upsert_edge(advertiser.id, amc.id, RelationshipKind::AdvertisingToAmc)
        .await
        .unwrap();

    let mut ancestors: Vec<_> = f
        .graph
        .ancestors(amc.id)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.id)
        .collect();
    ancestors.sort();
    let mut expected = vec![advertiser.id, dsp.id];
    expected.sort();
    assert_eq!(ancestors, expected);

    let mut descendants: Vec<_> = f
        .graph
        .descendants(advertiser.id)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.id)
        .collect();
    descendants.sort();
    let mut expected = vec![dsp.id, amc.id];
    expected.sort();
    assert_eq!(descendants, expected);

    assert!(f.graph.descendants(amc.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn disconnecting_an_account_removes_its_edges() {
    let f = Fixture::new().await;
    let advertiser = f.account(AccountCategory::Advertising, "a1").await;
    let dsp = f.account(AccountCategory::Dsp, "dsp-1").await;
    let amc = f.account(AccountCategory::Amc, "amc-1").await;
    f.graph
        .upsert_edge(advertiser.id, amc.id, RelationshipKind::AdvertisingToAmc)
        .await
        .unwrap();
    f.graph
        .upsert_edge(dsp.id, amc.id, RelationshipKind::DspToAmc)
        .await
        .unwrap();

    f.accounts.disconnect(amc.id).await.unwrap();

    assert!(matches!(
        f.accounts.get(amc.id).await,
        Err(AdsError::NotFound { .. })
    ));
    assert!(f.graph.get_related(advertiser.id).await.unwrap().children.is_empty());
    assert!(f.graph.get_related(dsp.id).await.unwrap().children.is_empty());
    assert!(matches!(
        f.accounts.disconnect(amc.id).await,
        Err(AdsError::NotFound { .. })
    ));
}
