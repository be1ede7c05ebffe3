//! Integration tests for the encrypted credential store.

mod test_utils;

use ads_connect::error::AdsError;
use ads_connect::repositories::{CredentialInput, CredentialStore};
use chrono::{Duration, Utc};
use test_utils::{setup_test_db_arc, test_key};
use uuid::Uuid;

async fn store(threshold: u32) -> CredentialStore {
    let db = setup_test_db_arc().await.expect("test db");
    CredentialStore::new(db, test_key(), threshold)
}

fn input(user_id: Uuid, expires_in: Duration) -> CredentialInput {
    CredentialInput {
        user_id,
        access_token: "atza|access".to_string(),
        refresh_token: "atzr|refresh".to_string(),
        expires_at: Utc::now() + expires_in,
    }
}

#[tokio::test]
async fn tokens_are_encrypted_at_rest_and_decrypt_on_demand() {
    let store = store(5).await;
    let record = store
        .create(input(Uuid::new_v4(), Duration::hours(1)))
        .await
        .unwrap();

    assert!(
        !record
            .access_token_ciphertext
            .windows(b"atza|access".len())
            .any(|w| w == b"atza|access")
    );
    assert_eq!(store.access_token(&record).unwrap().as_str(), "atza|access");
    assert_eq!(store.refresh_token(&record).unwrap().as_str(), "atzr|refresh");
    assert!(record.proactive_refresh_enabled);
    assert_eq!(record.consecutive_refresh_failures, 0);
}

#[tokio::test]
async fn ciphertext_is_bound_to_its_record() {
    let store = store(5).await;
    let first = store
        .create(input(Uuid::new_v4(), Duration::hours(1)))
        .await
        .unwrap();
    let second = store
        .create(input(Uuid::new_v4(), Duration::hours(1)))
        .await
        .unwrap();

    let mut swapped = second.clone();
    swapped.access_token_ciphertext = first.access_token_ciphertext.clone();

    assert!(matches!(store.access_token(&swapped), Err(AdsError::Crypto(_))));
}

#[tokio::test]
async fn expiring_window_only_returns_enabled_records_soonest_first() {
    let store = store(5).await;
    let later = store
        .create(input(Uuid::new_v4(), Duration::minutes(8)))
        .await
        .unwrap();
    let sooner = store
        .create(input(Uuid::new_v4(), Duration::minutes(2)))
        .await
        .unwrap();
    let _far = store
        .create(input(Uuid::new_v4(), Duration::hours(2)))
        .await
        .unwrap();
    let disabled = store
        .create(input(Uuid::new_v4(), Duration::minutes(1)))
        .await
        .unwrap();
    store.disable(disabled.id, "invalid_grant").await.unwrap();

    let due = store
        .list_expiring_within(Utc::now(), Duration::minutes(10))
        .await
        .unwrap();

    let ids: Vec<_> = due.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![sooner.id, later.id]);
}

#[tokio::test]
async fn failures_accumulate_until_the_threshold_disables_the_record() {
    let store = store(3).await;
    let record = store
        .create(input(Uuid::new_v4(), Duration::minutes(5)))
        .await
        .unwrap();

    let first = store.mark_refresh_failure(record.id, "upstream 503").await.unwrap();
    assert_eq!(first.consecutive_refresh_failures, 1);
    assert!(first.proactive_refresh_enabled);

    store.mark_refresh_failure(record.id, "upstream 503").await.unwrap();
    let third = store.mark_refresh_failure(record.id, "timeout").await.unwrap();
    assert_eq!(third.consecutive_refresh_failures, 3);
    assert!(!third.proactive_refresh_enabled);
    assert_eq!(third.last_error.as_deref(), Some("timeout"));

    // Tokens survive failures untouched.
    assert_eq!(store.access_token(&third).unwrap().as_str(), "atza|access");
    assert_eq!(third.access_token_ciphertext, record.access_token_ciphertext);
}

#[tokio::test]
async fn refresh_success_replaces_tokens_and_resets_failures() {
    let store = store(5).await;
    let record = store
        .create(input(Uuid::new_v4(), Duration::minutes(5)))
        .await
        .unwrap();
    store.mark_refresh_failure(record.id, "upstream 503").await.unwrap();

    let expires_at = Utc::now() + Duration::hours(1);
    store
        .record_refresh_success(&record, "atza|new", Some("atzr|new"), expires_at)
        .await
        .unwrap();

    let updated = store.get(record.id).await.unwrap();
    assert_eq!(store.access_token(&updated).unwrap().as_str(), "atza|new");
    assert_eq!(store.refresh_token(&updated).unwrap().as_str(), "atzr|new");
    assert_eq!(updated.consecutive_refresh_failures, 0);
    assert!(updated.last_error.is_none());
    assert!(updated.last_refreshed_at.is_some());
    assert_eq!(updated.expires_at.timestamp(), expires_at.timestamp());
}

#[tokio::test]
async fn refresh_success_without_rotation_keeps_the_refresh_token() {
    let store = store(5).await;
    let record = store
        .create(input(Uuid::new_v4(), Duration::minutes(5)))
        .await
        .unwrap();

    store
        .record_refresh_success(&record, "atza|new", None, Utc::now() + Duration::hours(1))
        .await
        .unwrap();

    let updated = store.get(record.id).await.unwrap();
    assert_eq!(store.refresh_token(&updated).unwrap().as_str(), "atzr|refresh");
}

#[tokio::test]
async fn reconnecting_re_enables_a_disabled_record() {
    let store = store(1).await;
    let user_id = Uuid::new_v4();
    let record = store.create(input(user_id, Duration::minutes(5))).await.unwrap();
    store.mark_refresh_failure(record.id, "boom").await.unwrap();
    assert!(store.find_active_for_user(user_id).await.unwrap().is_none());

    let replaced = store
        .put(record.id, input(user_id, Duration::hours(1)))
        .await
        .unwrap();

    assert!(replaced.proactive_refresh_enabled);
    assert_eq!(replaced.consecutive_refresh_failures, 0);
    assert_eq!(
        store.find_active_for_user(user_id).await.unwrap().map(|r| r.id),
        Some(record.id)
    );
}

#[tokio::test]
async fn re_enable_clears_failure_state() {
    let store = store(1).await;
    let record = store
        .create(input(Uuid::new_v4(), Duration::minutes(5)))
        .await
        .unwrap();
    store.mark_refresh_failure(record.id, "boom").await.unwrap();

    store.re_enable(record.id).await.unwrap();

    let updated = store.get(record.id).await.unwrap();
    assert!(updated.proactive_refresh_enabled);
    assert_eq!(updated.consecutive_refresh_failures, 0);
    assert!(updated.last_error.is_none());
}

#[tokio::test]
async fn enabled_user_ids_are_distinct() {
    let store = store(5).await;
    let user_id = Uuid::new_v4();
    store.create(input(user_id, Duration::hours(1))).await.unwrap();
    store.create(input(user_id, Duration::hours(1))).await.unwrap();
    let other = store
        .create(input(Uuid::new_v4(), Duration::hours(1)))
        .await
        .unwrap();
    store.disable(other.id, "invalid_grant").await.unwrap();

    assert_eq!(store.list_enabled_user_ids().await.unwrap(), vec![user_id]);
}

#[tokio::test]
async fn deleted_records_are_gone() {
    let store = store(5).await;
    let record = store
        .create(input(Uuid::new_v4(), Duration::hours(1)))
        .await
        .unwrap();

    store.delete(record.id).await.unwrap();

    assert!(matches!(
        store.get(record.id).await,
        Err(AdsError::NotFound { .. })
    ));
    assert!(matches!(
        store.delete(record.id).await,
        Err(AdsError::NotFound { .. })
    ));
}
