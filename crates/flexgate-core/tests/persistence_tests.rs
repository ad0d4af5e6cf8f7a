//! Store failures and the SQLite-backed store seen through the manager.

mod common;

use common::*;
use std::sync::Arc;

use flexgate_core::store::SqliteStore;
use flexgate_core::webhooks::{DeliveryStatus, NewWebhook};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_store_failures_do_not_stop_delivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let harness = Harness::with_store(Arc::new(FailingStore));
    let webhook = harness
        .manager
        .register_webhook(NewWebhook::new(hook_url(&server)).with_id("w1").with_all_events())
        .await
        .unwrap();
    assert_eq!(webhook.id, "w1");

    harness.bus.emit(breaker_opened());
    let requests = wait_for_requests(&server, 1).await;
    assert_eq!(requests.len(), 1);

    // Caller-requested reads surface the failure
    let err = harness.manager.get_stats(Some("w1")).await.unwrap_err();
    assert!(err.is_persistence());
    let err = harness.manager.get_delivery_logs("w1", 10, 0).await.unwrap_err();
    assert!(err.is_persistence());
    assert!(harness.manager.purge_deliveries_older_than(30).await.is_err());

    // Registry stays usable
    assert!(harness.manager.unregister_webhook("w1").await);
}

#[tokio::test]
async fn test_sqlite_store_records_deliveries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::new(dir.path().join("notifications.db")).unwrap());
    let harness = Harness::with_store(store);
    harness
        .manager
        .register_webhook(NewWebhook::new(hook_url(&server)).with_id("w1").with_all_events())
        .await
        .unwrap();

    harness.bus.emit(breaker_opened());
    harness.bus.emit(rate_limited());

    let logs = harness.settled("w1", 2).await;
    assert!(logs.iter().all(|d| d.status == DeliveryStatus::Success));
    assert!(logs.iter().all(|d| d.response_body.as_deref() == Some("ok")));

    let stats = harness.manager.get_stats(Some("w1")).await.unwrap();
    assert_eq!(stats.webhook().unwrap().successful_deliveries, 2);

    let page = harness.manager.get_delivery_logs("w1", 1, 1).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].event_type, "circuit_breaker.opened");

    assert_eq!(harness.manager.purge_deliveries_older_than(30).await.unwrap(), 0);
}

#[tokio::test]
async fn test_sqlite_registrations_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notifications.db");

    let secret = {
        let harness = Harness::with_store(Arc::new(SqliteStore::new(&path).unwrap()));
        let webhook = harness
            .manager
            .register_webhook(
                NewWebhook::new("https://example.com/hook")
                    .with_id("kept")
                    .with_all_events()
                    .with_header("Authorization", "Bearer abc"),
            )
            .await
            .unwrap();
        harness
            .manager
            .register_webhook(
                NewWebhook::new("https://example.com/other")
                    .with_id("removed")
                    .with_all_events(),
            )
            .await
            .unwrap();
        assert!(harness.manager.unregister_webhook("removed").await);
        webhook.secret
    };

    let harness = Harness::with_store(Arc::new(SqliteStore::new(&path).unwrap()));
    assert_eq!(harness.manager.load_persisted().await.unwrap(), 1);

    let restored = harness.manager.get_webhook("kept").unwrap();
    assert_eq!(restored.secret, secret);
    assert_eq!(restored.headers["Authorization"], "Bearer abc");
    assert!(harness.manager.get_webhook("removed").is_none());
}
