//! Shared helpers for flexgate-core integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use flexgate_core::events::{CircuitBreakerEvent, EventBus, EventPayload, RateLimitEvent};
use flexgate_core::store::{MemoryStore, NotificationStore};
use flexgate_core::webhooks::{
    Delivery, DeliveryStats, DeliveryUpdate, HttpSender, RetryPolicy, WebhookConfig,
    WebhookManager,
};
use flexgate_core::{FlexGateError, FlexGateResult};
use wiremock::MockServer;

/// Bus, store and manager backed by the real HTTP sender.
pub struct Harness {
    pub bus: EventBus,
    pub store: Arc<dyn NotificationStore>,
    pub manager: Arc<WebhookManager>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn NotificationStore>) -> Self {
        let bus = EventBus::new();
        let sender = Arc::new(HttpSender::new().unwrap());
        let manager = WebhookManager::new(&bus, store.clone(), sender, false).unwrap();
        Self {
            bus,
            store,
            manager,
        }
    }

    /// Poll until `expected` deliveries exist for the webhook and all are terminal.
    pub async fn settled(&self, webhook_id: &str, expected: usize) -> Vec<Delivery> {
        for _ in 0..250 {
            let logs = self.store.find_by_webhook(webhook_id, 100, 0).await.unwrap();
            if logs.len() == expected && logs.iter().all(|d| d.status.is_terminal()) {
                return logs;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("deliveries for {} never settled", webhook_id);
    }
}

/// Poll until the mock server has seen at least `count` requests.
pub async fn wait_for_requests(server: &MockServer, count: usize) -> Vec<wiremock::Request> {
    for _ in 0..250 {
        let requests = server.received_requests().await.unwrap_or_default();
        if requests.len() >= count {
            return requests;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("mock server never received {} requests", count);
}

pub fn hook_url(server: &MockServer) -> String {
    format!("{}/hook", server.uri())
}

pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff_multiplier: 2.0,
        initial_delay_ms: 10,
    }
}

pub fn breaker_opened() -> EventPayload {
    EventPayload::CircuitBreakerOpened(
        CircuitBreakerEvent::new("circuit-breaker", "orders")
            .with_failures(5, 5)
            .with_reason("too many upstream errors"),
    )
}

pub fn rate_limited() -> EventPayload {
    EventPayload::RateLimitExceeded(
        RateLimitEvent::new("rate-limiter", "client-a", 100, 101).with_route("/api/orders"),
    )
}

/// Store whose every operation fails.
pub struct FailingStore;

impl FailingStore {
    fn fail<T>() -> FlexGateResult<T> {
        Err(FlexGateError::persistence("database is unavailable"))
    }
}

#[async_trait]
impl NotificationStore for FailingStore {
    async fn create_delivery(&self, _delivery: &Delivery) -> FlexGateResult<()> {
        Self::fail()
    }

    async fn update_delivery(&self, _id: &str, _update: &DeliveryUpdate) -> FlexGateResult<()> {
        Self::fail()
    }

    async fn find_by_webhook(
        &self,
        _webhook_id: &str,
        _limit: usize,
        _offset: usize,
    ) -> FlexGateResult<Vec<Delivery>> {
        Self::fail()
    }

    async fn get_stats(&self, _webhook_id: &str) -> FlexGateResult<DeliveryStats> {
        Self::fail()
    }

    async fn delete_older_than(&self, _days: u32) -> FlexGateResult<usize> {
        Self::fail()
    }

    async fn save_webhook(&self, _webhook: &WebhookConfig) -> FlexGateResult<()> {
        Self::fail()
    }

    async fn delete_webhook(&self, _id: &str) -> FlexGateResult<()> {
        Self::fail()
    }

    async fn load_webhooks(&self) -> FlexGateResult<Vec<WebhookConfig>> {
        Self::fail()
    }
}
