//! Persistence for webhook registrations and delivery logs.
//!
//! The [`NotificationStore`] trait is the only contract the webhook manager
//! depends on. Every call may fail; the manager logs write failures and keeps
//! delivering.

mod memory;
mod sqlite;

use async_trait::async_trait;

use crate::error::FlexGateResult;
use crate::webhooks::{Delivery, DeliveryStats, DeliveryUpdate, WebhookConfig};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Trait for webhook and delivery storage operations
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a new delivery row
    async fn create_delivery(&self, delivery: &Delivery) -> FlexGateResult<()>;

    /// Apply a partial update to a delivery row
    async fn update_delivery(&self, id: &str, update: &DeliveryUpdate) -> FlexGateResult<()>;

    /// Deliveries for a webhook, newest first
    async fn find_by_webhook(
        &self,
        webhook_id: &str,
        limit: usize,
        offset: usize,
    ) -> FlexGateResult<Vec<Delivery>>;

    /// Aggregate delivery stats for a webhook
    async fn get_stats(&self, webhook_id: &str) -> FlexGateResult<DeliveryStats>;

    /// Delete deliveries created more than `days` days ago; returns rows removed
    async fn delete_older_than(&self, days: u32) -> FlexGateResult<usize>;

    /// Insert or replace a webhook registration
    async fn save_webhook(&self, webhook: &WebhookConfig) -> FlexGateResult<()>;

    /// Remove a webhook registration
    async fn delete_webhook(&self, id: &str) -> FlexGateResult<()>;

    /// All persisted webhook registrations
    async fn load_webhooks(&self) -> FlexGateResult<Vec<WebhookConfig>>;
}
