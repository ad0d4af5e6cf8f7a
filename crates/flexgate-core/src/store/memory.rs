//! In-process store used when no database is configured.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{FlexGateError, FlexGateResult};
use crate::store::NotificationStore;
use crate::webhooks::{Delivery, DeliveryStats, DeliveryUpdate, WebhookConfig};

/// Volatile store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    webhooks: Mutex<HashMap<String, WebhookConfig>>,
    deliveries: Mutex<Vec<Delivery>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock<T>(mutex: &Mutex<T>) -> FlexGateResult<MutexGuard<'_, T>> {
        mutex
            .lock()
            .map_err(|e| FlexGateError::persistence(format!("Failed to acquire lock: {}", e)))
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn create_delivery(&self, delivery: &Delivery) -> FlexGateResult<()> {
        Self::lock(&self.deliveries)?.push(delivery.clone());
        Ok(())
    }

    async fn update_delivery(&self, id: &str, update: &DeliveryUpdate) -> FlexGateResult<()> {
        let mut deliveries = Self::lock(&self.deliveries)?;
        let delivery = deliveries
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| FlexGateError::persistence(format!("Delivery '{}' not found", id)))?;
        delivery.apply(update);
        Ok(())
    }

    async fn find_by_webhook(
        &self,
        webhook_id: &str,
        limit: usize,
        offset: usize,
    ) -> FlexGateResult<Vec<Delivery>> {
        let deliveries = Self::lock(&self.deliveries)?;
        // Inserts can land out of order; newest by creation time, ties by
        // insertion
        let mut matching: Vec<&Delivery> = deliveries
            .iter()
            .rev()
            .filter(|d| d.webhook_id == webhook_id)
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_stats(&self, webhook_id: &str) -> FlexGateResult<DeliveryStats> {
        let deliveries = Self::lock(&self.deliveries)?;
        Ok(DeliveryStats::from_deliveries(
            deliveries.iter().filter(|d| d.webhook_id == webhook_id),
        ))
    }

    async fn delete_older_than(&self, days: u32) -> FlexGateResult<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let mut deliveries = Self::lock(&self.deliveries)?;
        let before = deliveries.len();
        deliveries.retain(|d| d.created_at >= cutoff);
        Ok(before - deliveries.len())
    }

    async fn save_webhook(&self, webhook: &WebhookConfig) -> FlexGateResult<()> {
        Self::lock(&self.webhooks)?.insert(webhook.id.clone(), webhook.clone());
        Ok(())
    }

    async fn delete_webhook(&self, id: &str) -> FlexGateResult<()> {
        Self::lock(&self.webhooks)?.remove(id);
        Ok(())
    }

    async fn load_webhooks(&self) -> FlexGateResult<Vec<WebhookConfig>> {
        let mut webhooks: Vec<WebhookConfig> = Self::lock(&self.webhooks)?.values().cloned().collect();
        webhooks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(webhooks)
    }
}
