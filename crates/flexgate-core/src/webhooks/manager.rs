//! Webhook registry, per-webhook delivery queues, and the retry loop.
//!
//! The manager subscribes to every event on the bus. For each event it builds
//! one [`Delivery`] per matching webhook and pushes it onto that webhook's
//! queue. Each webhook has its own worker task, so a slow endpoint only delays
//! its own deliveries.

use backon::Retryable;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ErrorCode, FlexGateError, FlexGateResult};
use crate::events::{Event, EventBus, EventSelector, SubscriptionId};
use crate::store::{MemoryStore, NotificationStore};
use crate::webhooks::{
    truncate_body, Delivery, DeliveryStats, DeliveryUpdate, HttpSender, NewWebhook,
    TestDeliveryResult, WebhookConfig, WebhookRequest, WebhookResponse, WebhookSender,
    WebhookUpdate,
};

/// Registry-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total_webhooks: usize,
    pub enabled_webhooks: usize,
    pub disabled_webhooks: usize,
    /// Deliveries waiting in queues, not counting ones being attempted
    pub queue_depth: usize,
    pub active_workers: usize,
}

/// Result of [`WebhookManager::get_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WebhookStats {
    /// Delivery stats for one webhook
    Webhook(DeliveryStats),
    /// Registry counters when no webhook is named
    Registry(RegistryStats),
}

impl WebhookStats {
    pub fn webhook(&self) -> Option<&DeliveryStats> {
        match self {
            Self::Webhook(stats) => Some(stats),
            Self::Registry(_) => None,
        }
    }

    pub fn registry(&self) -> Option<&RegistryStats> {
        match self {
            Self::Registry(stats) => Some(stats),
            Self::Webhook(_) => None,
        }
    }
}

/// A registry entry. The generation changes whenever the id is registered
/// again, so deliveries queued for an earlier registration can be told apart.
struct Registration {
    config: WebhookConfig,
    generation: u64,
}

/// A delivery waiting in a webhook queue.
struct QueuedDelivery {
    delivery: Delivery,
    /// Registration the delivery was queued for
    generation: u64,
    /// Insert of the initial row; resolves to whether it was stored
    persisted: JoinHandle<bool>,
}

/// Why a delivery attempt did not succeed.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("webhook registration is gone")]
    Unregistered,
    #[error("{error}")]
    Failed {
        error: String,
        response_code: Option<u16>,
    },
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// State shared between the manager and its workers.
struct Shared {
    webhooks: RwLock<HashMap<String, Registration>>,
    store: Arc<dyn NotificationStore>,
    sender: Arc<dyn WebhookSender>,
    queue_depth: AtomicUsize,
    next_generation: AtomicU64,
}

impl Shared {
    fn registry(&self) -> RwLockReadGuard<'_, HashMap<String, Registration>> {
        self.webhooks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Registration>> {
        self.webhooks.write().unwrap_or_else(|e| e.into_inner())
    }

    fn webhook(&self, id: &str) -> Option<WebhookConfig> {
        self.registry().get(id).map(|r| r.config.clone())
    }

    /// Current config of `id`, only while it is still the given registration.
    fn live(&self, id: &str, generation: u64) -> Option<WebhookConfig> {
        self.registry()
            .get(id)
            .filter(|r| r.generation == generation)
            .map(|r| r.config.clone())
    }

    fn registration(&self, config: WebhookConfig) -> Registration {
        Registration {
            config,
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
        }
    }

    async fn record(&self, delivery_id: &str, update: DeliveryUpdate) {
        if let Err(e) = self.store.update_delivery(delivery_id, &update).await {
            tracing::warn!(delivery_id, error = %e, "Failed to persist delivery update");
        }
    }

    /// One HTTP attempt with the webhook's current url, secret and headers.
    async fn attempt(
        &self,
        webhook: &WebhookConfig,
        delivery: &Delivery,
    ) -> FlexGateResult<WebhookResponse> {
        let signed = delivery.signed_body(&webhook.secret)?;
        let request = WebhookRequest::new(
            webhook.url.clone(),
            &delivery.event_type,
            &delivery.id,
            &signed.signature,
            &webhook.headers,
            signed.body,
            webhook.timeout(),
        );
        self.sender.send(request).await
    }

    /// Retry one delivery until it succeeds, runs out of attempts, or its
    /// registration goes away.
    async fn deliver(&self, queued: QueuedDelivery) {
        let QueuedDelivery {
            delivery,
            generation,
            persisted,
        } = queued;

        let stored = match persisted.await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(delivery_id = %delivery.id, error = %e, "Initial delivery insert did not complete");
                false
            }
        };

        // Policy is fixed for the lifetime of a delivery
        let Some(policy) = self
            .live(&delivery.webhook_id, generation)
            .map(|webhook| webhook.retry_policy)
        else {
            tracing::warn!(
                webhook_id = %delivery.webhook_id,
                delivery_id = %delivery.id,
                "Webhook no longer registered, dropping delivery"
            );
            return;
        };

        let attempts = AtomicU32::new(0);
        let deliver_once = || async {
            let webhook = self
                .live(&delivery.webhook_id, generation)
                .ok_or(AttemptError::Unregistered)?;

            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if stored {
                self.record(&delivery.id, DeliveryUpdate::attempts(attempt))
                    .await;
            }

            match self.attempt(&webhook, &delivery).await {
                Ok(response) if response.is_success() => Ok(response),
                Ok(response) => Err(AttemptError::Failed {
                    error: format!("HTTP {}", response.status),
                    response_code: Some(response.status),
                }),
                Err(e) => Err(AttemptError::Failed {
                    error: e.to_string(),
                    response_code: None,
                }),
            }
        };

        let outcome = deliver_once
            .retry(policy.backoff())
            .when(AttemptError::is_retryable)
            .notify(|err, delay| {
                tracing::debug!(
                    webhook_id = %delivery.webhook_id,
                    delivery_id = %delivery.id,
                    attempts = attempts.load(Ordering::SeqCst),
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Webhook delivery attempt failed, retrying"
                );
            })
            .await;
        let attempts = attempts.load(Ordering::SeqCst);

        match outcome {
            Ok(response) => {
                tracing::info!(
                    webhook_id = %delivery.webhook_id,
                    delivery_id = %delivery.id,
                    event_type = %delivery.event_type,
                    status = response.status,
                    attempts,
                    "Webhook delivered"
                );
                if stored {
                    self.record(
                        &delivery.id,
                        DeliveryUpdate::success(response.status, response.body),
                    )
                    .await;
                }
            }
            Err(AttemptError::Unregistered) => {
                tracing::warn!(
                    webhook_id = %delivery.webhook_id,
                    delivery_id = %delivery.id,
                    attempts,
                    "Webhook no longer registered, dropping delivery"
                );
            }
            Err(AttemptError::Failed {
                error,
                response_code,
            }) => {
                tracing::warn!(
                    webhook_id = %delivery.webhook_id,
                    delivery_id = %delivery.id,
                    event_type = %delivery.event_type,
                    attempts,
                    error = %error,
                    "Webhook delivery failed, retries exhausted"
                );
                if stored {
                    self.record(&delivery.id, DeliveryUpdate::failed(error, response_code))
                        .await;
                }
            }
        }
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    webhook_id: String,
    mut rx: mpsc::UnboundedReceiver<QueuedDelivery>,
) {
    tracing::debug!(webhook_id = %webhook_id, "Delivery worker started");
    while let Some(queued) = rx.recv().await {
        shared.queue_depth.fetch_sub(1, Ordering::SeqCst);
        shared.deliver(queued).await;
    }
    tracing::debug!(webhook_id = %webhook_id, "Delivery worker stopped");
}

/// Manages webhook registrations and delivers bus events to them
pub struct WebhookManager {
    shared: Arc<Shared>,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<QueuedDelivery>>>,
    bus: EventBus,
    subscription: Mutex<Option<SubscriptionId>>,
    runtime: Handle,
    production: bool,
}

impl WebhookManager {
    /// Create a manager and subscribe it to every event on `bus`.
    ///
    /// Must be called from inside a tokio runtime; workers are spawned on it.
    pub fn new(
        bus: &EventBus,
        store: Arc<dyn NotificationStore>,
        sender: Arc<dyn WebhookSender>,
        production: bool,
    ) -> FlexGateResult<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|_| {
            FlexGateError::Configuration(
                "WebhookManager must be created inside a tokio runtime".to_string(),
            )
        })?;

        let manager = Arc::new(Self {
            shared: Arc::new(Shared {
                webhooks: RwLock::new(HashMap::new()),
                store,
                sender,
                queue_depth: AtomicUsize::new(0),
                next_generation: AtomicU64::new(0),
            }),
            queues: Mutex::new(HashMap::new()),
            bus: bus.clone(),
            subscription: Mutex::new(None),
            runtime,
            production,
        });

        let weak = Arc::downgrade(&manager);
        let id = bus.subscribe(EventSelector::All, move |event: &Event| {
            if let Some(manager) = weak.upgrade() {
                manager.dispatch(event);
            }
            Ok(())
        });
        *manager.subscription_guard() = Some(id);

        Ok(manager)
    }

    /// Manager with an in-memory store and the reqwest sender
    pub fn in_memory(bus: &EventBus, production: bool) -> FlexGateResult<Arc<Self>> {
        Self::new(
            bus,
            Arc::new(MemoryStore::new()),
            Arc::new(HttpSender::new()?),
            production,
        )
    }

    fn subscription_guard(&self) -> MutexGuard<'_, Option<SubscriptionId>> {
        self.subscription.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<QueuedDelivery>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bus handler: fan an event out to matching webhooks. Never blocks on I/O.
    fn dispatch(&self, event: &Event) {
        let targets: Vec<(String, u64)> = self
            .shared
            .registry()
            .values()
            .filter(|r| r.config.should_receive(event.event_type))
            .map(|r| (r.config.id.clone(), r.generation))
            .collect();

        for (webhook_id, generation) in targets {
            let delivery = match Delivery::new(&webhook_id, event) {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::error!(webhook_id = %webhook_id, event_id = %event.id, error = %e, "Failed to build delivery");
                    continue;
                }
            };

            let store = Arc::clone(&self.shared.store);
            let row = delivery.clone();
            let persisted = self.runtime.spawn(async move {
                match store.create_delivery(&row).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(delivery_id = %row.id, webhook_id = %row.webhook_id, error = %e, "Failed to persist delivery");
                        false
                    }
                }
            });

            tracing::debug!(
                webhook_id = %webhook_id,
                delivery_id = %delivery.id,
                event_type = %event.event_type,
                "Queued webhook delivery"
            );
            self.enqueue(
                &webhook_id,
                QueuedDelivery {
                    delivery,
                    generation,
                    persisted,
                },
            );
        }
    }

    fn enqueue(&self, webhook_id: &str, queued: QueuedDelivery) {
        let mut queues = self.queues();
        let tx = queues
            .entry(webhook_id.to_string())
            .or_insert_with(|| self.spawn_worker(webhook_id));

        self.shared.queue_depth.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(queued)) = tx.send(queued) {
            // Worker is gone; start a fresh one
            let fresh = self.spawn_worker(webhook_id);
            if fresh.send(queued).is_err() {
                self.shared.queue_depth.fetch_sub(1, Ordering::SeqCst);
                tracing::error!(webhook_id, "Failed to queue webhook delivery");
            }
            queues.insert(webhook_id.to_string(), fresh);
        }
    }

    fn spawn_worker(&self, webhook_id: &str) -> mpsc::UnboundedSender<QueuedDelivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.runtime
            .spawn(run_worker(Arc::clone(&self.shared), webhook_id.to_string(), rx));
        tx
    }

    /// Register a new webhook.
    pub async fn register_webhook(&self, input: NewWebhook) -> FlexGateResult<WebhookConfig> {
        let config = input.into_config(self.production)?;

        {
            let mut registry = self.shared.registry_mut();
            if registry.contains_key(&config.id) {
                return Err(FlexGateError::invalid_field(
                    ErrorCode::ValDuplicateId,
                    "id",
                    format!("Webhook with id '{}' already exists", config.id),
                ));
            }
            registry.insert(config.id.clone(), self.shared.registration(config.clone()));
        }

        self.persist_webhook(&config).await;
        tracing::info!(
            webhook_id = %config.id,
            url = %config.url,
            events = config.events.len(),
            "Webhook registered"
        );
        Ok(config)
    }

    /// Merge changes into an existing webhook.
    pub async fn update_webhook(
        &self,
        id: &str,
        update: WebhookUpdate,
    ) -> FlexGateResult<WebhookConfig> {
        let config = {
            let mut registry = self.shared.registry_mut();
            let current = registry
                .get_mut(id)
                .ok_or_else(|| FlexGateError::webhook_not_found(id))?;
            current.config = update.apply(&current.config, self.production)?;
            current.config.clone()
        };

        self.persist_webhook(&config).await;
        tracing::info!(webhook_id = %id, "Webhook updated");
        Ok(config)
    }

    /// Remove a webhook. Queued and in-flight deliveries for it are dropped,
    /// even if the id is registered again before they run.
    ///
    /// Returns false if no webhook had this id.
    pub async fn unregister_webhook(&self, id: &str) -> bool {
        if self.shared.registry_mut().remove(id).is_none() {
            return false;
        }
        // The worker drains what is left and exits once its sender is gone
        self.queues().remove(id);

        if let Err(e) = self.shared.store.delete_webhook(id).await {
            tracing::warn!(webhook_id = %id, error = %e, "Failed to delete persisted webhook");
        }
        tracing::info!(webhook_id = %id, "Webhook unregistered");
        true
    }

    pub fn get_webhook(&self, id: &str) -> Option<WebhookConfig> {
        self.shared.webhook(id)
    }

    /// All registered webhooks, oldest first.
    pub fn get_all_webhooks(&self) -> Vec<WebhookConfig> {
        let mut webhooks: Vec<WebhookConfig> = self
            .shared
            .registry()
            .values()
            .map(|r| r.config.clone())
            .collect();
        webhooks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        webhooks
    }

    /// Delivery stats for one webhook, or registry counters when `id` is `None`.
    pub async fn get_stats(&self, id: Option<&str>) -> FlexGateResult<WebhookStats> {
        match id {
            Some(id) => {
                if self.get_webhook(id).is_none() {
                    return Err(FlexGateError::webhook_not_found(id));
                }
                let stats = self.shared.store.get_stats(id).await?;
                Ok(WebhookStats::Webhook(stats))
            }
            None => Ok(WebhookStats::Registry(self.registry_stats())),
        }
    }

    fn registry_stats(&self) -> RegistryStats {
        let (total_webhooks, enabled_webhooks) = {
            let registry = self.shared.registry();
            (registry.len(), registry.values().filter(|r| r.config.enabled).count())
        };
        RegistryStats {
            total_webhooks,
            enabled_webhooks,
            disabled_webhooks: total_webhooks - enabled_webhooks,
            queue_depth: self.shared.queue_depth.load(Ordering::SeqCst),
            active_workers: self.queues().len(),
        }
    }

    /// Delivery history for a webhook, newest first.
    pub async fn get_delivery_logs(
        &self,
        webhook_id: &str,
        limit: usize,
        offset: usize,
    ) -> FlexGateResult<Vec<Delivery>> {
        self.shared
            .store
            .find_by_webhook(webhook_id, limit, offset)
            .await
    }

    /// Send one synthetic `webhook.test` delivery right away.
    ///
    /// Bypasses the queue and retry policy and is not persisted.
    pub async fn test_webhook(&self, id: &str) -> FlexGateResult<TestDeliveryResult> {
        let webhook = self
            .get_webhook(id)
            .ok_or_else(|| FlexGateError::webhook_not_found(id))?;
        let delivery = Delivery::test(&webhook.id);

        let started = Instant::now();
        let outcome = self.shared.attempt(&webhook, &delivery).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(response) => TestDeliveryResult {
                success: response.is_success(),
                status_code: Some(response.status),
                error: (!response.is_success()).then(|| format!("HTTP {}", response.status)),
                response_body: Some(truncate_body(&response.body)),
                duration_ms,
            },
            Err(e) => TestDeliveryResult {
                success: false,
                status_code: None,
                response_body: None,
                error: Some(e.to_string()),
                duration_ms,
            },
        };

        tracing::info!(
            webhook_id = %id,
            success = result.success,
            duration_ms,
            "Test webhook sent"
        );
        Ok(result)
    }

    /// Delete delivery rows older than `days` days.
    pub async fn purge_deliveries_older_than(&self, days: u32) -> FlexGateResult<usize> {
        let deleted = self.shared.store.delete_older_than(days).await?;
        if deleted > 0 {
            tracing::info!(deleted, days, "Purged old webhook deliveries");
        }
        Ok(deleted)
    }

    /// Restore registrations saved by a previous process.
    ///
    /// Persisted webhooks replace in-memory entries with the same id.
    pub async fn load_persisted(&self) -> FlexGateResult<usize> {
        let webhooks = self.shared.store.load_webhooks().await?;
        let count = webhooks.len();
        {
            let mut registry = self.shared.registry_mut();
            for webhook in webhooks {
                registry.insert(webhook.id.clone(), self.shared.registration(webhook));
            }
        }
        tracing::info!(count, "Loaded persisted webhooks");
        Ok(count)
    }

    async fn persist_webhook(&self, config: &WebhookConfig) {
        if let Err(e) = self.shared.store.save_webhook(config).await {
            tracing::warn!(webhook_id = %config.id, error = %e, "Failed to persist webhook");
        }
    }

    /// Stop observing the bus. Queued deliveries still run to completion.
    pub fn shutdown(&self) {
        if let Some(id) = self.subscription_guard().take() {
            self.bus.unsubscribe(id);
        }
        self.queues().clear();
        tracing::debug!("Webhook manager detached from event bus");
    }
}

impl Drop for WebhookManager {
    fn drop(&mut self) {
        if let Some(id) = self.subscription_guard().take() {
            self.bus.unsubscribe(id);
        }
    }
}
