//! Wiring for the notification subsystem.
//!
//! Opens the store, builds the event bus and webhook manager, and runs the
//! delivery retention job in the background.

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::config::NotifierConfig;
use crate::error::{FlexGateError, FlexGateResult};
use crate::events::EventBus;
use crate::store::{MemoryStore, NotificationStore, SqliteStore};
use crate::webhooks::{HttpSender, WebhookManager, WebhookSender};

/// Event bus, webhook manager and retention job, built from one config.
///
/// # Example
///
/// ```ignore
/// use flexgate_core::{NotificationRuntime, NotifierConfig};
///
/// let mut runtime = NotificationRuntime::new(NotifierConfig::from_env()).await?;
/// runtime.start().await?;
///
/// // hand runtime.bus() to gateway components
///
/// runtime.shutdown().await?;
/// ```
pub struct NotificationRuntime {
    bus: EventBus,
    store: Arc<dyn NotificationStore>,
    manager: Arc<WebhookManager>,
    scheduler: Option<JobScheduler>,
    config: NotifierConfig,
}

impl NotificationRuntime {
    /// Build the runtime with the reqwest sender.
    pub async fn new(config: NotifierConfig) -> FlexGateResult<Self> {
        let sender = Arc::new(HttpSender::new()?);
        Self::with_sender(config, sender).await
    }

    /// Build the runtime with a custom sender.
    ///
    /// Persisted webhooks are restored before this returns. The retention job
    /// does not run until `start()`.
    pub async fn with_sender(
        config: NotifierConfig,
        sender: Arc<dyn WebhookSender>,
    ) -> FlexGateResult<Self> {
        debug!(
            history_capacity = config.history_capacity,
            production = config.production,
            retention_enabled = config.enable_retention,
            "Creating NotificationRuntime"
        );

        let store: Arc<dyn NotificationStore> = if config.is_in_memory() {
            debug!("Using in-memory notification store");
            Arc::new(MemoryStore::new())
        } else {
            debug!(path = %config.database_path.display(), "Using SQLite notification store");
            Arc::new(SqliteStore::new(&config.database_path)?)
        };

        let bus = EventBus::with_capacity(config.history_capacity);
        let manager = WebhookManager::new(&bus, store.clone(), sender, config.production)?;

        // Unreadable registrations leave the registry empty rather than
        // keeping the notifier down
        match manager.load_persisted().await {
            Ok(0) => {}
            Ok(restored) => info!(count = restored, "Restored persisted webhooks"),
            Err(e) => warn!(error = %e, "Failed to restore persisted webhooks, starting empty"),
        }

        Ok(Self {
            bus,
            store,
            manager,
            scheduler: None,
            config,
        })
    }

    /// Start the retention job, if enabled.
    pub async fn start(&mut self) -> FlexGateResult<()> {
        if !self.config.enable_retention {
            info!("Delivery retention disabled");
            return Ok(());
        }
        if self.scheduler.is_some() {
            return Ok(());
        }

        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| FlexGateError::internal(format!("Failed to create scheduler: {}", e)))?;

        let manager = self.manager.clone();
        let days = self.config.retention_days;
        let job = Job::new_repeated_async(self.config.retention_interval(), move |_uuid, _lock| {
            let manager = manager.clone();
            Box::pin(async move {
                debug!(days, "Starting delivery retention run");
                if let Err(e) = manager.purge_deliveries_older_than(days).await {
                    error!(error = %e, "Delivery retention run failed");
                }
            })
        })
        .map_err(|e| FlexGateError::internal(format!("Failed to create retention job: {}", e)))?;

        scheduler
            .add(job)
            .await
            .map_err(|e| FlexGateError::internal(format!("Failed to add retention job: {}", e)))?;
        scheduler
            .start()
            .await
            .map_err(|e| FlexGateError::internal(format!("Failed to start scheduler: {}", e)))?;

        info!(
            retention_days = days,
            interval_minutes = self.config.retention_interval_minutes.max(1),
            "Delivery retention scheduler started"
        );
        self.scheduler = Some(scheduler);
        Ok(())
    }

    /// Stop the retention job and detach the manager from the bus.
    pub async fn shutdown(&mut self) -> FlexGateResult<()> {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown().await.map_err(|e| {
                FlexGateError::internal(format!("Failed to shutdown scheduler: {}", e))
            })?;
            debug!("Retention scheduler stopped");
        }
        self.manager.shutdown();
        info!("Notification runtime stopped");
        Ok(())
    }

    /// Handle to the event bus; clone it into producers.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn manager(&self) -> &Arc<WebhookManager> {
        &self.manager
    }

    pub fn store(&self) -> Arc<dyn NotificationStore> {
        self.store.clone()
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.scheduler.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::NewWebhook;

    fn memory_config() -> NotifierConfig {
        NotifierConfig::builder().in_memory().build()
    }

    #[tokio::test]
    async fn test_runtime_wires_bus_and_manager() {
        let runtime = NotificationRuntime::new(memory_config()).await.unwrap();
        assert_eq!(runtime.bus().subscriber_count(), 1);
        assert_eq!(runtime.bus().capacity(), 1000);
        assert!(runtime.manager().get_all_webhooks().is_empty());
        assert!(!runtime.is_started());
    }

    #[tokio::test]
    async fn test_runtime_start_and_shutdown() {
        let mut runtime = NotificationRuntime::new(memory_config()).await.unwrap();
        runtime.start().await.unwrap();
        assert!(runtime.is_started());

        runtime.shutdown().await.unwrap();
        assert!(!runtime.is_started());
        assert_eq!(runtime.bus().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_runtime_retention_disabled() {
        let config = NotifierConfig::builder()
            .in_memory()
            .enable_retention(false)
            .build();
        let mut runtime = NotificationRuntime::new(config).await.unwrap();
        runtime.start().await.unwrap();
        assert!(!runtime.is_started());
    }

    #[tokio::test]
    async fn test_runtime_restores_webhooks_from_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let config = NotifierConfig::builder()
            .database_path(dir.path().join("notifications.db"))
            .build();

        {
            let mut runtime = NotificationRuntime::new(config.clone()).await.unwrap();
            runtime
                .manager()
                .register_webhook(
                    NewWebhook::new("https://example.com/hook")
                        .with_id("persisted")
                        .with_all_events(),
                )
                .await
                .unwrap();
            runtime.shutdown().await.unwrap();
        }

        let runtime = NotificationRuntime::new(config).await.unwrap();
        let webhook = runtime.manager().get_webhook("persisted").unwrap();
        assert_eq!(webhook.url, "https://example.com/hook");
    }

    #[tokio::test]
    async fn test_runtime_starts_when_webhooks_cannot_be_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notifications.db");
        {
            // A webhooks table from an incompatible schema
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE webhooks (id TEXT PRIMARY KEY);")
                .unwrap();
        }

        let config = NotifierConfig::builder().database_path(&path).build();
        let runtime = NotificationRuntime::new(config).await.unwrap();
        assert!(runtime.manager().get_all_webhooks().is_empty());
        assert_eq!(runtime.bus().subscriber_count(), 1);
    }
}
