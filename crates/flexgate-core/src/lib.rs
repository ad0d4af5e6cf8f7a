//! flexgate-core - Event notifications for the FlexGate API gateway.
//!
//! Gateway components emit typed operational events onto an in-process
//! [`EventBus`]. The [`WebhookManager`] turns matching events into signed
//! HTTP deliveries to registered endpoints, retried with exponential backoff
//! and logged to a [`NotificationStore`].
//!
//! # Example
//!
//! ```ignore
//! use flexgate_core::events::{CircuitBreakerEvent, EventPayload, EventType};
//! use flexgate_core::webhooks::NewWebhook;
//! use flexgate_core::{NotificationRuntime, NotifierConfig};
//!
//! let runtime = NotificationRuntime::new(NotifierConfig::from_env()).await?;
//! runtime
//!     .manager()
//!     .register_webhook(
//!         NewWebhook::new("https://ops.example.com/hooks")
//!             .with_events([EventType::CircuitBreakerOpened]),
//!     )
//!     .await?;
//!
//! runtime.bus().emit(EventPayload::CircuitBreakerOpened(
//!     CircuitBreakerEvent::new("circuit-breaker", "orders").with_failures(5, 5),
//! ));
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod runtime;
pub mod store;
pub mod webhooks;

// Re-export commonly used types
pub use config::NotifierConfig;
pub use error::{ErrorCode, FlexGateError, FlexGateResult};
pub use events::{Event, EventBus, EventPayload, EventType};
pub use runtime::NotificationRuntime;
pub use store::{MemoryStore, NotificationStore, SqliteStore};
pub use webhooks::{
    Delivery, DeliveryStats, DeliveryStatus, NewWebhook, RetryPolicy, WebhookConfig,
    WebhookManager, WebhookStats, WebhookUpdate,
};
