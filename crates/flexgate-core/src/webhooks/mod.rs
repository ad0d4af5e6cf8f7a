//! Webhook delivery for gateway events
//!
//! - Registration and validation of webhook endpoints
//! - Per-webhook delivery queues with exponential backoff retry
//! - HMAC-SHA256 payload signing

mod config;
mod delivery;
mod manager;
mod sender;
pub mod signature;

pub use config::{
    generate_secret, NewWebhook, RetryPolicy, WebhookConfig, WebhookUpdate, DEFAULT_TIMEOUT_MS,
};
pub use delivery::{
    truncate_body, Delivery, DeliveryStats, DeliveryStatus, DeliveryUpdate, SignedBody,
    TestDeliveryResult, MAX_RESPONSE_BODY_CHARS, TEST_EVENT,
};
pub use manager::{RegistryStats, WebhookManager, WebhookStats};
#[cfg(test)]
pub use sender::MockWebhookSender;
pub use sender::{
    HttpSender, WebhookRequest, WebhookResponse, WebhookSender, DELIVERY_HEADER, EVENT_HEADER,
    SIGNATURE_HEADER, STANDARD_HEADERS, USER_AGENT,
};
