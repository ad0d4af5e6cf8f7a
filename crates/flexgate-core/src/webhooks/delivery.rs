//! Delivery records and the signed envelope sent to endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{AsRefStr, Display, EnumString, IntoStaticStr};

use crate::events::Event;
use crate::webhooks::signature;

/// Maximum number of characters of a response body kept on a delivery.
pub const MAX_RESPONSE_BODY_CHARS: usize = 1000;

/// Event name carried by synthetic test deliveries.
pub const TEST_EVENT: &str = "webhook.test";

/// Delivery state. Only `Pending -> Success` and `Pending -> Failed` occur.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One unit of work: send one event to one webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub webhook_id: String,
    /// Wire name of the event type
    pub event_type: String,
    /// Id of the triggering event
    pub event_id: String,
    /// Snapshot of the event data at the time it was observed
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    /// When the triggering event happened
    pub event_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Delivery {
    /// Create a pending delivery of `event` for a webhook.
    pub fn new(webhook_id: impl Into<String>, event: &Event) -> serde_json::Result<Self> {
        Ok(Self {
            id: format!("dlv_{}", uuid::Uuid::new_v4().simple()),
            webhook_id: webhook_id.into(),
            event_type: event.event_type.as_str().to_string(),
            event_id: event.id.clone(),
            payload: event.payload.data()?,
            status: DeliveryStatus::Pending,
            attempts: 0,
            response_code: None,
            response_body: None,
            error: None,
            delivered_at: None,
            event_timestamp: event.timestamp,
            created_at: Utc::now(),
        })
    }

    /// A synthetic delivery used to check an endpoint. Never persisted.
    pub fn test(webhook_id: impl Into<String>) -> Self {
        let webhook_id = webhook_id.into();
        let now = Utc::now();
        Self {
            id: format!("dlv_{}", uuid::Uuid::new_v4().simple()),
            event_type: TEST_EVENT.to_string(),
            event_id: format!("evt_{}", uuid::Uuid::new_v4().simple()),
            payload: serde_json::json!({
                "message": "Test delivery from FlexGate",
                "webhook_id": webhook_id,
            }),
            webhook_id,
            status: DeliveryStatus::Pending,
            attempts: 0,
            response_code: None,
            response_body: None,
            error: None,
            delivered_at: None,
            event_timestamp: now,
            created_at: now,
        }
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: &DeliveryUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(attempts) = update.attempts {
            self.attempts = attempts;
        }
        if let Some(code) = update.response_code {
            self.response_code = Some(code);
        }
        if let Some(ref body) = update.response_body {
            self.response_body = Some(body.clone());
        }
        if let Some(ref error) = update.error {
            self.error = Some(error.clone());
        }
        if let Some(at) = update.delivered_at {
            self.delivered_at = Some(at);
        }
    }

    /// Build the signed request body for this delivery.
    pub fn signed_body(&self, secret: &str) -> serde_json::Result<SignedBody> {
        let unsigned = serde_json::to_vec(&Envelope {
            id: &self.id,
            event: &self.event_type,
            timestamp: self.event_timestamp,
            data: &self.payload,
        })?;
        Ok(SignedBody::from_unsigned(&unsigned, secret))
    }
}

/// Partial update of a delivery row; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryUpdate {
    pub status: Option<DeliveryStatus>,
    pub attempts: Option<u32>,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl DeliveryUpdate {
    pub fn attempts(attempts: u32) -> Self {
        Self {
            attempts: Some(attempts),
            ..Default::default()
        }
    }

    pub fn success(response_code: u16, response_body: String) -> Self {
        Self {
            status: Some(DeliveryStatus::Success),
            response_code: Some(response_code),
            response_body: Some(truncate_body(&response_body)),
            delivered_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, response_code: Option<u16>) -> Self {
        Self {
            status: Some(DeliveryStatus::Failed),
            response_code,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Envelope without its signature; these exact bytes are signed.
#[derive(Serialize)]
struct Envelope<'a> {
    id: &'a str,
    event: &'a str,
    timestamp: DateTime<Utc>,
    data: &'a serde_json::Value,
}

/// A request body with its signature spliced in.
#[derive(Debug, Clone)]
pub struct SignedBody {
    pub body: Vec<u8>,
    pub signature: String,
}

impl SignedBody {
    pub(crate) fn from_unsigned(unsigned: &[u8], secret: &str) -> Self {
        let signature = signature::sign(unsigned, secret);
        Self {
            body: signature::attach_signature(unsigned, &signature),
            signature,
        }
    }
}

/// Truncate a response body to [`MAX_RESPONSE_BODY_CHARS`] characters.
pub fn truncate_body(body: &str) -> String {
    body.chars().take(MAX_RESPONSE_BODY_CHARS).collect()
}

/// Aggregated delivery statistics for one webhook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub total_deliveries: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    pub pending_deliveries: u64,
    pub average_attempts: f64,
    /// Latest activity: when a delivery succeeded, or when one was created
    /// if none has succeeded since
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub by_event_type: HashMap<String, u64>,
}

impl DeliveryStats {
    /// Fold a set of delivery rows into stats.
    pub fn from_deliveries<'a>(deliveries: impl IntoIterator<Item = &'a Delivery>) -> Self {
        let mut stats = Self::default();
        let mut attempts_sum: u64 = 0;

        for delivery in deliveries {
            stats.total_deliveries += 1;
            attempts_sum += u64::from(delivery.attempts);
            match delivery.status {
                DeliveryStatus::Success => stats.successful_deliveries += 1,
                DeliveryStatus::Failed => stats.failed_deliveries += 1,
                DeliveryStatus::Pending => stats.pending_deliveries += 1,
            }
            *stats
                .by_event_type
                .entry(delivery.event_type.clone())
                .or_insert(0) += 1;
            let at = delivery.delivered_at.unwrap_or(delivery.created_at);
            if stats.last_delivery_at.map_or(true, |t| at > t) {
                stats.last_delivery_at = Some(at);
            }
        }

        if stats.total_deliveries > 0 {
            stats.average_attempts = attempts_sum as f64 / stats.total_deliveries as f64;
        }
        stats
    }
}

/// Outcome of a synchronous test delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestDeliveryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventPayload, RateLimitEvent};

    fn sample_delivery() -> Delivery {
        let event = Event::new(EventPayload::RateLimitExceeded(RateLimitEvent::new(
            "rate-limiter",
            "client-a",
            100,
            150,
        )));
        Delivery::new("w1", &event).unwrap()
    }

    #[test]
    fn test_new_delivery_is_pending() {
        let delivery = sample_delivery();
        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.attempts, 0);
        assert_eq!(delivery.event_type, "rate_limit.exceeded");
        assert_eq!(delivery.payload["key"], "client-a");
    }

    #[test]
    fn test_signed_body_envelope() {
        let delivery = sample_delivery();
        let signed = delivery.signed_body("s").unwrap();

        let envelope: serde_json::Value = serde_json::from_slice(&signed.body).unwrap();
        assert_eq!(envelope["id"], delivery.id.as_str());
        assert_eq!(envelope["event"], "rate_limit.exceeded");
        assert_eq!(envelope["data"], delivery.payload);
        assert_eq!(envelope["signature"], signed.signature.as_str());
        assert!(envelope["timestamp"].is_string());
        assert!(signature::verify_envelope(&signed.body, "s"));
    }

    #[test]
    fn test_synthetic_test_delivery() {
        let delivery = Delivery::test("w1");
        assert_eq!(delivery.event_type, TEST_EVENT);
        assert_eq!(delivery.payload["webhook_id"], "w1");

        let signed = delivery.signed_body("s").unwrap();
        let envelope: serde_json::Value = serde_json::from_slice(&signed.body).unwrap();
        assert_eq!(envelope["event"], "webhook.test");
    }

    #[test]
    fn test_apply_update() {
        let mut delivery = sample_delivery();
        delivery.apply(&DeliveryUpdate::attempts(2));
        delivery.apply(&DeliveryUpdate::failed("HTTP 503", Some(503)));

        assert_eq!(delivery.attempts, 2);
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(delivery.response_code, Some(503));
        assert!(delivery.delivered_at.is_none());
    }

    #[test]
    fn test_success_update_truncates_body() {
        let update = DeliveryUpdate::success(200, "é".repeat(MAX_RESPONSE_BODY_CHARS + 10));
        assert_eq!(
            update.response_body.unwrap().chars().count(),
            MAX_RESPONSE_BODY_CHARS
        );
        assert!(update.delivered_at.is_some());
    }

    #[test]
    fn test_stats_aggregation() {
        let mut a = sample_delivery();
        a.apply(&DeliveryUpdate::attempts(1));
        a.apply(&DeliveryUpdate::success(200, "ok".into()));
        let mut b = sample_delivery();
        b.apply(&DeliveryUpdate::attempts(1));
        b.apply(&DeliveryUpdate::success(204, String::new()));
        let mut c = sample_delivery();
        c.apply(&DeliveryUpdate::attempts(4));
        c.apply(&DeliveryUpdate::failed("HTTP 500", Some(500)));

        let stats = DeliveryStats::from_deliveries([&a, &b, &c]);
        assert_eq!(stats.total_deliveries, 3);
        assert_eq!(stats.successful_deliveries, 2);
        assert_eq!(stats.failed_deliveries, 1);
        assert_eq!(stats.average_attempts, 2.0);
        assert_eq!(stats.by_event_type["rate_limit.exceeded"], 3);
        assert_eq!(stats.last_delivery_at, Some(c.created_at.max(b.delivered_at.unwrap())));
    }

    #[test]
    fn test_last_delivery_at_prefers_delivered_time() {
        let mut delivered = sample_delivery();
        delivered.created_at = Utc::now() - chrono::Duration::minutes(10);
        delivered.apply(&DeliveryUpdate::success(200, "ok".into()));
        let mut pending = sample_delivery();
        pending.created_at = Utc::now() - chrono::Duration::minutes(5);

        let stats = DeliveryStats::from_deliveries([&delivered, &pending]);
        assert_eq!(stats.last_delivery_at, delivered.delivered_at);

        let stats = DeliveryStats::from_deliveries([&pending]);
        assert_eq!(stats.last_delivery_at, Some(pending.created_at));
    }

    #[test]
    fn test_status_strings() {
        for status in [DeliveryStatus::Pending, DeliveryStatus::Success, DeliveryStatus::Failed] {
            assert_eq!(status.as_str().parse::<DeliveryStatus>().unwrap(), status);
            assert_eq!(status.to_string(), status.as_str());
        }
        assert_eq!(DeliveryStatus::Failed.as_str(), "failed");
        assert!("delivered".parse::<DeliveryStatus>().is_err());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
    }
}
