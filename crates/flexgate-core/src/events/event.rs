//! Operational events emitted by gateway components.
//!
//! Each event type has its own statically defined payload. Producers build a
//! payload and hand it to the [`EventBus`](super::EventBus); the bus stamps
//! the id and timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

/// Closed set of event types the gateway can emit.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
    IntoStaticStr,
)]
pub enum EventType {
    #[serde(rename = "circuit_breaker.opened")]
    #[strum(serialize = "circuit_breaker.opened")]
    CircuitBreakerOpened,
    #[serde(rename = "circuit_breaker.closed")]
    #[strum(serialize = "circuit_breaker.closed")]
    CircuitBreakerClosed,
    #[serde(rename = "circuit_breaker.half_open")]
    #[strum(serialize = "circuit_breaker.half_open")]
    CircuitBreakerHalfOpen,
    #[serde(rename = "rate_limit.exceeded")]
    #[strum(serialize = "rate_limit.exceeded")]
    RateLimitExceeded,
    #[serde(rename = "rate_limit.approaching")]
    #[strum(serialize = "rate_limit.approaching")]
    RateLimitApproaching,
    #[serde(rename = "rate_limit.recovered")]
    #[strum(serialize = "rate_limit.recovered")]
    RateLimitRecovered,
    #[serde(rename = "proxy.request_started")]
    #[strum(serialize = "proxy.request_started")]
    ProxyRequestStarted,
    #[serde(rename = "proxy.request_completed")]
    #[strum(serialize = "proxy.request_completed")]
    ProxyRequestCompleted,
    #[serde(rename = "proxy.request_failed")]
    #[strum(serialize = "proxy.request_failed")]
    ProxyRequestFailed,
    #[serde(rename = "health.check_failed")]
    #[strum(serialize = "health.check_failed")]
    HealthCheckFailed,
    #[serde(rename = "health.check_recovered")]
    #[strum(serialize = "health.check_recovered")]
    HealthCheckRecovered,
    #[serde(rename = "config.changed")]
    #[strum(serialize = "config.changed")]
    ConfigChanged,
}

impl EventType {
    /// Wire name of the event type, e.g. `rate_limit.exceeded`.
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Wire form of the wildcard selector.
pub const WILDCARD: &str = "*";

/// Selects which events a subscriber or webhook receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSelector {
    /// Every event type.
    All,
    /// A single event type.
    Type(EventType),
}

impl EventSelector {
    /// Check whether an event of the given type is selected.
    pub fn matches(&self, event_type: EventType) -> bool {
        match self {
            Self::All => true,
            Self::Type(t) => *t == event_type,
        }
    }
}

impl From<EventType> for EventSelector {
    fn from(event_type: EventType) -> Self {
        Self::Type(event_type)
    }
}

impl fmt::Display for EventSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str(WILDCARD),
            Self::Type(t) => f.write_str(t.as_str()),
        }
    }
}

impl FromStr for EventSelector {
    type Err = strum::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == WILDCARD {
            return Ok(Self::All);
        }
        EventType::from_str(s).map(Self::Type)
    }
}

impl Serialize for EventSelector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|_| serde::de::Error::custom(format!("unknown event type '{}'", raw)))
    }
}

/// Fields every payload carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Component that produced the event (e.g. "circuit-breaker").
    pub source: String,
    /// When the event happened; stamped at emission if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EventMeta {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            timestamp: None,
        }
    }
}

/// Circuit breaker state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Upstream the breaker guards.
    pub upstream: String,
    /// Consecutive failures observed.
    pub failure_count: u32,
    /// Threshold configured for the breaker.
    pub failure_threshold: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CircuitBreakerEvent {
    pub fn new(source: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            meta: EventMeta::new(source),
            upstream: upstream.into(),
            failure_count: 0,
            failure_threshold: 0,
            reason: None,
        }
    }

    pub fn with_failures(mut self, failure_count: u32, failure_threshold: u32) -> Self {
        self.failure_count = failure_count;
        self.failure_threshold = failure_threshold;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Rate limiter observation for a client key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Limiter key (client id, API key, IP...).
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    /// Allowed requests per window.
    pub limit: u64,
    /// Requests counted in the current window.
    pub current: u64,
    pub window_ms: u64,
}

impl RateLimitEvent {
    pub fn new(source: impl Into<String>, key: impl Into<String>, limit: u64, current: u64) -> Self {
        Self {
            meta: EventMeta::new(source),
            key: key.into(),
            route: None,
            limit,
            current,
            window_ms: 60_000,
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_window_ms(mut self, window_ms: u64) -> Self {
        self.window_ms = window_ms;
        self
    }
}

/// Proxied request lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequestEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProxyRequestEvent {
    pub fn new(
        source: impl Into<String>,
        request_id: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            meta: EventMeta::new(source),
            request_id: request_id.into(),
            method: method.into(),
            path: path.into(),
            upstream: None,
            status_code: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_upstream(mut self, upstream: impl Into<String>) -> Self {
        self.upstream = Some(upstream.into());
        self
    }

    pub fn with_outcome(mut self, status_code: u16, duration_ms: u64) -> Self {
        self.status_code = Some(status_code);
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Upstream health probe result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub upstream: String,
    /// Probed URL.
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthCheckEvent {
    pub fn new(
        source: impl Into<String>,
        upstream: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            meta: EventMeta::new(source),
            upstream: upstream.into(),
            target: target.into(),
            status_code: None,
            consecutive_failures: 0,
            error: None,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_failure(mut self, consecutive_failures: u32, error: impl Into<String>) -> Self {
        self.consecutive_failures = consecutive_failures;
        self.error = Some(error.into());
        self
    }
}

/// Gateway configuration reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigChangedEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Top-level keys that differ from the previous configuration.
    #[serde(default)]
    pub changed_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ConfigChangedEvent {
    pub fn new(source: impl Into<String>, changed_keys: Vec<String>) -> Self {
        Self {
            meta: EventMeta::new(source),
            changed_keys,
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Event payload, tagged by event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    #[serde(rename = "circuit_breaker.opened")]
    CircuitBreakerOpened(CircuitBreakerEvent),
    #[serde(rename = "circuit_breaker.closed")]
    CircuitBreakerClosed(CircuitBreakerEvent),
    #[serde(rename = "circuit_breaker.half_open")]
    CircuitBreakerHalfOpen(CircuitBreakerEvent),
    #[serde(rename = "rate_limit.exceeded")]
    RateLimitExceeded(RateLimitEvent),
    #[serde(rename = "rate_limit.approaching")]
    RateLimitApproaching(RateLimitEvent),
    #[serde(rename = "rate_limit.recovered")]
    RateLimitRecovered(RateLimitEvent),
    #[serde(rename = "proxy.request_started")]
    ProxyRequestStarted(ProxyRequestEvent),
    #[serde(rename = "proxy.request_completed")]
    ProxyRequestCompleted(ProxyRequestEvent),
    #[serde(rename = "proxy.request_failed")]
    ProxyRequestFailed(ProxyRequestEvent),
    #[serde(rename = "health.check_failed")]
    HealthCheckFailed(HealthCheckEvent),
    #[serde(rename = "health.check_recovered")]
    HealthCheckRecovered(HealthCheckEvent),
    #[serde(rename = "config.changed")]
    ConfigChanged(ConfigChangedEvent),
}

impl EventPayload {
    /// Get the event type this payload belongs to.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::CircuitBreakerOpened(_) => EventType::CircuitBreakerOpened,
            Self::CircuitBreakerClosed(_) => EventType::CircuitBreakerClosed,
            Self::CircuitBreakerHalfOpen(_) => EventType::CircuitBreakerHalfOpen,
            Self::RateLimitExceeded(_) => EventType::RateLimitExceeded,
            Self::RateLimitApproaching(_) => EventType::RateLimitApproaching,
            Self::RateLimitRecovered(_) => EventType::RateLimitRecovered,
            Self::ProxyRequestStarted(_) => EventType::ProxyRequestStarted,
            Self::ProxyRequestCompleted(_) => EventType::ProxyRequestCompleted,
            Self::ProxyRequestFailed(_) => EventType::ProxyRequestFailed,
            Self::HealthCheckFailed(_) => EventType::HealthCheckFailed,
            Self::HealthCheckRecovered(_) => EventType::HealthCheckRecovered,
            Self::ConfigChanged(_) => EventType::ConfigChanged,
        }
    }

    /// Common fields of the payload.
    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::CircuitBreakerOpened(e)
            | Self::CircuitBreakerClosed(e)
            | Self::CircuitBreakerHalfOpen(e) => &e.meta,
            Self::RateLimitExceeded(e)
            | Self::RateLimitApproaching(e)
            | Self::RateLimitRecovered(e) => &e.meta,
            Self::ProxyRequestStarted(e)
            | Self::ProxyRequestCompleted(e)
            | Self::ProxyRequestFailed(e) => &e.meta,
            Self::HealthCheckFailed(e) | Self::HealthCheckRecovered(e) => &e.meta,
            Self::ConfigChanged(e) => &e.meta,
        }
    }

    fn meta_mut(&mut self) -> &mut EventMeta {
        match self {
            Self::CircuitBreakerOpened(e)
            | Self::CircuitBreakerClosed(e)
            | Self::CircuitBreakerHalfOpen(e) => &mut e.meta,
            Self::RateLimitExceeded(e)
            | Self::RateLimitApproaching(e)
            | Self::RateLimitRecovered(e) => &mut e.meta,
            Self::ProxyRequestStarted(e)
            | Self::ProxyRequestCompleted(e)
            | Self::ProxyRequestFailed(e) => &mut e.meta,
            Self::HealthCheckFailed(e) | Self::HealthCheckRecovered(e) => &mut e.meta,
            Self::ConfigChanged(e) => &mut e.meta,
        }
    }

    /// Producer that emitted the payload.
    pub fn source(&self) -> &str {
        &self.meta().source
    }

    /// Payload timestamp, if the producer set one.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.meta().timestamp
    }

    /// Return the payload timestamp, stamping `now` first if it is missing.
    pub(crate) fn stamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        *self.meta_mut().timestamp.get_or_insert(now)
    }

    /// Serialize only the variant's fields, as sent in the webhook `data` field.
    pub fn data(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::CircuitBreakerOpened(e)
            | Self::CircuitBreakerClosed(e)
            | Self::CircuitBreakerHalfOpen(e) => serde_json::to_value(e),
            Self::RateLimitExceeded(e)
            | Self::RateLimitApproaching(e)
            | Self::RateLimitRecovered(e) => serde_json::to_value(e),
            Self::ProxyRequestStarted(e)
            | Self::ProxyRequestCompleted(e)
            | Self::ProxyRequestFailed(e) => serde_json::to_value(e),
            Self::HealthCheckFailed(e) | Self::HealthCheckRecovered(e) => serde_json::to_value(e),
            Self::ConfigChanged(e) => serde_json::to_value(e),
        }
    }
}

/// An event as recorded by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique within the bus lifetime.
    pub id: String,
    pub event_type: EventType,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl Event {
    /// Build an event from a payload, stamping id and timestamp.
    pub fn new(mut payload: EventPayload) -> Self {
        let timestamp = payload.stamp(Utc::now());
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4().simple()),
            event_type: payload.event_type(),
            source: payload.source().to_string(),
            payload,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_event_type_wire_names_round_trip() {
        for event_type in EventType::iter() {
            let name = event_type.as_str();
            assert_eq!(EventType::from_str(name).unwrap(), event_type);
            let json = serde_json::to_string(&event_type).unwrap();
            assert_eq!(json, format!("\"{}\"", name));
        }
        assert_eq!(EventType::iter().count(), 12);
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!("*".parse::<EventSelector>().unwrap(), EventSelector::All);
        assert_eq!(
            "circuit_breaker.opened".parse::<EventSelector>().unwrap(),
            EventSelector::Type(EventType::CircuitBreakerOpened)
        );
        assert!("memory.created".parse::<EventSelector>().is_err());

        let parsed: Vec<EventSelector> =
            serde_json::from_str(r#"["*","rate_limit.exceeded"]"#).unwrap();
        assert_eq!(parsed[1], EventSelector::Type(EventType::RateLimitExceeded));
        assert!(serde_json::from_str::<Vec<EventSelector>>(r#"["bogus"]"#).is_err());
    }

    #[test]
    fn test_selector_matching() {
        let only_opened = EventSelector::from(EventType::CircuitBreakerOpened);
        assert!(only_opened.matches(EventType::CircuitBreakerOpened));
        assert!(!only_opened.matches(EventType::RateLimitExceeded));
        assert!(EventSelector::All.matches(EventType::ConfigChanged));
    }

    #[test]
    fn test_event_new_stamps_missing_timestamp() {
        let payload = EventPayload::RateLimitExceeded(RateLimitEvent::new("rate-limiter", "client-a", 100, 101));
        let event = Event::new(payload);

        assert_eq!(event.event_type, EventType::RateLimitExceeded);
        assert_eq!(event.source, "rate-limiter");
        assert!(event.id.starts_with("evt_"));
        assert_eq!(event.payload.timestamp(), Some(event.timestamp));
    }

    #[test]
    fn test_event_new_keeps_producer_timestamp() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut inner = HealthCheckEvent::new("health-monitor", "users", "http://users/health");
        inner.meta.timestamp = Some(ts);

        let event = Event::new(EventPayload::HealthCheckFailed(inner));
        assert_eq!(event.timestamp, ts);
    }

    #[test]
    fn test_payload_data_is_untagged() {
        let payload = EventPayload::CircuitBreakerOpened(
            CircuitBreakerEvent::new("circuit-breaker", "orders").with_failures(5, 5),
        );
        let data = payload.data().unwrap();

        assert_eq!(data["upstream"], "orders");
        assert_eq!(data["failure_count"], 5);
        assert_eq!(data["source"], "circuit-breaker");
        assert!(data.get("type").is_none());
    }
}
