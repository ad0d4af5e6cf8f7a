//! Webhook registration types and validation.

use backon::ExponentialBuilder;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use reqwest::header::{HeaderName, HeaderValue};
use url::Url;

use crate::error::{ErrorCode, FlexGateError, FlexGateResult};
use crate::events::{EventSelector, EventType};
use crate::webhooks::STANDARD_HEADERS;

/// Default per-attempt HTTP timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Random bytes in a generated secret (hex-encoded to twice the length).
const SECRET_BYTES: usize = 32;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = max_retries + 1
    pub max_retries: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Total number of HTTP attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after failed attempt `attempt` (0-based) before the next one.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        // `as` saturates, so huge products clamp to u64::MAX
        Duration::from_millis(millis.round() as u64)
    }

    /// The full sequence of pre-retry delays.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay_for_attempt(attempt))
    }

    /// Backoff schedule for the delivery retry loop.
    ///
    /// No jitter. The delay cap is the last delay of the schedule, so it never
    /// shortens a wait.
    pub fn backoff(&self) -> ExponentialBuilder {
        let longest = self
            .delays()
            .last()
            .unwrap_or_else(|| self.delay_for_attempt(0));
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.initial_delay_ms))
            .with_factor(self.backoff_multiplier as f32)
            .with_max_delay(longest)
            .with_max_times(self.max_retries as usize)
    }

    fn validate(&self) -> FlexGateResult<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(FlexGateError::invalid_field(
                ErrorCode::ValInvalidRetryPolicy,
                "retry_policy.backoff_multiplier",
                format!(
                    "Backoff multiplier must be at least 1, got {}",
                    self.backoff_multiplier
                ),
            ));
        }
        Ok(())
    }
}

/// A registered webhook endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Unique identifier for this webhook
    pub id: String,
    /// Webhook endpoint URL
    pub url: String,
    /// Event types to deliver; `*` selects all
    pub events: Vec<EventSelector>,
    /// Whether this webhook is enabled
    pub enabled: bool,
    /// Secret for HMAC signing
    pub secret: String,
    pub retry_policy: RetryPolicy,
    /// Extra request headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-attempt request timeout in milliseconds
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookConfig {
    /// Check if this webhook should receive the given event type
    pub fn should_receive(&self, event_type: EventType) -> bool {
        self.enabled && self.events.iter().any(|s| s.matches(event_type))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Input for registering a webhook. Unset fields take defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewWebhook {
    /// Generated if absent
    pub id: Option<String>,
    pub url: String,
    pub events: Vec<EventSelector>,
    pub enabled: Option<bool>,
    /// Generated if absent
    pub secret: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub headers: HashMap<String, String>,
    pub timeout_ms: Option<u64>,
}

impl NewWebhook {
    /// Create a registration for a URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Builder: subscribe to specific events
    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<EventSelector>,
    {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: subscribe to every event
    pub fn with_all_events(mut self) -> Self {
        self.events = vec![EventSelector::All];
        self
    }

    /// Builder: set secret for signing
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Builder: set retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = Some(false);
        self
    }

    /// Validate and fill defaults.
    pub(crate) fn into_config(self, production: bool) -> FlexGateResult<WebhookConfig> {
        validate_url(&self.url, production)?;
        let events = validate_events(self.events)?;
        let secret = match self.secret {
            Some(secret) => validate_secret(secret)?,
            None => generate_secret(),
        };
        let retry_policy = self.retry_policy.unwrap_or_default();
        retry_policy.validate()?;
        validate_headers(&self.headers)?;

        let now = Utc::now();
        Ok(WebhookConfig {
            id: self
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("wh_{}", uuid::Uuid::new_v4().simple())),
            url: self.url,
            events,
            enabled: self.enabled.unwrap_or(true),
            secret,
            retry_policy,
            headers: self.headers,
            timeout_ms: self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            created_at: now,
            updated_at: now,
        })
    }
}

/// Partial update of a webhook; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookUpdate {
    pub url: Option<String>,
    pub events: Option<Vec<EventSelector>>,
    pub enabled: Option<bool>,
    pub secret: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub headers: Option<HashMap<String, String>>,
    pub timeout_ms: Option<u64>,
}

impl WebhookUpdate {
    /// Merge into an existing config, validating changed fields.
    pub(crate) fn apply(self, current: &WebhookConfig, production: bool) -> FlexGateResult<WebhookConfig> {
        let mut next = current.clone();

        if let Some(url) = self.url {
            validate_url(&url, production)?;
            next.url = url;
        }
        if let Some(events) = self.events {
            next.events = validate_events(events)?;
        }
        if let Some(enabled) = self.enabled {
            next.enabled = enabled;
        }
        if let Some(secret) = self.secret {
            next.secret = validate_secret(secret)?;
        }
        if let Some(policy) = self.retry_policy {
            policy.validate()?;
            next.retry_policy = policy;
        }
        if let Some(headers) = self.headers {
            validate_headers(&headers)?;
            next.headers = headers;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            next.timeout_ms = timeout_ms;
        }

        next.updated_at = Utc::now();
        Ok(next)
    }
}

/// Generate a random signing secret (32 bytes, hex-encoded).
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn validate_url(raw: &str, production: bool) -> FlexGateResult<()> {
    let url = Url::parse(raw).map_err(|e| {
        FlexGateError::invalid_field(
            ErrorCode::ValInvalidUrl,
            "url",
            format!("Invalid webhook URL '{}': {}", raw, e),
        )
    })?;

    match url.scheme() {
        "https" => Ok(()),
        "http" if production => Err(FlexGateError::invalid_field(
            ErrorCode::ValInsecureUrl,
            "url",
            format!("Webhook URL '{}' must use https in production", raw),
        )),
        "http" => Ok(()),
        other => Err(FlexGateError::invalid_field(
            ErrorCode::ValInvalidUrl,
            "url",
            format!(
                "Invalid webhook URL '{}': scheme '{}' is not http or https",
                raw, other
            ),
        )),
    }
}

fn validate_events(mut events: Vec<EventSelector>) -> FlexGateResult<Vec<EventSelector>> {
    if events.is_empty() {
        return Err(FlexGateError::invalid_field(
            ErrorCode::ValMissingField,
            "events",
            "Webhook must subscribe to at least one event",
        ));
    }
    let mut seen = std::collections::HashSet::new();
    events.retain(|e| seen.insert(*e));
    Ok(events)
}

fn validate_secret(secret: String) -> FlexGateResult<String> {
    if secret.is_empty() {
        return Err(FlexGateError::invalid_field(
            ErrorCode::ValMissingField,
            "secret",
            "Webhook secret must not be empty",
        ));
    }
    Ok(secret)
}

/// Custom headers must be valid HTTP and must not replace a standard header.
fn validate_headers(headers: &HashMap<String, String>) -> FlexGateResult<()> {
    for (name, value) in headers {
        let field = format!("headers.{}", name);
        let parsed = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            FlexGateError::invalid_field(
                ErrorCode::ValInvalidHeader,
                field.clone(),
                format!("Invalid header name '{}': {}", name, e),
            )
        })?;
        if STANDARD_HEADERS
            .iter()
            .any(|standard| standard.eq_ignore_ascii_case(parsed.as_str()))
        {
            return Err(FlexGateError::invalid_field(
                ErrorCode::ValInvalidHeader,
                field,
                format!("Header '{}' is set by the webhook sender", name),
            ));
        }
        HeaderValue::from_str(value).map_err(|e| {
            FlexGateError::invalid_field(
                ErrorCode::ValInvalidHeader,
                field.clone(),
                format!("Invalid value for header '{}': {}", name, e),
            )
        })?;
    }
    Ok(())
}
