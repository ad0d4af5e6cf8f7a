//! HTTP transport for webhook requests.

use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{ErrorCode, FlexGateError, FlexGateResult};

/// `User-Agent` sent with every webhook request.
pub const USER_AGENT: &str = "FlexGate-Webhooks/1.0";

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";

/// Headers every request carries. Custom headers cannot override them.
pub const STANDARD_HEADERS: [&str; 5] = [
    "Content-Type",
    SIGNATURE_HEADER,
    EVENT_HEADER,
    DELIVERY_HEADER,
    "User-Agent",
];

/// A fully prepared webhook POST.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    /// Headers in send order; standard headers first, then custom ones.
    /// Names are unique ignoring case.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

impl WebhookRequest {
    /// Build a request with the standard webhook headers.
    pub fn new(
        url: impl Into<String>,
        event: &str,
        delivery_id: &str,
        signature: &str,
        custom_headers: &HashMap<String, String>,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Self {
        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            (SIGNATURE_HEADER.to_string(), signature.to_string()),
            (EVENT_HEADER.to_string(), event.to_string()),
            (DELIVERY_HEADER.to_string(), delivery_id.to_string()),
            ("User-Agent".to_string(), USER_AGENT.to_string()),
        ];
        headers.extend(
            custom_headers
                .iter()
                .filter(|(name, _)| !is_standard_header(name))
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        Self {
            url: url.into(),
            headers,
            body,
            timeout,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn is_standard_header(name: &str) -> bool {
    STANDARD_HEADERS
        .iter()
        .any(|standard| standard.eq_ignore_ascii_case(name))
}

/// What came back from the endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }
}

/// Sends webhook requests. Errors are transport failures only; any HTTP
/// status, including 5xx, is returned as a [`WebhookResponse`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send(&self, request: WebhookRequest) -> FlexGateResult<WebhookResponse>;
}

/// reqwest-backed sender
#[derive(Clone)]
pub struct HttpSender {
    client: Client,
}

impl HttpSender {
    pub fn new() -> FlexGateResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| FlexGateError::Configuration(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Use an existing client (shares its connection pool).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookSender for HttpSender {
    async fn send(&self, request: WebhookRequest) -> FlexGateResult<WebhookResponse> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                FlexGateError::delivery(
                    ErrorCode::DlvTimeout,
                    format!("Request timed out after {}ms", request.timeout.as_millis()),
                    None,
                )
            } else {
                FlexGateError::delivery(
                    ErrorCode::DlvConnectionFailed,
                    format!("Network error: {}", e),
                    None,
                )
            }
        })?;

        let status = response.status().as_u16();
        // A body that fails to stream still leaves a usable status
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(status, error = %e, "Failed to read webhook response body");
                String::new()
            }
        };

        Ok(WebhookResponse { status, body })
    }
}
