//! Webhook (rest-hook) delivery over HTTP.

use std::time::{Duration, Instant};

use reqwest::Client;

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::types::DeliveryResult;

/// Maximum response body kept for failure descriptions.
const MAX_ERROR_BODY: usize = 512;

/// POSTs notification bodies to webhook endpoints.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: Client,
}

impl WebhookChannel {
    pub fn new(timeout: Duration, connect_timeout: Duration) -> SubscriptionResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| SubscriptionError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Send one request.
    ///
    /// Any HTTP response yields `Ok`, as does a request that cannot be built
    /// (bad URL or header), which comes back without a status. Transport
    /// failures such as a refused connection or a timeout are `Err`, as
    /// `TransientDelivery`.
    pub async fn send(
        &self,
        endpoint: &str,
        headers: &[(String, String)],
        body: String,
    ) -> SubscriptionResult<DeliveryResult> {
        let start = Instant::now();

        let mut request = self.client.post(endpoint);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.body(body).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_builder() => {
                let elapsed_ms = start.elapsed().as_millis() as u32;
                tracing::warn!(endpoint, error = %e, "Webhook request is invalid");
                return Ok(DeliveryResult::request_failure(
                    elapsed_ms,
                    format!("invalid request: {e}"),
                ));
            }
            Err(e) => {
                let elapsed_ms = start.elapsed().as_millis() as u32;
                let message = if e.is_timeout() {
                    format!("request timed out after {elapsed_ms}ms")
                } else if e.is_connect() {
                    format!("connection failed: {e}")
                } else {
                    format!("request failed: {e}")
                };
                tracing::warn!(endpoint, elapsed_ms, error = %message, "Webhook request failed");
                return Err(SubscriptionError::transient(message));
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u32;
        let status = response.status();

        if status.is_success() {
            tracing::debug!(
                endpoint,
                status = status.as_u16(),
                elapsed_ms,
                "Webhook delivered"
            );
            return Ok(DeliveryResult::success(status.as_u16(), elapsed_ms));
        }

        let body = response.text().await.unwrap_or_default();
        let detail = if body.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {}", truncate(&body, MAX_ERROR_BODY))
        };

        tracing::warn!(
            endpoint,
            status = status.as_u16(),
            elapsed_ms,
            "Webhook returned error status"
        );

        Ok(DeliveryResult::http_failure(
            status.as_u16(),
            elapsed_ms,
            detail,
        ))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
