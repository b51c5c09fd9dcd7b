//! Subscription, delivery job and audit record types.

use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use fhirpulse_core::{ChangeEvent, ResourceScope, generate_id};

use crate::error::{SubscriptionError, SubscriptionResult};

/// Extension carrying the webhook signing secret.
pub const SECRET_EXTENSION_URL: &str =
    "https://fhirpulse.dev/fhir/StructureDefinition/subscription-secret";

/// Endpoint prefix that routes a rest-hook subscription to a callback.
pub const CALLBACK_ENDPOINT_PREFIX: &str = "Bot/";

/// Audit outcome code for a successful delivery.
pub const OUTCOME_SUCCESS: &str = "0";

/// Audit outcome code for a failed delivery.
pub const OUTCOME_FAILURE: &str = "4";

// ============================================================================
// Subscription
// ============================================================================

/// Lifecycle status of a Subscription resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionStatus {
    Requested,
    Active,
    Error,
    Off,
    EnteredInError,
}

impl SubscriptionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(Self::Requested),
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            "off" => Some(Self::Off),
            "entered-in-error" => Some(Self::EnteredInError),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Active => "active",
            Self::Error => "error",
            Self::Off => "off",
            Self::EnteredInError => "entered-in-error",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a matched change is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SubscriptionChannel {
    /// HTTP POST of the resource to an external URL.
    Webhook {
        endpoint: String,
        /// Custom headers from `channel.header`, in declaration order.
        headers: Vec<(String, String)>,
        secret: Option<String>,
    },
    /// Invocation of a registered server-side callback such as `Bot/123`.
    Callback { target: String },
}

impl SubscriptionChannel {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Webhook { .. } => "webhook",
            Self::Callback { .. } => "callback",
        }
    }

    /// Endpoint URL or callback reference.
    pub fn address(&self) -> &str {
        match self {
            Self::Webhook { endpoint, .. } => endpoint,
            Self::Callback { target } => target,
        }
    }
}

/// A standing interest in resource changes, read from a stored
/// `Subscription` resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub tenant_id: String,
    pub compartment: Option<String>,
    pub status: SubscriptionStatus,
    /// Criteria string such as `Patient?name=alice`.
    pub criteria: String,
    pub channel: SubscriptionChannel,
}

impl Subscription {
    /// Interpret a stored `Subscription` resource.
    ///
    /// Only rest-hook channels are supported. An endpoint starting with
    /// `Bot/` selects a callback, anything else a webhook.
    pub fn from_resource(resource: &Value) -> SubscriptionResult<Self> {
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SubscriptionError::invalid("subscription has no id"))?
            .to_string();

        let status = resource
            .get("status")
            .and_then(Value::as_str)
            .map(|s| {
                SubscriptionStatus::parse(s)
                    .ok_or_else(|| SubscriptionError::invalid(format!("unknown status {s:?}")))
            })
            .transpose()?
            .unwrap_or(SubscriptionStatus::Requested);

        let criteria = resource
            .get("criteria")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| SubscriptionError::invalid("missing criteria"))?
            .to_string();

        let channel = resource
            .get("channel")
            .ok_or_else(|| SubscriptionError::invalid("missing channel"))?;
        let channel_type = channel.get("type").and_then(Value::as_str).unwrap_or("");
        if channel_type != "rest-hook" {
            return Err(SubscriptionError::invalid(format!(
                "unsupported channel type {channel_type:?}"
            )));
        }

        let endpoint = channel
            .get("endpoint")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| SubscriptionError::invalid("missing channel endpoint"))?;

        let channel = if endpoint.starts_with(CALLBACK_ENDPOINT_PREFIX) {
            SubscriptionChannel::Callback {
                target: endpoint.to_string(),
            }
        } else {
            SubscriptionChannel::Webhook {
                endpoint: endpoint.to_string(),
                headers: parse_headers(channel.get("header"))?,
                secret: read_secret(resource),
            }
        };

        let scope = ResourceScope::from_resource(resource);
        Ok(Self {
            id,
            tenant_id: scope.tenant_id,
            compartment: scope.compartment,
            status,
            criteria,
            channel,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Resource type named by the criteria (the part before `?`).
    pub fn criteria_resource_type(&self) -> &str {
        let path = self
            .criteria
            .split_once('?')
            .map_or(self.criteria.as_str(), |(path, _)| path);
        path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(path)
    }

    pub fn reference(&self) -> String {
        format!("Subscription/{}", self.id)
    }
}

fn parse_headers(header: Option<&Value>) -> SubscriptionResult<Vec<(String, String)>> {
    let Some(header) = header else {
        return Ok(Vec::new());
    };
    let entries = header
        .as_array()
        .ok_or_else(|| SubscriptionError::invalid("channel.header must be an array"))?;

    let mut headers = Vec::with_capacity(entries.len());
    for entry in entries {
        let raw = entry
            .as_str()
            .ok_or_else(|| SubscriptionError::invalid("channel.header entries must be strings"))?;
        let (name, value) = raw
            .split_once(':')
            .ok_or_else(|| SubscriptionError::invalid(format!("malformed header {raw:?}")))?;
        let (name, value) = (name.trim(), value.trim());
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            return Err(SubscriptionError::invalid(format!(
                "invalid header name in {raw:?}"
            )));
        }
        if HeaderValue::from_str(value).is_err() {
            return Err(SubscriptionError::invalid(format!(
                "invalid header value in {raw:?}"
            )));
        }
        headers.push((name.to_string(), value.to_string()));
    }
    Ok(headers)
}

fn read_secret(resource: &Value) -> Option<String> {
    resource
        .get("extension")?
        .as_array()?
        .iter()
        .find(|ext| ext.get("url").and_then(Value::as_str) == Some(SECRET_EXTENSION_URL))?
        .get("valueString")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// ============================================================================
// Delivery jobs
// ============================================================================

/// States a delivery job moves through.
///
/// `queued -> executing -> delivered | abandoned`, with `executing -> queued`
/// when a retry is scheduled or a lease expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Executing,
    Delivered,
    Abandoned,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Delivered => "delivered",
            Self::Abandoned => "abandoned",
        }
    }
}

/// One pending delivery of one change to one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub id: String,
    pub subscription_id: String,
    pub event: ChangeEvent,
    /// 1-based attempt number of the next execution.
    pub attempt: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
}

impl DeliveryJob {
    pub fn new(subscription_id: impl Into<String>, event: ChangeEvent) -> Self {
        Self {
            id: generate_id(),
            subscription_id: subscription_id.into(),
            event,
            attempt: 1,
            enqueued_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Why a job was dropped without an audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    SubscriptionMissing,
    SubscriptionInactive(SubscriptionStatus),
    SubscriptionInvalid(String),
    ResourceDeleted,
    CallbacksDisabled,
    RetriesExhausted { attempts: u32, last_error: String },
    Failed(String),
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SubscriptionMissing => f.write_str("subscription no longer exists"),
            Self::SubscriptionInactive(status) => write!(f, "subscription is {status}"),
            Self::SubscriptionInvalid(msg) => write!(f, "subscription is invalid: {msg}"),
            Self::ResourceDeleted => f.write_str("resource was deleted"),
            Self::CallbacksDisabled => f.write_str("callbacks are disabled for the tenant"),
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} attempts: {last_error}"),
            Self::Failed(msg) => f.write_str(msg),
        }
    }
}

/// Result of executing one job, before the queue is updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Delivered and audited with a success outcome.
    Delivered,
    /// Hard failure, audited with a failure outcome; never retried.
    Failed,
    /// Dropped silently.
    Abandoned(AbandonReason),
}

// ============================================================================
// Delivery results
// ============================================================================

/// Result of a single HTTP delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub success: bool,
    pub http_status: Option<u16>,
    pub response_time_ms: u32,
    pub error: Option<String>,
}

impl DeliveryResult {
    pub fn success(http_status: u16, response_time_ms: u32) -> Self {
        Self {
            success: true,
            http_status: Some(http_status),
            response_time_ms,
            error: None,
        }
    }

    pub fn http_failure(http_status: u16, response_time_ms: u32, error: String) -> Self {
        Self {
            success: false,
            http_status: Some(http_status),
            response_time_ms,
            error: Some(error),
        }
    }

    /// The request could not be sent as configured; retrying cannot help.
    pub fn request_failure(response_time_ms: u32, error: String) -> Self {
        Self {
            success: false,
            http_status: None,
            response_time_ms,
            error: Some(error),
        }
    }

    /// 429 responses are retried rather than audited as failures.
    pub fn is_throttled(&self) -> bool {
        self.http_status == Some(429)
    }
}

// ============================================================================
// Audit
// ============================================================================

/// Record of one delivery attempt that reached an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub subscription_id: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compartment: Option<String>,
    /// `Type/id` of the delivered resource.
    pub entity: String,
    /// `webhook` or `callback`.
    pub channel: String,
    /// `"0"` on success, non-zero on failure.
    pub outcome: String,
    pub outcome_desc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub attempt: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl AuditRecord {
    pub fn new(
        job: &DeliveryJob,
        subscription: &Subscription,
        outcome: &str,
        outcome_desc: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            subscription_id: subscription.id.clone(),
            tenant_id: subscription.tenant_id.clone(),
            compartment: subscription.compartment.clone(),
            entity: job.event.reference(),
            channel: subscription.channel.kind().to_string(),
            outcome: outcome.to_string(),
            outcome_desc: outcome_desc.into(),
            http_status: None,
            attempt: job.attempt,
            recorded_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == OUTCOME_SUCCESS
    }
}
