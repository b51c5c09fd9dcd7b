//! Execution of a single delivery job.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use fhirpulse_storage::FhirStorage;

use crate::audit::AuditTrail;
use crate::config::HeaderPolicy;
use crate::delivery::{CallbackError, CallbackInput, CallbackRuntime, WebhookChannel};
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::registry::InterestRegistry;
use crate::signing::build_headers;
use crate::types::{
    AbandonReason, AuditRecord, DeliveryJob, JobOutcome, OUTCOME_FAILURE, OUTCOME_SUCCESS,
    Subscription, SubscriptionChannel,
};

const DEFAULT_SIGNATURE_HEADER: &str = "X-Signature";
const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Performs one delivery attempt.
///
/// The subscription and the resource are re-read before anything is sent,
/// so a job queued before a subscription was switched off or the resource
/// was deleted is dropped silently. Transient failures come back as a
/// retryable [`SubscriptionError`]; definite outcomes are audited.
pub struct DeliveryWorker {
    registry: Arc<dyn InterestRegistry>,
    storage: Arc<dyn FhirStorage>,
    webhook: WebhookChannel,
    callbacks: Arc<dyn CallbackRuntime>,
    audit: Arc<dyn AuditTrail>,
    header_policy: HeaderPolicy,
    signature_header: String,
    callback_timeout: Duration,
}

impl DeliveryWorker {
    pub fn new(
        registry: Arc<dyn InterestRegistry>,
        storage: Arc<dyn FhirStorage>,
        webhook: WebhookChannel,
        callbacks: Arc<dyn CallbackRuntime>,
        audit: Arc<dyn AuditTrail>,
    ) -> Self {
        Self {
            registry,
            storage,
            webhook,
            callbacks,
            audit,
            header_policy: HeaderPolicy::default(),
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
        }
    }

    pub fn with_header_policy(mut self, policy: HeaderPolicy) -> Self {
        self.header_policy = policy;
        self
    }

    pub fn with_signature_header(mut self, name: impl Into<String>) -> Self {
        self.signature_header = name.into();
        self
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    pub async fn execute(&self, job: &DeliveryJob) -> SubscriptionResult<JobOutcome> {
        let subscription = match self.registry.get(&job.subscription_id).await {
            Ok(Some(sub)) => sub,
            Ok(None) => return Ok(abandon(job, AbandonReason::SubscriptionMissing)),
            Err(SubscriptionError::InvalidSubscription(msg)) => {
                return Ok(abandon(job, AbandonReason::SubscriptionInvalid(msg)));
            }
            Err(e) => return Err(e),
        };
        if !subscription.is_active() {
            return Ok(abandon(
                job,
                AbandonReason::SubscriptionInactive(subscription.status),
            ));
        }

        let event = &job.event;
        let Some(current) = self
            .storage
            .read(&event.resource_type, &event.resource_id)
            .await?
        else {
            return Ok(abandon(job, AbandonReason::ResourceDeleted));
        };

        match &subscription.channel {
            SubscriptionChannel::Webhook {
                endpoint,
                headers,
                secret,
            } => {
                self.deliver_webhook(
                    job,
                    &subscription,
                    endpoint,
                    headers,
                    secret.as_deref(),
                    &current.resource,
                )
                .await
            }
            SubscriptionChannel::Callback { target } => {
                self.deliver_callback(job, &subscription, target, current.resource)
                    .await
            }
        }
    }

    async fn deliver_webhook(
        &self,
        job: &DeliveryJob,
        subscription: &Subscription,
        endpoint: &str,
        custom_headers: &[(String, String)],
        secret: Option<&str>,
        resource: &Value,
    ) -> SubscriptionResult<JobOutcome> {
        let body = serde_json::to_string(resource)?;
        let headers = build_headers(
            custom_headers,
            secret,
            &body,
            self.header_policy,
            &self.signature_header,
        )?;

        let result = self.webhook.send(endpoint, &headers, body).await?;

        if result.success {
            let status = result.http_status.unwrap_or_default();
            let record = AuditRecord::new(
                job,
                subscription,
                OUTCOME_SUCCESS,
                format!("Success: HTTP {status}"),
            )
            .with_http_status(status);
            self.audit.append(record).await?;
            info!(
                job_id = %job.id,
                subscription_id = %subscription.id,
                endpoint,
                status,
                elapsed_ms = result.response_time_ms,
                "Webhook delivered"
            );
            return Ok(JobOutcome::Delivered);
        }

        if result.is_throttled() {
            return Err(SubscriptionError::transient("HTTP 429 Too Many Requests"));
        }

        let record = match result.http_status {
            Some(status) => {
                let detail = result.error.unwrap_or_else(|| status.to_string());
                AuditRecord::new(
                    job,
                    subscription,
                    OUTCOME_FAILURE,
                    format!("Error: HTTP {detail}"),
                )
                .with_http_status(status)
            }
            None => {
                let detail = result.error.unwrap_or_else(|| "request failed".to_string());
                AuditRecord::new(job, subscription, OUTCOME_FAILURE, format!("Error: {detail}"))
            }
        };
        self.audit.append(record).await?;
        warn!(
            job_id = %job.id,
            subscription_id = %subscription.id,
            endpoint,
            status = ?result.http_status,
            "Webhook delivery failed"
        );
        Ok(JobOutcome::Failed)
    }

    async fn deliver_callback(
        &self,
        job: &DeliveryJob,
        subscription: &Subscription,
        target: &str,
        resource: Value,
    ) -> SubscriptionResult<JobOutcome> {
        if !self.callbacks.is_enabled(&subscription.tenant_id) {
            return Ok(abandon(job, AbandonReason::CallbacksDisabled));
        }

        let input = CallbackInput {
            subscription_id: subscription.id.clone(),
            tenant_id: subscription.tenant_id.clone(),
            compartment: subscription.compartment.clone(),
            action: job.event.action,
            input: resource,
            storage: self.storage.clone(),
        };

        let invocation = self.callbacks.invoke(target, input);
        let result = tokio::time::timeout(self.callback_timeout, invocation)
            .await
            .map_err(|_| {
                SubscriptionError::transient(format!(
                    "callback {target} timed out after {}ms",
                    self.callback_timeout.as_millis()
                ))
            })?;

        let (outcome, description, delivered) = match result {
            Ok(output) => (OUTCOME_SUCCESS, success_description(output.as_ref())?, true),
            Err(e @ CallbackError::Runtime(_)) => {
                return Err(SubscriptionError::transient(e.to_string()));
            }
            Err(e) => (OUTCOME_FAILURE, format!("Error: {e}"), false),
        };

        self.audit
            .append(AuditRecord::new(job, subscription, outcome, description))
            .await?;

        if delivered {
            info!(
                job_id = %job.id,
                subscription_id = %subscription.id,
                callback = target,
                "Callback completed"
            );
            Ok(JobOutcome::Delivered)
        } else {
            warn!(
                job_id = %job.id,
                subscription_id = %subscription.id,
                callback = target,
                "Callback reported an error"
            );
            Ok(JobOutcome::Failed)
        }
    }
}

fn success_description(output: Option<&Value>) -> SubscriptionResult<String> {
    Ok(match output {
        Some(value) => format!("Success\n{}", serde_json::to_string_pretty(value)?),
        None => "Success".to_string(),
    })
}

fn abandon(job: &DeliveryJob, reason: AbandonReason) -> JobOutcome {
    debug!(
        job_id = %job.id,
        subscription_id = %job.subscription_id,
        reason = %reason,
        "Dropping delivery job"
    );
    JobOutcome::Abandoned(reason)
}
