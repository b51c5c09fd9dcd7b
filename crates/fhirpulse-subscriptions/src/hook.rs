//! Commit hook that turns change events into delivery jobs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use fhirpulse_core::{ChangeAction, ChangeEvent, CommitHook, HookError};

use crate::error::SubscriptionError;
use crate::matcher::SubscriptionMatcher;
use crate::queue::DeliveryQueue;
use crate::registry::InterestRegistry;
use crate::types::DeliveryJob;

/// Enqueues one job per matching subscription for every committed create
/// or update. Deletes never notify.
///
/// Runs inside the write path, so it only matches and enqueues; delivery
/// happens in the [`DeliveryProcessor`](crate::DeliveryProcessor).
pub struct SubscriptionHook {
    registry: Arc<dyn InterestRegistry>,
    matcher: SubscriptionMatcher,
    queue: Arc<dyn DeliveryQueue>,
}

impl SubscriptionHook {
    pub fn new(
        registry: Arc<dyn InterestRegistry>,
        matcher: SubscriptionMatcher,
        queue: Arc<dyn DeliveryQueue>,
    ) -> Self {
        Self {
            registry,
            matcher,
            queue,
        }
    }
}

fn hook_error(e: SubscriptionError) -> HookError {
    HookError::Other(anyhow::Error::new(e))
}

#[async_trait]
impl CommitHook for SubscriptionHook {
    fn name(&self) -> &str {
        "subscription_matcher"
    }

    fn actions(&self) -> &[ChangeAction] {
        &[ChangeAction::Create, ChangeAction::Update]
    }

    async fn on_commit(&self, event: &ChangeEvent) -> Result<(), HookError> {
        let candidates = self
            .registry
            .active_for_type(&event.resource_type)
            .await
            .map_err(hook_error)?;
        if candidates.is_empty() {
            return Ok(());
        }

        let matched = self.matcher.select(event, &candidates);
        debug!(
            resource = %event.reference(),
            candidates = candidates.len(),
            matched = matched.len(),
            "Matched change against subscriptions"
        );

        for subscription in matched {
            let job = DeliveryJob::new(subscription.id.clone(), event.clone());
            let job_id = job.id.clone();
            self.queue.enqueue(job).await.map_err(hook_error)?;
            info!(
                job_id = %job_id,
                subscription_id = %subscription.id,
                resource = %event.reference(),
                action = %event.action,
                "Queued subscription delivery"
            );
        }
        Ok(())
    }
}
