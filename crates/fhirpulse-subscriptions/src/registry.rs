//! Lookup of stored subscriptions.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use fhirpulse_storage::FhirStorage;

use crate::error::SubscriptionResult;
use crate::types::Subscription;

pub const SUBSCRIPTION_RESOURCE_TYPE: &str = "Subscription";

/// Source of subscriptions for matching and for re-validation at delivery.
#[async_trait]
pub trait InterestRegistry: Send + Sync {
    /// Active subscriptions whose criteria name `resource_type`, across all
    /// tenants. Unusable subscriptions are skipped.
    async fn active_for_type(&self, resource_type: &str) -> SubscriptionResult<Vec<Subscription>>;

    /// Current declaration of one subscription, whatever its status.
    async fn get(&self, id: &str) -> SubscriptionResult<Option<Subscription>>;
}

/// Reads `Subscription` resources straight from storage, so every lookup
/// sees the latest committed state.
#[derive(Clone)]
pub struct StorageInterestRegistry {
    storage: Arc<dyn FhirStorage>,
}

impl StorageInterestRegistry {
    pub fn new(storage: Arc<dyn FhirStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl InterestRegistry for StorageInterestRegistry {
    async fn active_for_type(&self, resource_type: &str) -> SubscriptionResult<Vec<Subscription>> {
        let stored = self.storage.list(SUBSCRIPTION_RESOURCE_TYPE, None).await?;

        let mut active = Vec::new();
        for resource in stored {
            match Subscription::from_resource(&resource.resource) {
                Ok(sub) => {
                    if sub.is_active() && sub.criteria_resource_type() == resource_type {
                        active.push(sub);
                    }
                }
                Err(e) => {
                    warn!(subscription_id = %resource.id, error = %e, "Ignoring unusable subscription");
                }
            }
        }
        Ok(active)
    }

    async fn get(&self, id: &str) -> SubscriptionResult<Option<Subscription>> {
        match self.storage.read(SUBSCRIPTION_RESOURCE_TYPE, id).await? {
            Some(stored) => Subscription::from_resource(&stored.resource).map(Some),
            None => Ok(None),
        }
    }
}
