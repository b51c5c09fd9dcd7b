//! EventedStorage - a storage wrapper that reports committed mutations.
//!
//! # Example
//!
//! ```ignore
//! use fhirpulse_core::{ChangeDetector, CommitHookRegistry};
//! use fhirpulse_storage::EventedStorage;
//!
//! let hooks = Arc::new(CommitHookRegistry::new());
//! hooks.register(subscription_hook).await;
//! let storage = EventedStorage::new(InMemoryStorage::new(), ChangeDetector::new(hooks));
//!
//! // Returns only after every commit hook has seen the new Patient
//! storage.create(&patient_json).await?;
//! ```

use async_trait::async_trait;
use fhirpulse_core::{ChangeAction, ChangeDetector};
use serde_json::Value;
use tracing::{debug, error};

use crate::error::StorageError;
use crate::traits::FhirStorage;
use crate::types::StoredResource;

/// A storage wrapper that calls the [`ChangeDetector`] after each successful
/// create, update and delete.
///
/// Detection happens **after** the inner backend committed, so events only
/// correspond to actual changes. If a commit hook fails, the write is still
/// committed and the caller receives [`StorageError::ChangeNotification`].
pub struct EventedStorage<S: FhirStorage> {
    inner: S,
    detector: ChangeDetector,
}

impl<S: FhirStorage> EventedStorage<S> {
    pub fn new(inner: S, detector: ChangeDetector) -> Self {
        Self { inner, detector }
    }

    /// Get a reference to the inner storage.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    async fn notify(
        &self,
        action: ChangeAction,
        stored: &StoredResource,
    ) -> Result<(), StorageError> {
        match self
            .detector
            .committed(
                action,
                &stored.resource_type,
                &stored.id,
                Some(&stored.version_id),
                stored.resource.clone(),
            )
            .await
        {
            Ok(event) => {
                debug!(
                    resource_type = %stored.resource_type,
                    resource_id = %stored.id,
                    event_id = %event.id,
                    action = %action,
                    "Reported committed change"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    resource_type = %stored.resource_type,
                    resource_id = %stored.id,
                    action = %action,
                    error = %e,
                    "Change notification failed after commit"
                );
                Err(StorageError::change_notification(
                    &stored.resource_type,
                    &stored.id,
                    &e,
                ))
            }
        }
    }
}

#[async_trait]
impl<S: FhirStorage> FhirStorage for EventedStorage<S> {
    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        let result = self.inner.create(resource).await?;
        self.notify(ChangeAction::Create, &result).await?;
        Ok(result)
    }

    async fn read(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<StoredResource>, StorageError> {
        self.inner.read(resource_type, id).await
    }

    async fn update(
        &self,
        resource: &Value,
        if_match: Option<&str>,
    ) -> Result<StoredResource, StorageError> {
        let result = self.inner.update(resource, if_match).await?;
        self.notify(ChangeAction::Update, &result).await?;
        Ok(result)
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<StoredResource, StorageError> {
        let removed = self.inner.delete(resource_type, id).await?;
        self.notify(ChangeAction::Delete, &removed).await?;
        Ok(removed)
    }

    async fn list(
        &self,
        resource_type: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<StoredResource>, StorageError> {
        self.inner.list(resource_type, tenant_id).await
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }
}
