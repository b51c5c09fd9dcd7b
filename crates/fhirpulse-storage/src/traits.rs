//! The storage trait implemented by persistence backends.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;
use crate::types::StoredResource;

/// Persistence collaborator for FHIR resources.
///
/// Implementations assign ids and versions, keep `meta.versionId` and
/// `meta.lastUpdated` current, and leave the tenant and compartment in
/// `meta` untouched.
#[async_trait]
pub trait FhirStorage: Send + Sync {
    /// Create a new resource. An `id` in the input is honoured if not taken.
    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError>;

    /// Point lookup by type and id.
    async fn read(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<StoredResource>, StorageError>;

    /// Replace an existing resource. `if_match` is an optional expected version.
    async fn update(
        &self,
        resource: &Value,
        if_match: Option<&str>,
    ) -> Result<StoredResource, StorageError>;

    /// Delete a resource, returning its last version.
    async fn delete(&self, resource_type: &str, id: &str) -> Result<StoredResource, StorageError>;

    /// All current resources of a type, optionally restricted to a tenant.
    async fn list(
        &self,
        resource_type: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<StoredResource>, StorageError>;

    /// Backend name, for logging.
    fn backend_name(&self) -> &'static str;
}
