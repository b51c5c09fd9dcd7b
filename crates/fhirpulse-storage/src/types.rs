//! Storage types.

use fhirpulse_core::ResourceScope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// A resource as held by a storage backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResource {
    pub id: String,
    /// The version ID of this specific version.
    pub version_id: String,
    pub resource_type: String,
    /// The full resource content, including `meta`.
    pub resource: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl StoredResource {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        version_id: impl Into<String>,
        resource_type: impl Into<String>,
        resource: Value,
    ) -> Self {
        Self {
            id: id.into(),
            version_id: version_id.into(),
            resource_type: resource_type.into(),
            resource,
            last_updated: OffsetDateTime::now_utc(),
        }
    }

    pub fn scope(&self) -> ResourceScope {
        ResourceScope::from_resource(&self.resource)
    }

    /// `Type/id` reference to this resource.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}
