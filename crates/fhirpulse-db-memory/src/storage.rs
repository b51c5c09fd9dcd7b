use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fhirpulse_core::{ResourceScope, generate_id};
use fhirpulse_storage::{FhirStorage, StorageError, StoredResource};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

type StorageKey = String; // Format: "ResourceType/id"

fn make_storage_key(resource_type: &str, id: &str) -> StorageKey {
    format!("{resource_type}/{id}")
}

/// In-memory FHIR storage backend using a sharded concurrent map.
///
/// Keeps only the current version of each resource.
#[derive(Debug)]
pub struct InMemoryStorage {
    data: DashMap<StorageKey, StoredResource>,
    /// Atomic counter for generating version IDs
    version_counter: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            version_counter: AtomicU64::new(1),
        }
    }

    fn next_version(&self) -> String {
        self.version_counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Stamp id, version and timestamp into the resource.
    fn prepare(
        &self,
        resource: &Value,
        id: &str,
        version_id: &str,
    ) -> Result<(String, StoredResource), StorageError> {
        let resource_type = resource_type_of(resource)?;
        let now = OffsetDateTime::now_utc();
        let last_updated = now
            .format(&Rfc3339)
            .map_err(|e| StorageError::internal(e.to_string()))?;

        let mut content = resource.clone();
        let obj = content
            .as_object_mut()
            .ok_or_else(|| StorageError::invalid_resource("resource must be a JSON object"))?;
        obj.insert("id".into(), Value::String(id.to_string()));
        let meta = obj
            .entry("meta")
            .or_insert_with(|| Value::Object(Default::default()));
        let meta = meta
            .as_object_mut()
            .ok_or_else(|| StorageError::invalid_resource("meta must be a JSON object"))?;
        meta.insert("versionId".into(), Value::String(version_id.to_string()));
        meta.insert("lastUpdated".into(), Value::String(last_updated));

        let mut stored = StoredResource::new(id, version_id, &resource_type, content);
        stored.last_updated = now;
        Ok((make_storage_key(&resource_type, id), stored))
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn resource_type_of(resource: &Value) -> Result<String, StorageError> {
    resource
        .get("resourceType")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| StorageError::invalid_resource("missing resourceType"))
}

#[async_trait]
impl FhirStorage for InMemoryStorage {
    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_id);
        let version = self.next_version();
        let (key, stored) = self.prepare(resource, &id, &version)?;

        match self.data.entry(key) {
            Entry::Occupied(_) => Err(StorageError::already_exists(&stored.resource_type, &id)),
            Entry::Vacant(slot) => {
                slot.insert(stored.clone());
                debug!(resource = %stored.reference(), version = %version, "Created resource");
                Ok(stored)
            }
        }
    }

    async fn read(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<StoredResource>, StorageError> {
        let key = make_storage_key(resource_type, id);
        Ok(self.data.get(&key).map(|entry| entry.value().clone()))
    }

    async fn update(
        &self,
        resource: &Value,
        if_match: Option<&str>,
    ) -> Result<StoredResource, StorageError> {
        let resource_type = resource_type_of(resource)?;
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| StorageError::invalid_resource("update requires an id"))?
            .to_string();
        let version = self.next_version();
        let (key, stored) = self.prepare(resource, &id, &version)?;

        match self.data.entry(key) {
            Entry::Vacant(_) => Err(StorageError::not_found(&resource_type, &id)),
            Entry::Occupied(mut slot) => {
                if let Some(expected) = if_match {
                    let actual = &slot.get().version_id;
                    if actual != expected {
                        return Err(StorageError::version_conflict(expected, actual));
                    }
                }
                slot.insert(stored.clone());
                debug!(resource = %stored.reference(), version = %version, "Updated resource");
                Ok(stored)
            }
        }
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<StoredResource, StorageError> {
        let key = make_storage_key(resource_type, id);
        let (_, removed) = self
            .data
            .remove(&key)
            .ok_or_else(|| StorageError::not_found(resource_type, id))?;
        debug!(resource = %removed.reference(), "Deleted resource");
        Ok(removed)
    }

    async fn list(
        &self,
        resource_type: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<StoredResource>, StorageError> {
        let prefix = format!("{resource_type}/");
        let mut out: Vec<StoredResource> = self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .filter(|entry| match tenant_id {
                Some(tenant) => ResourceScope::from_resource(&entry.value().resource).tenant_id == tenant,
                None => true,
            })
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_assigns_id_and_meta() {
        let storage = InMemoryStorage::new();
        let stored = storage
            .create(&json!({ "resourceType": "Patient", "name": [{ "family": "Smith" }] }))
            .await
            .unwrap();

        assert!(!stored.id.is_empty());
        assert_eq!(stored.resource["id"], stored.id.as_str());
        assert_eq!(stored.resource["meta"]["versionId"], stored.version_id.as_str());
        assert!(stored.resource["meta"]["lastUpdated"].is_string());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let storage = InMemoryStorage::new();
        let patient = json!({ "resourceType": "Patient", "id": "p1" });
        storage.create(&patient).await.unwrap();
        let err = storage.create(&patient).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn update_checks_version() {
        let storage = InMemoryStorage::new();
        let created = storage
            .create(&json!({ "resourceType": "Patient", "id": "p1" }))
            .await
            .unwrap();

        let err = storage
            .update(&json!({ "resourceType": "Patient", "id": "p1" }), Some("999"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::VersionConflict { .. }));

        let updated = storage
            .update(
                &json!({ "resourceType": "Patient", "id": "p1", "active": true }),
                Some(&created.version_id),
            )
            .await
            .unwrap();
        assert_ne!(updated.version_id, created.version_id);
        assert_eq!(updated.resource["active"], true);
    }

    #[tokio::test]
    async fn update_of_missing_resource_is_not_found() {
        let storage = InMemoryStorage::new();
        let err = storage
            .update(&json!({ "resourceType": "Patient", "id": "nope" }), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_returns_last_version() {
        let storage = InMemoryStorage::new();
        storage
            .create(&json!({ "resourceType": "Patient", "id": "p1" }))
            .await
            .unwrap();

        let removed = storage.delete("Patient", "p1").await.unwrap();
        assert_eq!(removed.id, "p1");
        assert!(storage.read("Patient", "p1").await.unwrap().is_none());
        assert!(storage.delete("Patient", "p1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_type_and_tenant() {
        let storage = InMemoryStorage::new();
        for (id, tenant) in [("a", "t1"), ("b", "t2"), ("c", "t1")] {
            storage
                .create(&json!({ "resourceType": "Patient", "id": id, "meta": { "tenant": tenant } }))
                .await
                .unwrap();
        }
        storage
            .create(&json!({ "resourceType": "Observation", "id": "o1", "meta": { "tenant": "t1" } }))
            .await
            .unwrap();

        let t1: Vec<_> = storage
            .list("Patient", Some("t1"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(t1, vec!["a", "c"]);
        assert_eq!(storage.list("Patient", None).await.unwrap().len(), 3);
    }
}
