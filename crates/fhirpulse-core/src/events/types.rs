//! Change event types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::scope::ResourceScope;

/// Kind of committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The fact that a resource was created, updated or deleted.
///
/// Produced once per committed mutation and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Unique id of this event
    pub id: String,
    pub resource_type: String,
    pub resource_id: String,
    /// Version written by the mutation, when the store versions resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compartment: Option<String>,
    pub action: ChangeAction,
    /// Resource content as committed (last known content for deletes)
    pub snapshot: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ChangeEvent {
    pub fn new(
        action: ChangeAction,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        scope: ResourceScope,
        snapshot: Value,
    ) -> Self {
        Self {
            id: crate::id::generate_id(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            version_id: None,
            tenant_id: scope.tenant_id,
            compartment: scope.compartment,
            action,
            snapshot,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    /// `Type/id` reference to the changed resource.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.resource_id)
    }

    pub fn scope(&self) -> ResourceScope {
        ResourceScope::new(self.tenant_id.clone(), self.compartment.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_serializes_with_lowercase_action() {
        let event = ChangeEvent::new(
            ChangeAction::Update,
            "Patient",
            "p1",
            ResourceScope::new("t1", Some("Organization/o1".into())),
            json!({ "resourceType": "Patient", "id": "p1" }),
        )
        .with_version("2");

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "update");
        assert_eq!(value["tenant_id"], "t1");
        assert_eq!(value["compartment"], "Organization/o1");
        assert_eq!(value["version_id"], "2");

        let back: ChangeEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.reference(), "Patient/p1");
    }
}
