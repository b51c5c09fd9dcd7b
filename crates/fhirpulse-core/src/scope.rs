//! Tenant and compartment scoping of stored resources.
//!
//! Every resource belongs to exactly one tenant, read from `meta.tenant`.
//! It may additionally be pinned to a compartment, a reference such as
//! `Organization/acme` stored in `meta.compartment.reference`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tenant assigned to resources that do not declare one.
pub const DEFAULT_TENANT: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceScope {
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compartment: Option<String>,
}

impl ResourceScope {
    pub fn new(tenant_id: impl Into<String>, compartment: Option<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            compartment,
        }
    }

    /// Read the scope from a resource's `meta` element.
    pub fn from_resource(resource: &Value) -> Self {
        let meta = resource.get("meta");
        let tenant_id = meta
            .and_then(|m| m.get("tenant"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TENANT)
            .to_string();
        let compartment = meta
            .and_then(|m| m.get("compartment"))
            .and_then(|c| c.get("reference"))
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        Self {
            tenant_id,
            compartment,
        }
    }

    /// Write this scope into a resource's `meta` element.
    pub fn apply_to(&self, resource: &mut Value) {
        let Some(obj) = resource.as_object_mut() else {
            return;
        };
        let meta = obj
            .entry("meta")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("tenant".into(), Value::String(self.tenant_id.clone()));
            match &self.compartment {
                Some(reference) => {
                    meta.insert(
                        "compartment".into(),
                        serde_json::json!({ "reference": reference }),
                    );
                }
                None => {
                    meta.remove("compartment");
                }
            }
        }
    }
}

impl Default for ResourceScope {
    fn default() -> Self {
        Self::new(DEFAULT_TENANT, None)
    }
}
