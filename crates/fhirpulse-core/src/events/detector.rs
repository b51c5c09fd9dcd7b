//! Change detection entry point for the persistence layer.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::hooks::HookError;
use super::registry::CommitHookRegistry;
use super::types::{ChangeAction, ChangeEvent};
use crate::scope::ResourceScope;

/// Builds a [`ChangeEvent`] for each committed mutation and emits it to the
/// commit hooks.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    hooks: Arc<CommitHookRegistry>,
}

impl ChangeDetector {
    pub fn new(hooks: Arc<CommitHookRegistry>) -> Self {
        Self { hooks }
    }

    pub fn hooks(&self) -> &Arc<CommitHookRegistry> {
        &self.hooks
    }

    /// Report a committed mutation.
    ///
    /// Tenant and compartment are read from the snapshot's `meta`.
    pub async fn committed(
        &self,
        action: ChangeAction,
        resource_type: &str,
        resource_id: &str,
        version_id: Option<&str>,
        snapshot: Value,
    ) -> Result<ChangeEvent, HookError> {
        let scope = ResourceScope::from_resource(&snapshot);
        let mut event = ChangeEvent::new(action, resource_type, resource_id, scope, snapshot);
        if let Some(version) = version_id {
            event = event.with_version(version);
        }

        debug!(
            resource = %event.reference(),
            action = %action,
            tenant = %event.tenant_id,
            "Change detected"
        );
        self.hooks.emit(&event).await?;
        Ok(event)
    }
}
