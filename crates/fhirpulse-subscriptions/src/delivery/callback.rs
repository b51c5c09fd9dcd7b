//! Server-side callbacks (`Bot/<id>` endpoints).
//!
//! A callback receives the changed resource and a storage handle scoped to
//! the server, and returns an optional output value. Callbacks must be
//! enabled for the subscription's tenant; jobs for other tenants are dropped.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures_util::FutureExt;
use serde_json::Value;

use fhirpulse_core::ChangeAction;
use fhirpulse_storage::FhirStorage;

/// Tenant entry that enables callbacks everywhere.
pub const ALL_TENANTS: &str = "*";

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    /// The callback ran and reported a failure. Audited, never retried.
    #[error("{0}")]
    Application(String),

    /// The runtime could not run the callback. Retried.
    #[error("callback runtime failure: {0}")]
    Runtime(String),

    #[error("callback {0} is not registered")]
    NotFound(String),
}

impl CallbackError {
    pub fn application(msg: impl Into<String>) -> Self {
        Self::Application(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Runtime(_))
    }
}

/// What a callback is invoked with.
pub struct CallbackInput {
    pub subscription_id: String,
    pub tenant_id: String,
    pub compartment: Option<String>,
    pub action: ChangeAction,
    /// Current content of the changed resource.
    pub input: Value,
    /// Storage for callbacks that read or write other resources.
    pub storage: Arc<dyn FhirStorage>,
}

impl std::fmt::Debug for CallbackInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackInput")
            .field("subscription_id", &self.subscription_id)
            .field("tenant_id", &self.tenant_id)
            .field("compartment", &self.compartment)
            .field("action", &self.action)
            .field("storage", &self.storage.backend_name())
            .finish_non_exhaustive()
    }
}

/// Sandboxed executor for callbacks.
#[async_trait]
pub trait CallbackRuntime: Send + Sync {
    fn is_enabled(&self, tenant_id: &str) -> bool;

    async fn invoke(
        &self,
        target: &str,
        input: CallbackInput,
    ) -> Result<Option<Value>, CallbackError>;
}

/// One callback implementation.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    async fn call(&self, input: CallbackInput) -> Result<Option<Value>, CallbackError>;
}

/// Runs registered Rust handlers in-process. A panicking handler is
/// contained and reported as a runtime failure.
#[derive(Default)]
pub struct InProcessCallbackRuntime {
    handlers: DashMap<String, Arc<dyn CallbackHandler>>,
    enabled_tenants: DashSet<String>,
}

impl InProcessCallbackRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime with callbacks enabled for `tenants` (`*` for all).
    pub fn with_tenants<I, S>(tenants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let runtime = Self::new();
        for tenant in tenants {
            runtime.enabled_tenants.insert(tenant.into());
        }
        runtime
    }

    /// Register or replace the handler for `target`, e.g. `Bot/123`.
    pub fn register(&self, target: impl Into<String>, handler: Arc<dyn CallbackHandler>) {
        self.handlers.insert(target.into(), handler);
    }

    pub fn enable_tenant(&self, tenant_id: impl Into<String>) {
        self.enabled_tenants.insert(tenant_id.into());
    }

    pub fn disable_tenant(&self, tenant_id: &str) {
        self.enabled_tenants.remove(tenant_id);
    }
}

#[async_trait]
impl CallbackRuntime for InProcessCallbackRuntime {
    fn is_enabled(&self, tenant_id: &str) -> bool {
        self.enabled_tenants.contains(ALL_TENANTS) || self.enabled_tenants.contains(tenant_id)
    }

    async fn invoke(
        &self,
        target: &str,
        input: CallbackInput,
    ) -> Result<Option<Value>, CallbackError> {
        let handler = self
            .handlers
            .get(target)
            .map(|h| h.value().clone())
            .ok_or_else(|| CallbackError::NotFound(target.to_string()))?;

        match AssertUnwindSafe(handler.call(input)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(callback = target, message = %message, "Callback panicked");
                Err(CallbackError::Runtime(format!("callback panicked: {message}")))
            }
        }
    }
}
