//! Hook trait for on-commit change notification.

use async_trait::async_trait;

use super::types::{ChangeAction, ChangeEvent};

/// Error type for hook operations.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// Hook execution failed with a message.
    #[error("Hook execution failed: {0}")]
    Execution(String),

    /// Hook did not finish within the registry timeout.
    #[error("Hook {0} timed out")]
    Timeout(String),

    /// Hook panicked while handling an event.
    #[error("Hook {hook} panicked: {message}")]
    Panicked { hook: String, message: String },

    /// Generic error with source.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HookError {
    /// Create an execution error from a string.
    pub fn execution(msg: impl Into<String>) -> Self {
        HookError::Execution(msg.into())
    }
}

/// Handler invoked synchronously after a mutation commits.
///
/// # Example
///
/// ```ignore
/// struct AuditOnWrite;
///
/// #[async_trait]
/// impl CommitHook for AuditOnWrite {
///     fn name(&self) -> &str { "audit_on_write" }
///
///     async fn on_commit(&self, event: &ChangeEvent) -> Result<(), HookError> {
///         tracing::info!(resource = %event.reference(), "committed");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait CommitHook: Send + Sync {
    /// Unique name for this hook (for logging).
    fn name(&self) -> &str;

    /// Resource types this hook is interested in.
    ///
    /// Return an empty slice to match all resource types.
    fn resource_types(&self) -> &[&str] {
        &[]
    }

    /// Actions this hook handles. Empty matches every action.
    fn actions(&self) -> &[ChangeAction] {
        &[]
    }

    /// Handle a committed change.
    ///
    /// An error is returned to the writer that caused the change.
    async fn on_commit(&self, event: &ChangeEvent) -> Result<(), HookError>;

    /// Check if this hook should handle the given event.
    fn matches(&self, event: &ChangeEvent) -> bool {
        let types = self.resource_types();
        if !types.is_empty() && !types.contains(&event.resource_type.as_str()) {
            return false;
        }

        let actions = self.actions();
        if !actions.is_empty() && !actions.contains(&event.action) {
            return false;
        }

        true
    }
}
