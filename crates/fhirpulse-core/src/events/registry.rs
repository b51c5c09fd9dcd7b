//! Registry of commit hooks.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use super::hooks::{CommitHook, HookError};
use super::types::ChangeEvent;

/// Default timeout for hook execution.
const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry for commit hooks.
///
/// Hooks run inline with the write that produced the event, so the registry
/// awaits each one in turn and reports the first failure.
pub struct CommitHookRegistry {
    hooks: RwLock<Vec<Arc<dyn CommitHook>>>,
    timeout: Duration,
}

impl CommitHookRegistry {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HOOK_TIMEOUT)
    }

    /// Create a new registry with custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            timeout,
        }
    }

    pub async fn register(&self, hook: Arc<dyn CommitHook>) {
        let name = hook.name().to_string();
        self.hooks.write().await.push(hook);
        debug!(hook = %name, "Registered commit hook");
    }

    pub async fn hook_count(&self) -> usize {
        self.hooks.read().await.len()
    }

    async fn matching_hooks(&self, event: &ChangeEvent) -> Vec<Arc<dyn CommitHook>> {
        let hooks = self.hooks.read().await;
        hooks.iter().filter(|h| h.matches(event)).cloned().collect()
    }

    /// Run every matching hook for `event`.
    ///
    /// Each hook is guarded by the registry timeout and by panic recovery.
    /// All hooks run even if an earlier one failed; the first error is
    /// returned.
    pub async fn emit(&self, event: &ChangeEvent) -> Result<(), HookError> {
        let hooks = self.matching_hooks(event).await;
        if hooks.is_empty() {
            debug!(resource = %event.reference(), "No commit hooks matched event");
            return Ok(());
        }

        let mut first_error = None;
        for hook in hooks {
            let hook_name = hook.name().to_string();
            let result = tokio::time::timeout(self.timeout, async {
                AssertUnwindSafe(hook.on_commit(event)).catch_unwind().await
            })
            .await;

            let outcome = match result {
                Ok(Ok(Ok(()))) => {
                    debug!(hook = %hook_name, action = %event.action, "Commit hook executed");
                    Ok(())
                }
                Ok(Ok(Err(e))) => {
                    warn!(hook = %hook_name, error = %e, "Commit hook failed");
                    Err(e)
                }
                Ok(Err(panic)) => {
                    let message = if let Some(s) = panic.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "Unknown panic".to_string()
                    };
                    error!(hook = %hook_name, panic = %message, "Commit hook panicked");
                    Err(HookError::Panicked {
                        hook: hook_name,
                        message,
                    })
                }
                Err(_) => {
                    error!(
                        hook = %hook_name,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Commit hook timed out"
                    );
                    Err(HookError::Timeout(hook_name))
                }
            };

            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for CommitHookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CommitHookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitHookRegistry")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
