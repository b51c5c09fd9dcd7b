//! On-commit change notification.
//!
//! The persistence layer reports every committed mutation to a
//! [`ChangeDetector`], which turns it into a [`ChangeEvent`] and hands it to
//! the registered [`CommitHook`]s before the write returns to its caller.
//!
//! ```text
//! FhirStorage::create/update/delete
//!        │ (after commit)
//!        ▼
//!  ChangeDetector ──► CommitHookRegistry ──► CommitHook (e.g. subscription matcher)
//! ```
//!
//! Hooks are awaited in registration order, each under a timeout and with
//! panic protection. Unlike fire-and-forget broadcasting, a failing hook is
//! reported back to the writer: a hook that enqueues durable work must not
//! lose it silently.

pub mod detector;
pub mod hooks;
pub mod registry;
pub mod types;

pub use detector::ChangeDetector;
pub use hooks::{CommitHook, HookError};
pub use registry::CommitHookRegistry;
pub use types::{ChangeAction, ChangeEvent};
