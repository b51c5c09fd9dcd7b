pub mod events;
pub mod id;
pub mod scope;

pub use events::{
    ChangeAction, ChangeDetector, ChangeEvent, CommitHook, CommitHookRegistry, HookError,
};
pub use id::generate_id;
pub use scope::{DEFAULT_TENANT, ResourceScope};
