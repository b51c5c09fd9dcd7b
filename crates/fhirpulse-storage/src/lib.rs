//! Storage abstraction for fhirpulse.
//!
//! [`FhirStorage`] is the persistence collaborator the notification pipeline
//! relies on. Backends implement it; [`EventedStorage`] wraps any backend and
//! reports each committed mutation to the change detector.

pub mod error;
pub mod evented;
pub mod traits;
pub mod types;

pub use error::StorageError;
pub use evented::EventedStorage;
pub use traits::FhirStorage;
pub use types::StoredResource;

/// Commonly used items.
pub mod prelude {
    pub use crate::error::StorageError;
    pub use crate::evented::EventedStorage;
    pub use crate::traits::FhirStorage;
    pub use crate::types::StoredResource;
}
