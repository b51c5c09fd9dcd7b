//! In-memory storage backend.

mod storage;

pub use storage::InMemoryStorage;
