//! Subscription error types.

use fhirpulse_search::SearchError;
use fhirpulse_storage::StorageError;
use thiserror::Error;

/// Errors raised while matching, queueing or delivering notifications.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// Stored Subscription resource cannot be used.
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("Invalid criteria: {0}")]
    InvalidCriteria(#[from] SearchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Delivery queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("Delivery job not found: {0}")]
    JobNotFound(String),

    /// Failure that a later attempt may not hit (HTTP 429, network error,
    /// callback runtime failure).
    #[error("Transient delivery failure: {0}")]
    TransientDelivery(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx_core::Error),
}

impl SubscriptionError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidSubscription(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientDelivery(msg.into())
    }

    /// Whether the job that produced this error should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientDelivery(_) | Self::Storage(_) | Self::Queue(_) | Self::Database(_)
        )
    }
}

/// Result type for subscription operations.
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;
