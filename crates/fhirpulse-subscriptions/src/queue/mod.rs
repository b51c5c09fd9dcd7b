//! Durable at-least-once delivery queue.
//!
//! A claimed job is leased: it stays invisible to other claimers until it is
//! completed, rescheduled, abandoned or its lease expires. An expired lease
//! makes the job claimable again with the same attempt number, so a job is
//! delivered at least once even if its worker dies.

mod memory;
mod postgres;

pub use memory::{InMemoryDeliveryQueue, QueueStats};
pub use postgres::PgDeliveryStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SubscriptionResult;
use crate::types::DeliveryJob;

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Add a job. Fails with `QueueFull` when a bounded queue is at capacity.
    async fn enqueue(&self, job: DeliveryJob) -> SubscriptionResult<()>;

    /// Lease up to `limit` due jobs for `lease`.
    async fn claim(&self, limit: usize, lease: Duration) -> SubscriptionResult<Vec<DeliveryJob>>;

    /// Mark a claimed job delivered.
    async fn complete(&self, job_id: &str) -> SubscriptionResult<()>;

    /// Requeue a claimed job with its attempt incremented, due after `delay`.
    async fn retry(&self, job_id: &str, delay: Duration, error: &str) -> SubscriptionResult<()>;

    /// Drop a claimed job for good.
    async fn abandon(&self, job_id: &str, reason: &str) -> SubscriptionResult<()>;

    /// Jobs not yet in a terminal state.
    async fn depth(&self) -> SubscriptionResult<usize>;
}
