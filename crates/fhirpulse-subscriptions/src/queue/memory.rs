use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::DeliveryQueue;
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::types::{DeliveryJob, JobState};

#[derive(Debug)]
struct Entry {
    job: DeliveryJob,
    state: JobState,
    /// Due time while queued, lease expiry while executing.
    until: Instant,
    last_error: Option<String>,
}

/// Job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub executing: usize,
    pub delivered: u64,
    pub abandoned: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<Entry>,
    delivered: u64,
    abandoned: u64,
}

/// Bounded in-process queue.
///
/// Jobs do not survive a restart; use [`PgDeliveryStore`](super::PgDeliveryStore)
/// when they must.
#[derive(Debug)]
pub struct InMemoryDeliveryQueue {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl InMemoryDeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        let executing = inner
            .entries
            .iter()
            .filter(|e| e.state == JobState::Executing)
            .count();
        QueueStats {
            queued: inner.entries.len() - executing,
            executing,
            delivered: inner.delivered,
            abandoned: inner.abandoned,
        }
    }

    /// Last error recorded for a pending job.
    pub async fn last_error(&self, job_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .find(|e| e.job.id == job_id)
            .and_then(|e| e.last_error.clone())
    }

    fn position(inner: &Inner, job_id: &str) -> SubscriptionResult<usize> {
        inner
            .entries
            .iter()
            .position(|e| e.job.id == job_id && e.state == JobState::Executing)
            .ok_or_else(|| SubscriptionError::JobNotFound(job_id.to_string()))
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn enqueue(&self, job: DeliveryJob) -> SubscriptionResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.entries.len() >= self.capacity {
            return Err(SubscriptionError::QueueFull(self.capacity));
        }
        debug!(job_id = %job.id, subscription_id = %job.subscription_id, "Enqueued delivery job");
        inner.entries.push_back(Entry {
            job,
            state: JobState::Queued,
            until: Instant::now(),
            last_error: None,
        });
        Ok(())
    }

    async fn claim(&self, limit: usize, lease: Duration) -> SubscriptionResult<Vec<DeliveryJob>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let mut claimed = Vec::new();

        for entry in inner.entries.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            let due = entry.until <= now;
            match entry.state {
                JobState::Queued if due => {}
                JobState::Executing if due => {
                    debug!(job_id = %entry.job.id, "Lease expired, redelivering job");
                }
                _ => continue,
            }
            entry.state = JobState::Executing;
            entry.until = now + lease;
            claimed.push(entry.job.clone());
        }

        Ok(claimed)
    }

    async fn complete(&self, job_id: &str) -> SubscriptionResult<()> {
        let mut inner = self.inner.lock().await;
        let idx = Self::position(&inner, job_id)?;
        inner.entries.remove(idx);
        inner.delivered += 1;
        Ok(())
    }

    async fn retry(&self, job_id: &str, delay: Duration, error: &str) -> SubscriptionResult<()> {
        let mut inner = self.inner.lock().await;
        let idx = Self::position(&inner, job_id)?;
        let entry = &mut inner.entries[idx];
        entry.job.attempt += 1;
        entry.state = JobState::Queued;
        entry.until = Instant::now() + delay;
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn abandon(&self, job_id: &str, reason: &str) -> SubscriptionResult<()> {
        let mut inner = self.inner.lock().await;
        let idx = Self::position(&inner, job_id)?;
        inner.entries.remove(idx);
        inner.abandoned += 1;
        debug!(job_id, reason, "Abandoned delivery job");
        Ok(())
    }

    async fn depth(&self) -> SubscriptionResult<usize> {
        Ok(self.inner.lock().await.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirpulse_core::{ChangeAction, ChangeEvent, ResourceScope};
    use serde_json::json;

    fn job(sub: &str) -> DeliveryJob {
        let event = ChangeEvent::new(
            ChangeAction::Create,
            "Patient",
            "p1",
            ResourceScope::default(),
            json!({ "resourceType": "Patient", "id": "p1" }),
        );
        DeliveryJob::new(sub, event)
    }

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn claimed_jobs_are_hidden_until_lease_expires() {
        tokio::time::pause();
        let queue = InMemoryDeliveryQueue::new(10);
        queue.enqueue(job("s1")).await.unwrap();

        let first = queue.claim(10, LEASE).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.claim(10, LEASE).await.unwrap().is_empty());

        tokio::time::advance(LEASE + Duration::from_millis(1)).await;
        let again = queue.claim(10, LEASE).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, first[0].id);
        assert_eq!(again[0].attempt, 1);
    }

    #[tokio::test]
    async fn retry_increments_attempt_and_delays() {
        tokio::time::pause();
        let queue = InMemoryDeliveryQueue::new(10);
        let j = job("s1");
        let id = j.id.clone();
        queue.enqueue(j).await.unwrap();
        queue.claim(1, LEASE).await.unwrap();

        queue
            .retry(&id, Duration::from_secs(2), "HTTP 429")
            .await
            .unwrap();
        assert_eq!(queue.last_error(&id).await.as_deref(), Some("HTTP 429"));
        assert!(queue.claim(1, LEASE).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let claimed = queue.claim(1, LEASE).await.unwrap();
        assert_eq!(claimed[0].attempt, 2);
    }

    #[tokio::test]
    async fn terminal_transitions_remove_jobs() {
        let queue = InMemoryDeliveryQueue::new(10);
        queue.enqueue(job("a")).await.unwrap();
        queue.enqueue(job("b")).await.unwrap();
        let claimed = queue.claim(10, LEASE).await.unwrap();
        assert_eq!(claimed.len(), 2);

        queue.complete(&claimed[0].id).await.unwrap();
        queue.abandon(&claimed[1].id, "gone").await.unwrap();

        assert_eq!(queue.depth().await.unwrap(), 0);
        let stats = queue.stats().await;
        assert_eq!((stats.delivered, stats.abandoned), (1, 1));
        assert!(matches!(
            queue.complete(&claimed[0].id).await,
            Err(SubscriptionError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_jobs_beyond_capacity() {
        let queue = InMemoryDeliveryQueue::new(1);
        queue.enqueue(job("a")).await.unwrap();
        assert!(matches!(
            queue.enqueue(job("b")).await,
            Err(SubscriptionError::QueueFull(1))
        ));
    }

    #[tokio::test]
    async fn claim_respects_limit_and_order() {
        let queue = InMemoryDeliveryQueue::new(10);
        for sub in ["a", "b", "c"] {
            queue.enqueue(job(sub)).await.unwrap();
        }
        let claimed = queue.claim(2, LEASE).await.unwrap();
        let subs: Vec<_> = claimed.iter().map(|j| j.subscription_id.as_str()).collect();
        assert_eq!(subs, vec!["a", "b"]);
        let stats = queue.stats().await;
        assert_eq!((stats.queued, stats.executing), (1, 2));
    }
}
