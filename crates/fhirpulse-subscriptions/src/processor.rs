//! Background delivery processor.
//!
//! Polls the queue, runs each claimed job in its own task and records the
//! result back on the queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::queue::DeliveryQueue;
use crate::retry::RetryPolicy;
use crate::types::{AbandonReason, DeliveryJob, JobOutcome};
use crate::worker::DeliveryWorker;

/// What happened to a job after one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTransition {
    /// Delivered or hard-failed; both are final and audited.
    Completed(JobOutcome),
    /// Requeued for another attempt.
    Retrying {
        next_attempt: u32,
        delay: Duration,
        error: String,
    },
    /// Dropped without an audit record.
    Abandoned(AbandonReason),
}

pub struct DeliveryProcessor {
    queue: Arc<dyn DeliveryQueue>,
    worker: Arc<DeliveryWorker>,
    retry: RetryPolicy,
    /// Maximum jobs executing at once
    workers: usize,
    /// Maximum jobs claimed per poll
    batch_size: usize,
    /// Poll interval when the queue is idle
    poll_interval: Duration,
    job_timeout: Duration,
    lease: Duration,
}

impl DeliveryProcessor {
    pub fn new(queue: Arc<dyn DeliveryQueue>, worker: Arc<DeliveryWorker>) -> Self {
        Self {
            queue,
            worker,
            retry: RetryPolicy::default(),
            workers: 4,
            batch_size: 16,
            poll_interval: Duration::from_millis(500),
            job_timeout: Duration::from_secs(60),
            lease: Duration::from_secs(120),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Per-job time limit. The lease is raised to at least this value.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self.lease = self.lease.max(timeout);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease.max(self.job_timeout);
        self
    }

    /// Run until `shutdown` turns true or its sender is dropped, then wait
    /// for in-flight jobs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> SubscriptionResult<()> {
        info!(
            workers = self.workers,
            batch_size = self.batch_size,
            "Starting subscription delivery processor"
        );

        let this = Arc::new(self);
        let slots = Arc::new(Semaphore::new(this.workers));
        let mut in_flight = JoinSet::new();

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_join(joined);
            }

            let claimed = this.dispatch(&slots, &mut in_flight).await;
            if claimed == this.batch_size && !*shutdown.borrow() {
                // More may be waiting.
                continue;
            }

            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    match result {
                        Ok(()) if *shutdown.borrow() => {
                            info!("Subscription delivery processor shutting down");
                            break;
                        }
                        Ok(()) => {}
                        Err(_) => {
                            info!("Subscription delivery processor shutdown channel closed");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(this.poll_interval) => {}
            }
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Waiting for in-flight deliveries");
        }
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
        Ok(())
    }

    /// Claim as many jobs as there are free slots and spawn them.
    async fn dispatch(
        self: &Arc<Self>,
        slots: &Arc<Semaphore>,
        in_flight: &mut JoinSet<()>,
    ) -> usize {
        let free = slots.available_permits().min(self.batch_size);
        if free == 0 {
            return 0;
        }

        let jobs = match self.queue.claim(free, self.lease).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to claim delivery jobs");
                return 0;
            }
        };
        if jobs.is_empty() {
            return 0;
        }
        debug!(count = jobs.len(), "Processing delivery jobs");

        let count = jobs.len();
        for job in jobs {
            // Unclaimed leftovers are picked up again once their lease expires.
            let Ok(permit) = slots.clone().acquire_owned().await else {
                break;
            };
            let this = Arc::clone(self);
            in_flight.spawn(async move {
                let _permit = permit;
                this.process(job).await;
            });
        }
        count
    }

    /// Execute one job and record the result on the queue.
    pub async fn process(&self, job: DeliveryJob) -> JobTransition {
        let result = match tokio::time::timeout(self.job_timeout, self.worker.execute(&job)).await
        {
            Ok(result) => result,
            Err(_) => Err(SubscriptionError::transient(format!(
                "delivery timed out after {}ms",
                self.job_timeout.as_millis()
            ))),
        };

        let transition = match result {
            Ok(JobOutcome::Abandoned(reason)) => JobTransition::Abandoned(reason),
            Ok(outcome) => JobTransition::Completed(outcome),
            Err(e) if e.is_retryable() => match self.retry.next_delay(job.attempt) {
                Some(delay) => JobTransition::Retrying {
                    next_attempt: job.attempt + 1,
                    delay,
                    error: e.to_string(),
                },
                None => JobTransition::Abandoned(AbandonReason::RetriesExhausted {
                    attempts: job.attempt,
                    last_error: e.to_string(),
                }),
            },
            Err(e) => JobTransition::Abandoned(AbandonReason::Failed(e.to_string())),
        };

        if let Err(e) = self.record(&job, &transition).await {
            error!(job_id = %job.id, error = %e, "Failed to update delivery job");
        }
        transition
    }

    async fn record(&self, job: &DeliveryJob, transition: &JobTransition) -> SubscriptionResult<()> {
        match transition {
            JobTransition::Completed(_) => self.queue.complete(&job.id).await,
            JobTransition::Retrying {
                next_attempt,
                delay,
                error,
            } => {
                warn!(
                    job_id = %job.id,
                    subscription_id = %job.subscription_id,
                    next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Delivery failed, scheduling retry"
                );
                self.queue.retry(&job.id, *delay, error).await
            }
            JobTransition::Abandoned(reason) => {
                if matches!(
                    reason,
                    AbandonReason::RetriesExhausted { .. } | AbandonReason::Failed(_)
                ) {
                    warn!(
                        job_id = %job.id,
                        subscription_id = %job.subscription_id,
                        reason = %reason,
                        "Abandoning delivery job"
                    );
                }
                self.queue.abandon(&job.id, &reason.to_string()).await
            }
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Delivery task failed");
    }
}
