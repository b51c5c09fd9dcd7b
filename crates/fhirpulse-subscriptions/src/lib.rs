//! Subscription matching and notification delivery.
//!
//! Committed changes reach the [`SubscriptionHook`], which matches them
//! against active subscriptions and enqueues a [`DeliveryJob`] per match.
//! The [`DeliveryProcessor`] drains the queue with a pool of
//! [`DeliveryWorker`]s that re-validate each job, deliver it by webhook or
//! callback, retry transient failures and audit definite outcomes.
//!
//! ```ignore
//! let hooks = Arc::new(CommitHookRegistry::new());
//! let storage: Arc<dyn FhirStorage> =
//!     Arc::new(EventedStorage::new(InMemoryStorage::new(), ChangeDetector::new(hooks.clone())));
//! let state = SubscriptionState::in_memory(&settings, storage, search, callbacks)?;
//! hooks.register(state.hook()).await;
//! tokio::spawn(state.processor().run(shutdown_rx));
//! ```

pub mod audit;
pub mod config;
pub mod delivery;
pub mod error;
pub mod hook;
pub mod matcher;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod signing;
pub mod types;
pub mod worker;

use std::sync::Arc;

use fhirpulse_search::SearchParameterRegistry;
use fhirpulse_storage::FhirStorage;

pub use audit::{AuditTrail, InMemoryAuditTrail};
pub use config::{
    HeaderPolicy, QueueBackend, QueueSettings, RetrySettings, SubscriptionSettings,
};
pub use delivery::{
    CallbackError, CallbackHandler, CallbackInput, CallbackRuntime, InProcessCallbackRuntime,
    WebhookChannel,
};
pub use error::{SubscriptionError, SubscriptionResult};
pub use hook::SubscriptionHook;
pub use matcher::SubscriptionMatcher;
pub use processor::{DeliveryProcessor, JobTransition};
pub use queue::{DeliveryQueue, InMemoryDeliveryQueue, PgDeliveryStore, QueueStats};
pub use registry::{InterestRegistry, StorageInterestRegistry};
pub use retry::RetryPolicy;
pub use types::{
    AbandonReason, AuditRecord, DeliveryJob, DeliveryResult, JobOutcome, JobState, Subscription,
    SubscriptionChannel, SubscriptionStatus,
};
pub use worker::DeliveryWorker;

/// Wired-up subscription components sharing one queue and audit trail.
#[derive(Clone)]
pub struct SubscriptionState {
    settings: SubscriptionSettings,
    registry: Arc<dyn InterestRegistry>,
    matcher: SubscriptionMatcher,
    queue: Arc<dyn DeliveryQueue>,
    audit: Arc<dyn AuditTrail>,
    worker: Arc<DeliveryWorker>,
}

impl SubscriptionState {
    pub fn new(
        settings: &SubscriptionSettings,
        storage: Arc<dyn FhirStorage>,
        search: Arc<SearchParameterRegistry>,
        queue: Arc<dyn DeliveryQueue>,
        audit: Arc<dyn AuditTrail>,
        callbacks: Arc<dyn CallbackRuntime>,
    ) -> SubscriptionResult<Self> {
        settings.validate().map_err(SubscriptionError::Config)?;

        let registry: Arc<dyn InterestRegistry> =
            Arc::new(StorageInterestRegistry::new(storage.clone()));
        let webhook = WebhookChannel::new(settings.webhook_timeout(), settings.connect_timeout())?;
        let worker = DeliveryWorker::new(
            registry.clone(),
            storage,
            webhook,
            callbacks,
            audit.clone(),
        )
        .with_header_policy(settings.header_policy)
        .with_signature_header(settings.signature_header.trim())
        .with_callback_timeout(settings.callback_timeout());

        Ok(Self {
            settings: settings.clone(),
            registry,
            matcher: SubscriptionMatcher::new(search),
            queue,
            audit,
            worker: Arc::new(worker),
        })
    }

    /// State backed by an in-memory queue and audit trail.
    pub fn in_memory(
        settings: &SubscriptionSettings,
        storage: Arc<dyn FhirStorage>,
        search: Arc<SearchParameterRegistry>,
        callbacks: Arc<dyn CallbackRuntime>,
    ) -> SubscriptionResult<Self> {
        Self::new(
            settings,
            storage,
            search,
            Arc::new(InMemoryDeliveryQueue::new(settings.queue_capacity)),
            Arc::new(InMemoryAuditTrail::new()),
            callbacks,
        )
    }

    /// Commit hook to register with the storage's hook registry.
    pub fn hook(&self) -> Arc<SubscriptionHook> {
        Arc::new(SubscriptionHook::new(
            self.registry.clone(),
            self.matcher.clone(),
            self.queue.clone(),
        ))
    }

    pub fn processor(&self) -> DeliveryProcessor {
        DeliveryProcessor::new(self.queue.clone(), self.worker.clone())
            .with_retry_policy(RetryPolicy::from(&self.settings.retry))
            .with_workers(self.settings.workers)
            .with_batch_size(self.settings.batch_size)
            .with_poll_interval(self.settings.poll_interval())
            .with_job_timeout(self.settings.job_timeout())
            .with_lease(self.settings.lease())
    }

    pub fn queue(&self) -> &Arc<dyn DeliveryQueue> {
        &self.queue
    }

    pub fn audit(&self) -> &Arc<dyn AuditTrail> {
        &self.audit
    }

    pub fn worker(&self) -> &Arc<DeliveryWorker> {
        &self.worker
    }

    pub fn settings(&self) -> &SubscriptionSettings {
        &self.settings
    }
}
