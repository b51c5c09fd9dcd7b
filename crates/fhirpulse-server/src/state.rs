//! Shared application state and its construction from configuration.

use std::sync::Arc;

use anyhow::Context;
use fhirpulse_core::{ChangeDetector, CommitHookRegistry};
use fhirpulse_db_memory::InMemoryStorage;
use fhirpulse_search::SearchParameterRegistry;
use fhirpulse_storage::{EventedStorage, FhirStorage};
use fhirpulse_subscriptions::{
    AuditTrail, DeliveryQueue, InMemoryAuditTrail, InMemoryDeliveryQueue, InProcessCallbackRuntime,
    PgDeliveryStore, QueueBackend, SubscriptionSettings, SubscriptionState,
};
use sqlx_postgres::PgPoolOptions;

use crate::config::{AppConfig, SearchSettings};

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn FhirStorage>,
    pub search: Arc<SearchParameterRegistry>,
    pub search_settings: SearchSettings,
    /// `None` when change notification is disabled.
    pub subscriptions: Option<SubscriptionState>,
    /// Callback handlers are registered here by the embedding application.
    pub callbacks: Arc<InProcessCallbackRuntime>,
}

/// Build the state with a callback runtime enabled for the configured tenants.
pub async fn build_state(cfg: &AppConfig) -> anyhow::Result<AppState> {
    let callbacks = Arc::new(InProcessCallbackRuntime::with_tenants(
        cfg.subscriptions.callback_tenants.iter().cloned(),
    ));
    build_state_with_callbacks(cfg, callbacks).await
}

pub async fn build_state_with_callbacks(
    cfg: &AppConfig,
    callbacks: Arc<InProcessCallbackRuntime>,
) -> anyhow::Result<AppState> {
    let hooks = Arc::new(CommitHookRegistry::new());
    let storage: Arc<dyn FhirStorage> = Arc::new(EventedStorage::new(
        InMemoryStorage::new(),
        ChangeDetector::new(hooks.clone()),
    ));
    let search = Arc::new(SearchParameterRegistry::with_defaults());

    let subscriptions = if cfg.subscriptions.enabled {
        let (queue, audit) = build_queue(&cfg.subscriptions).await?;
        let state = SubscriptionState::new(
            &cfg.subscriptions,
            storage.clone(),
            search.clone(),
            queue,
            audit,
            callbacks.clone(),
        )?;
        hooks.register(state.hook()).await;
        tracing::info!(
            backend = ?cfg.subscriptions.queue.backend,
            workers = cfg.subscriptions.workers,
            "subscription delivery enabled"
        );
        Some(state)
    } else {
        tracing::info!("subscription delivery disabled");
        None
    };

    Ok(AppState {
        storage,
        search,
        search_settings: cfg.search.clone(),
        subscriptions,
        callbacks,
    })
}

async fn build_queue(
    settings: &SubscriptionSettings,
) -> anyhow::Result<(Arc<dyn DeliveryQueue>, Arc<dyn AuditTrail>)> {
    match settings.queue.backend {
        QueueBackend::Memory => Ok((
            Arc::new(InMemoryDeliveryQueue::new(settings.queue_capacity)),
            Arc::new(InMemoryAuditTrail::new()),
        )),
        QueueBackend::Postgres => {
            let url = settings
                .queue
                .database_url
                .as_deref()
                .context("subscriptions.queue.database_url is required for postgres")?;
            let pool = PgPoolOptions::new()
                .max_connections(settings.queue.pool_size)
                .connect(url)
                .await
                .context("connecting to the delivery queue database")?;
            let store = Arc::new(
                PgDeliveryStore::new(pool)
                    .with_capacity(settings.queue_capacity)
                    .with_retention(settings.queue.retention()),
            );
            store.ensure_tables().await?;
            Ok((store.clone(), store))
        }
    }
}
