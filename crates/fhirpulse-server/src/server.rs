use std::net::SocketAddr;

use axum::{Router, middleware, routing::get};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use fhirpulse_subscriptions::SubscriptionState;

use crate::{
    config::AppConfig,
    handlers,
    middleware as app_middleware,
    state::{AppState, build_state},
};

pub struct FhirPulseServer {
    addr: SocketAddr,
    app: Router,
    subscriptions: Option<SubscriptionState>,
}

pub fn build_app(cfg: &AppConfig, state: AppState) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route(
            "/Subscription/{id}/$audit",
            get(handlers::subscription_audit),
        )
        .route(
            "/{resource_type}",
            get(handlers::search_resource).post(handlers::create_resource),
        )
        .route(
            "/{resource_type}/{id}",
            get(handlers::read_resource)
                .put(handlers::update_resource)
                .delete(handlers::delete_resource),
        )
        .with_state(state)
        // Outermost last: request id -> trace -> content negotiation
        .layer(middleware::from_fn(app_middleware::content_negotiation))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    pub async fn build(self) -> anyhow::Result<FhirPulseServer> {
        let state = build_state(&self.config).await?;
        let subscriptions = state.subscriptions.clone();
        let app = build_app(&self.config, state);

        Ok(FhirPulseServer {
            addr: self.addr,
            app,
            subscriptions,
        })
    }
}

impl FhirPulseServer {
    /// Serve until Ctrl+C, then stop the delivery processor and wait for
    /// in-flight deliveries.
    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let processor = self
            .subscriptions
            .as_ref()
            .map(|subs| tokio::spawn(subs.processor().run(shutdown_rx)));

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        let served = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        let _ = shutdown_tx.send(true);
        if let Some(handle) = processor {
            match handle.await {
                Ok(Ok(())) => tracing::info!("delivery processor stopped"),
                Ok(Err(e)) => tracing::error!(error = %e, "delivery processor failed"),
                Err(e) => tracing::error!(error = %e, "delivery processor panicked"),
            }
        }
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
