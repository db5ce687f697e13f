use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::Config,
    handlers,
    maintenance::Maintenance,
    rate_limit::RateLimiter,
    registry::Registry,
    store::Store,
};

/// Shared per-request state. Cloned into every handler; everything inside is
/// a cheap handle.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub registry: Registry,
    pub limiter: RateLimiter,
    pub maintenance: Arc<Maintenance>,
}

impl AppState {
    pub fn new(config: Config, store: Store) -> Self {
        let registry = Registry::new(
            store.clone(),
            Duration::from_secs(config.auth_lookup_timeout_secs),
        );
        let limiter = RateLimiter::new(store.clone());
        let maintenance = Arc::new(Maintenance::new(
            store.clone(),
            config.default_retention_days,
        ));

        Self {
            config: Arc::new(config),
            store,
            registry,
            limiter,
            maintenance,
        }
    }
}

/// Start the service: open the store, build the router, serve with graceful
/// shutdown.
pub async fn start_server(config: Config) -> Result<()> {
    let store = Store::connect(&config.db_url, Duration::from_secs(config.db_op_timeout_secs))
        .await?;

    let addr = SocketAddr::from((
        config.server_host.parse::<std::net::IpAddr>()?,
        config.server_port,
    ));

    let state = AppState::new(config, store);
    let app = create_router(state);

    info!("starting spillway on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("server stopped gracefully");
    Ok(())
}

/// Build the router. The body limit runs before any handler, so oversized
/// payloads are rejected before parsing; auth and rate limiting are applied
/// inside the `/api` handlers, which need the raw bytes first.
pub fn create_router(state: AppState) -> Router {
    let max_payload = state.config.max_payload_bytes;

    Router::new()
        .route("/healthz", get(handlers::health::healthz))
        .route(
            "/api/log",
            post(handlers::ingest::ingest).get(handlers::logs::query_logs),
        )
        .route(
            "/api/admin/projects",
            post(handlers::admin::create_project).get(handlers::admin::list_projects),
        )
        .route(
            "/api/admin/projects/{id}",
            delete(handlers::admin::delete_project),
        )
        .layer(DefaultBodyLimit::max(max_payload))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve on SIGINT or SIGTERM; in-flight requests drain before exit.
/// Abandoning a running maintenance pass is safe: every step is a bounded
/// delete that the next pass repeats.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining connections");
}
