pub mod auth;
pub mod config;
pub mod error;
pub mod event;
pub mod handlers;
pub mod maintenance;
pub mod query;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod store;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging. Honors `RUST_LOG`; defaults to `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
