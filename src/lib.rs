// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod aggregator;
pub mod api;
pub mod backend;
pub mod cache;
pub mod categories;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod ratelimit;
pub mod service;
pub mod store;

use anyhow::Context;
use axum::Router;
use std::sync::Arc;
use tracing::info;

pub use crate::api::{create_router, AppState};
pub use crate::error::{ErrorKind, NewsError, NewsResult};
pub use crate::model::NewsItem;

use crate::backend::Backend;
use crate::categories::CategoryIndex;
use crate::config::AppConfig;
use crate::ingest::{config::load_providers_default, providers::build_providers};
use crate::ratelimit::RateLimiter;
use crate::service::NewsService;

/// Wire backend, providers, store, category index, service and limiter from `cfg`.
/// Spawns the local rate-counter sweeper when no Redis is configured, so call inside a runtime.
pub async fn build_state(cfg: &AppConfig) -> anyhow::Result<AppState> {
    let backend = Backend::from_config(cfg.redis_url.as_deref(), &cfg.key_prefix)
        .await
        .context("connecting backend")?;

    let specs = load_providers_default(cfg.providers_path.as_deref())
        .context("loading provider config")?;
    let providers = build_providers(&specs, cfg.aggregator.provider_timeout)
        .context("building providers")?;
    if providers.is_empty() {
        tracing::warn!(target: "ingest", "no providers configured; refreshes will return nothing");
    }

    let store = store::build_store(&backend);
    let categories = Arc::new(CategoryIndex::build(&backend));
    let service = NewsService::new(providers, store, categories, cfg.aggregator, cfg.service);
    let limiter = Arc::new(RateLimiter::build(cfg.rate_limit, &backend));

    info!(
        backend = backend.name(),
        providers = specs.len(),
        "application state ready"
    );
    Ok(AppState { service, limiter })
}

/// Router without `/metrics` (the recorder is process-global and installed by the binary).
pub async fn app(cfg: &AppConfig) -> anyhow::Result<Router> {
    Ok(create_router(build_state(cfg).await?))
}
