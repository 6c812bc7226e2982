//! Headline Hub: binary entrypoint.
//! Boots the Axum HTTP server, wiring shared state, the refresh scheduler and `/metrics`.

use std::net::SocketAddr;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use headline_hub::config::AppConfig;
use headline_hub::ingest::scheduler::{spawn_refresh_scheduler, RefreshSchedulerCfg};
use headline_hub::metrics::Metrics;

/// `RUST_LOG` filter (default `info`); JSON lines when `LOG_FORMAT=json`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::from_env();
    let metrics = Metrics::init(cfg.aggregator.cache_ttl.as_secs())?;

    let state = headline_hub::build_state(&cfg).await?;
    if let Some(interval) = cfg.refresh_interval {
        spawn_refresh_scheduler(state.service.clone(), RefreshSchedulerCfg { interval });
    } else {
        tracing::info!(target: "scheduler", "periodic refresh disabled");
    }

    let router = headline_hub::create_router(state).merge(metrics.router());

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    tracing::info!(addr = %cfg.bind_addr, "listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;
    Ok(())
}
