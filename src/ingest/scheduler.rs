// src/ingest/scheduler.rs
use metrics::counter;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::service::{NewsService, RefreshRequest};

#[derive(Clone, Copy, Debug)]
pub struct RefreshSchedulerCfg {
    pub interval: Duration,
}

/// Spawn the periodic forced refresh with default parameters. The first run happens
/// immediately so a fresh process has data before its first read.
pub fn spawn_refresh_scheduler(service: NewsService, cfg: RefreshSchedulerCfg) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            counter!("refresh_runs_total").increment(1);

            let req = RefreshRequest {
                force: true,
                ..Default::default()
            };
            match service.refresh(&req).await {
                Ok(out) => {
                    tracing::info!(target: "scheduler", count = out.count, "scheduled refresh tick");
                }
                Err(e) => {
                    counter!("refresh_failures_total").increment(1);
                    tracing::warn!(target: "scheduler", error = %e, kind = e.kind().as_str(), "scheduled refresh failed");
                }
            }
        }
    })
}
