//! Read/refresh facade used by the HTTP layer and the scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{describe_gauge, gauge};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::Arc;

use crate::aggregator::{Aggregator, AggregatorConfig, BatchSink, HeadlineParams, Headlines};
use crate::categories::CategoryIndex;
use crate::error::{NewsError, NewsResult};
use crate::ingest::retention_cutoff;
use crate::ingest::types::NewsProvider;
use crate::model::{source_key, NewsItem};
use crate::store::{scan_filtered, ItemFilter, ItemStore, Page, ScanLimits};

pub const MAX_PAGE_LIMIT: usize = 200;
pub const MAX_RETENTION_DAYS: u32 = 30;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_gauge!("store_items", "Items held by the item store after the last refresh.");
        describe_gauge!(
            "refresh_last_run_ts",
            "Unix seconds of the last persisted refresh."
        );
    });
}

/// Writes each fetched batch through to the store and the category index.
pub struct Persistence {
    store: Arc<dyn ItemStore>,
    categories: Arc<CategoryIndex>,
}

impl Persistence {
    pub fn new(store: Arc<dyn ItemStore>, categories: Arc<CategoryIndex>) -> Self {
        Self { store, categories }
    }
}

#[async_trait]
impl BatchSink for Persistence {
    async fn accept(&self, params: &HeadlineParams, items: &[NewsItem]) -> NewsResult<()> {
        let now = Utc::now();
        self.store.put_many(items).await?;
        self.categories.update_from_items(items).await?;
        let pruned = self
            .store
            .prune_older_than(retention_cutoff(now, params.retention_days))
            .await?;
        self.store.record_refresh(now).await?;

        let total = self.store.count().await?;
        gauge!("store_items").set(total as f64);
        gauge!("refresh_last_run_ts").set(now.timestamp() as f64);
        tracing::info!(
            target: "store",
            written = items.len(),
            pruned,
            total,
            backend = self.store.backend_name(),
            "batch persisted"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    pub default_limit: usize,
    pub default_retention_days: u32,
    pub scan: ScanLimits,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_limit: 50,
            default_retention_days: 3,
            scan: ScanLimits::default(),
        }
    }
}

/// `listPage` arguments. Sources may be display names or ids; they are keyed before matching.
#[derive(Debug, Clone, Default)]
pub struct PageQuery {
    pub sources: Vec<String>,
    pub category: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshRequest {
    pub sources: Vec<String>,
    pub limit: Option<usize>,
    pub retention_days: Option<u32>,
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOutcome {
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub items: usize,
    pub backend: &'static str,
    pub providers: Vec<String>,
}

#[derive(Clone)]
pub struct NewsService {
    aggregator: Aggregator,
    store: Arc<dyn ItemStore>,
    categories: Arc<CategoryIndex>,
    config: ServiceConfig,
}

impl NewsService {
    pub fn new(
        providers: Vec<Arc<dyn NewsProvider>>,
        store: Arc<dyn ItemStore>,
        categories: Arc<CategoryIndex>,
        aggregator: AggregatorConfig,
        config: ServiceConfig,
    ) -> Self {
        ensure_metrics_described();
        let sink: Arc<dyn BatchSink> = Arc::new(Persistence::new(
            Arc::clone(&store),
            Arc::clone(&categories),
        ));
        Self {
            aggregator: Aggregator::new(providers, aggregator, Some(sink)),
            store,
            categories,
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub async fn list_page(&self, q: &PageQuery) -> NewsResult<Page> {
        let limit = self.check_limit(q.limit)?;
        let filter = ItemFilter {
            sources: source_keys(&q.sources),
            category: q
                .category
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        };
        scan_filtered(
            self.store.as_ref(),
            &filter,
            limit,
            q.offset,
            self.config.scan,
        )
        .await
    }

    pub async fn status(&self) -> NewsResult<Status> {
        Ok(Status {
            last_refresh_at: self.store.last_refresh().await?,
            items: self.store.count().await?,
            backend: self.store.backend_name(),
            providers: self.aggregator.provider_ids(),
        })
    }

    pub async fn refresh(&self, req: &RefreshRequest) -> NewsResult<RefreshOutcome> {
        let params = self.params(&req.sources, req.limit, req.retention_days)?;
        let items = self.aggregator.refresh_headlines(&params, req.force).await?;
        tracing::info!(
            target: "aggregator",
            count = items.len(),
            force = req.force,
            "refresh finished"
        );
        Ok(RefreshOutcome { count: items.len() })
    }

    pub async fn categories(&self, sources: &[String]) -> NewsResult<Vec<String>> {
        self.categories.categories(&source_keys(sources)).await
    }

    /// Cached merged headlines, stale-while-revalidate.
    pub async fn headlines(
        &self,
        sources: &[String],
        limit: Option<usize>,
        retention_days: Option<u32>,
    ) -> NewsResult<Headlines> {
        let params = self.params(sources, limit, retention_days)?;
        self.aggregator.list_headlines(&params).await
    }

    pub fn params(
        &self,
        sources: &[String],
        limit: Option<usize>,
        retention_days: Option<u32>,
    ) -> NewsResult<HeadlineParams> {
        let retention_days = retention_days.unwrap_or(self.config.default_retention_days);
        if retention_days == 0 || retention_days > MAX_RETENTION_DAYS {
            return Err(NewsError::Validation(format!(
                "retentionDays must be between 1 and {MAX_RETENTION_DAYS}"
            )));
        }
        Ok(HeadlineParams {
            limit: self.check_limit(limit)?,
            retention_days,
            sources: source_keys(sources),
        })
    }

    fn check_limit(&self, limit: Option<usize>) -> NewsResult<usize> {
        let limit = limit.unwrap_or(self.config.default_limit);
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(NewsError::Validation(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }
        Ok(limit)
    }
}

fn source_keys(sources: &[String]) -> Vec<String> {
    let mut out: Vec<String> = sources
        .iter()
        .map(|s| source_key(s))
        .filter(|s| !s.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}
