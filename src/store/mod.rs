//! # Item store
//! Recency-ordered, id-addressable persistence of [`NewsItem`]s.
//!
//! Two backends share [`ItemStore`]: [`memory::MemoryStore`] (one sorted list) and
//! [`redis::RedisStore`] (score-ordered id index + id → body hash). The choice is made once by
//! [`build_store`]; a failing backend call is surfaced, never swapped for the other backend.
//!
//! Filtering is not a store concern. [`scan_filtered`] walks the unfiltered recency order in
//! bounded chunks and filters client-side.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::backend::Backend;
use crate::error::NewsResult;
use crate::model::NewsItem;

/// Maximum ids removed per backend round trip while pruning.
pub const PRUNE_CHUNK: usize = 500;

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Upsert by id (full replace), one backend round trip per batch.
    async fn put_many(&self, items: &[NewsItem]) -> NewsResult<()>;
    /// `[offset, offset + limit)` of the whole set, newest first.
    async fn get_page(&self, limit: usize, offset: usize) -> NewsResult<Vec<NewsItem>>;
    /// `None` when missing or when the stored body fails validation.
    async fn get_by_id(&self, id: &str) -> NewsResult<Option<NewsItem>>;
    async fn count(&self) -> NewsResult<usize>;
    /// Remove everything published strictly before `cutoff`. Returns the number removed.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> NewsResult<usize>;
    async fn record_refresh(&self, at: DateTime<Utc>) -> NewsResult<()>;
    async fn last_refresh(&self) -> NewsResult<Option<DateTime<Utc>>>;
    fn backend_name(&self) -> &'static str;
}

pub fn build_store(backend: &Backend) -> Arc<dyn ItemStore> {
    match backend {
        Backend::Redis(r) => Arc::new(redis::RedisStore::new(r.clone())),
        Backend::Local => Arc::new(memory::MemoryStore::new()),
    }
}

/// Bounds for the scan-and-filter read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanLimits {
    pub chunk_size: usize,
    pub max_chunks: usize,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            max_chunks: 10,
        }
    }
}

/// Client-side filter over the recency order. Empty `sources` matches every source.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    /// Source ids (see [`crate::model::source_key`]).
    pub sources: Vec<String>,
    pub category: Option<String>,
}

impl ItemFilter {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.category.is_none()
    }

    pub fn matches(&self, item: &NewsItem) -> bool {
        if !self.sources.is_empty() {
            let key = item.source_key();
            if !self.sources.iter().any(|s| *s == key) {
                return false;
            }
        }
        match &self.category {
            Some(c) => item.categories.iter().any(|ic| ic.eq_ignore_ascii_case(c)),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<NewsItem>,
    /// The chunk ceiling stopped the scan before `limit` matches; more may exist further back.
    pub scan_limited: bool,
}

/// Page through the store applying `filter`; `offset`/`limit` count filtered matches.
/// Returns a partial page (flagged) when the chunk ceiling is reached first.
pub async fn scan_filtered(
    store: &dyn ItemStore,
    filter: &ItemFilter,
    limit: usize,
    offset: usize,
    limits: ScanLimits,
) -> NewsResult<Page> {
    if filter.is_empty() {
        return Ok(Page {
            items: store.get_page(limit, offset).await?,
            scan_limited: false,
        });
    }
    if limit == 0 {
        return Ok(Page::default());
    }

    let chunk = limits.chunk_size.max(1);
    let mut skipped = 0usize;
    let mut out = Vec::with_capacity(limit);
    for n in 0..limits.max_chunks {
        let batch = store.get_page(chunk, n * chunk).await?;
        let exhausted = batch.len() < chunk;
        for item in batch {
            if !filter.matches(&item) {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            out.push(item);
            if out.len() == limit {
                return Ok(Page {
                    items: out,
                    scan_limited: false,
                });
            }
        }
        if exhausted {
            return Ok(Page {
                items: out,
                scan_limited: false,
            });
        }
    }
    tracing::debug!(
        target: "store",
        found = out.len(),
        limit,
        max_chunks = limits.max_chunks,
        "filtered scan hit chunk ceiling"
    );
    Ok(Page {
        items: out,
        scan_limited: true,
    })
}
