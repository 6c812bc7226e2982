//! In-process store: a single list kept in recency order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::RwLock;

use crate::error::NewsResult;
use crate::model::{index_order, NewsItem};
use crate::store::ItemStore;

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Sorted by [`index_order`]; at most one entry per id.
    items: Vec<NewsItem>,
    last_refresh: Option<DateTime<Utc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn put_many(&self, items: &[NewsItem]) -> NewsResult<()> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        for item in items {
            inner.items.retain(|existing| existing.id != item.id);
            let at = inner
                .items
                .partition_point(|existing| index_order(existing, item).is_lt());
            inner.items.insert(at, item.clone());
        }
        Ok(())
    }

    async fn get_page(&self, limit: usize, offset: usize) -> NewsResult<Vec<NewsItem>> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.items.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn get_by_id(&self, id: &str) -> NewsResult<Option<NewsItem>> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.items.iter().find(|i| i.id == id).cloned())
    }

    async fn count(&self) -> NewsResult<usize> {
        Ok(self.inner.read().expect("store lock poisoned").items.len())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> NewsResult<usize> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let before = inner.items.len();
        inner.items.retain(|i| i.published_at >= cutoff);
        Ok(before - inner.items.len())
    }

    async fn record_refresh(&self, at: DateTime<Utc>) -> NewsResult<()> {
        self.inner.write().expect("store lock poisoned").last_refresh = Some(at);
        Ok(())
    }

    async fn last_refresh(&self) -> NewsResult<Option<DateTime<Utc>>> {
        Ok(self.inner.read().expect("store lock poisoned").last_refresh)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
