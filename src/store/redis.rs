//! Redis store: sorted set `{prefix}:index` (score = publishedAt ms, member = id) plus hash
//! `{prefix}:items` (id → JSON body). Refresh metadata lives in `{prefix}:meta`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;

use crate::backend::RedisBackend;
use crate::error::NewsResult;
use crate::model::NewsItem;
use crate::store::{ItemStore, PRUNE_CHUNK};

const META_LAST_REFRESH: &str = "lastRefreshAt";

#[derive(Debug, Clone)]
pub struct RedisStore {
    backend: RedisBackend,
    index_key: String,
    items_key: String,
    meta_key: String,
}

impl RedisStore {
    pub fn new(backend: RedisBackend) -> Self {
        Self {
            index_key: backend.key("index"),
            items_key: backend.key("items"),
            meta_key: backend.key("meta"),
            backend,
        }
    }

    async fn load_bodies(&self, ids: &[String]) -> NewsResult<Vec<NewsItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.backend.conn();
        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.items_key)
            .arg(ids)
            .query_async(&mut conn)
            .await?;
        let mut out = Vec::with_capacity(raw.len());
        for (id, body) in ids.iter().zip(raw) {
            match body.as_deref().and_then(NewsItem::from_stored) {
                Some(item) => out.push(item),
                None => tracing::debug!(target: "store", %id, "skipping missing or invalid body"),
            }
        }
        Ok(out)
    }
}

/// Inclusive `ZREVRANGE` indices for `[offset, offset + limit)`. `None` when the window
/// starts past anything a sorted set can hold; negative indices would read from the tail.
fn page_bounds(limit: usize, offset: usize) -> Option<(isize, isize)> {
    let start = isize::try_from(offset).ok()?;
    let stop = offset
        .checked_add(limit.checked_sub(1)?)
        .and_then(|s| isize::try_from(s).ok())
        .unwrap_or(isize::MAX);
    Some((start, stop))
}

#[async_trait]
impl ItemStore for RedisStore {
    async fn put_many(&self, items: &[NewsItem]) -> NewsResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut zadd = redis::cmd("ZADD");
        zadd.arg(&self.index_key);
        let mut hset = redis::cmd("HSET");
        hset.arg(&self.items_key);
        for item in items {
            let body = serde_json::to_string(item)
                .map_err(|e| crate::error::NewsError::backend(format!("encoding item: {e}")))?;
            zadd.arg(item.score()).arg(&item.id);
            hset.arg(&item.id).arg(body);
        }

        let mut conn = self.backend.conn();
        redis::pipe()
            .atomic()
            .add_command(zadd)
            .ignore()
            .add_command(hset)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        tracing::debug!(target: "store", count = items.len(), "items upserted");
        Ok(())
    }

    async fn get_page(&self, limit: usize, offset: usize) -> NewsResult<Vec<NewsItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let Some((start, stop)) = page_bounds(limit, offset) else {
            return Ok(Vec::new());
        };
        let mut conn = self.backend.conn();
        let ids: Vec<String> = conn.zrevrange(&self.index_key, start, stop).await?;
        self.load_bodies(&ids).await
    }

    async fn get_by_id(&self, id: &str) -> NewsResult<Option<NewsItem>> {
        let mut conn = self.backend.conn();
        let raw: Option<String> = conn.hget(&self.items_key, id).await?;
        Ok(raw.as_deref().and_then(NewsItem::from_stored))
    }

    async fn count(&self) -> NewsResult<usize> {
        let mut conn = self.backend.conn();
        Ok(conn.zcard(&self.index_key).await?)
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> NewsResult<usize> {
        let mut conn = self.backend.conn();
        // exclusive upper bound: publishedAt < cutoff
        let max = format!("({}", cutoff.timestamp_millis());
        let ids: Vec<String> = conn.zrangebyscore(&self.index_key, "-inf", max).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        for chunk in ids.chunks(PRUNE_CHUNK) {
            redis::pipe()
                .atomic()
                .cmd("ZREM")
                .arg(&self.index_key)
                .arg(chunk)
                .ignore()
                .cmd("HDEL")
                .arg(&self.items_key)
                .arg(chunk)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        tracing::info!(target: "store", removed = ids.len(), %cutoff, "pruned old items");
        Ok(ids.len())
    }

    async fn record_refresh(&self, at: DateTime<Utc>) -> NewsResult<()> {
        let mut conn = self.backend.conn();
        conn.hset::<_, _, _, ()>(&self.meta_key, META_LAST_REFRESH, at.to_rfc3339())
            .await?;
        Ok(())
    }

    async fn last_refresh(&self) -> NewsResult<Option<DateTime<Utc>>> {
        let mut conn = self.backend.conn();
        let raw: Option<String> = conn.hget(&self.meta_key, META_LAST_REFRESH).await?;
        Ok(raw.as_deref().and_then(crate::model::parse_published))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
