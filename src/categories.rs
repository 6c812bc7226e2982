//! # Category index
//! Per-source category sets, merged incrementally from each refresh batch.
//!
//! - Sets only grow: a merge is a case-insensitive union with what is stored.
//! - Stored lists are deduplicated and sorted alphabetically (case-insensitive).
//! - Only sources whose merged set changed are written back.
//! - A merge is atomic per source: concurrent batches for the same source never drop each
//!   other's categories.
//! - Redis values are JSON arrays, but older writers double-encoded them as a JSON string
//!   holding an array; the read path unwraps one such level.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::AsyncCommands;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::backend::{Backend, RedisBackend};
use crate::error::{NewsError, NewsResult};
use crate::model::NewsItem;

/// Storage behind the index. `read` returns only the sources that have a stored entry.
#[async_trait]
pub trait CategoryBackend: Send + Sync {
    async fn read(&self, sources: &[String]) -> NewsResult<HashMap<String, Vec<String>>>;
    async fn read_all(&self) -> NewsResult<HashMap<String, Vec<String>>>;
    /// Union each source's `incoming` list into its stored set with [`merge_sorted`].
    /// Read, merge and write happen atomically per source. Returns the number of sources
    /// whose stored set changed.
    async fn merge(&self, incoming: &BTreeMap<String, Vec<String>>) -> NewsResult<usize>;
}

pub struct CategoryIndex {
    backend: Arc<dyn CategoryBackend>,
}

impl CategoryIndex {
    pub fn new(backend: Arc<dyn CategoryBackend>) -> Self {
        Self { backend }
    }

    pub fn build(backend: &Backend) -> Self {
        match backend {
            Backend::Redis(r) => Self::new(Arc::new(RedisCategories::new(r.clone()))),
            Backend::Local => Self::new(Arc::new(LocalCategories::default())),
        }
    }

    /// Merge the batch's categories into the stored per-source sets.
    /// Returns the number of sources written.
    pub async fn update_from_items(&self, items: &[NewsItem]) -> NewsResult<usize> {
        let mut incoming: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for item in items {
            incoming
                .entry(item.source_key())
                .or_default()
                .extend(item.categories.iter().cloned());
        }
        incoming.retain(|k, _| !k.is_empty());
        if incoming.is_empty() {
            return Ok(0);
        }

        let changed = self.backend.merge(&incoming).await?;
        if changed > 0 {
            tracing::debug!(target: "categories", sources = changed, "category index updated");
        }
        Ok(changed)
    }

    /// Union of the stored sets for `sources` (every source when empty).
    pub async fn categories(&self, sources: &[String]) -> NewsResult<Vec<String>> {
        let stored = if sources.is_empty() {
            self.backend.read_all().await?
        } else {
            self.backend.read(sources).await?
        };
        let mut acc = Vec::new();
        for cats in stored.values() {
            acc = merge_sorted(&acc, cats);
        }
        Ok(acc)
    }

    pub async fn for_source(&self, source: &str) -> NewsResult<Vec<String>> {
        let mut stored = self.backend.read(&[source.to_string()]).await?;
        Ok(stored.remove(source).unwrap_or_default())
    }
}

/// Case-insensitive union. Spelling already in `stored` wins; new entries keep their
/// first-seen spelling. Output sorted by lowercase then original.
pub fn merge_sorted(stored: &[String], incoming: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(stored.len() + incoming.len());
    for c in stored.iter().chain(incoming) {
        let t = c.trim();
        if t.is_empty() {
            continue;
        }
        if seen.insert(t.to_lowercase()) {
            out.push(t.to_string());
        }
    }
    out.sort_by(|a, b| {
        a.to_lowercase()
            .cmp(&b.to_lowercase())
            .then_with(|| a.cmp(b))
    });
    out
}

/// A raw backend value, classified before use.
#[derive(Debug, PartialEq, Eq)]
enum StoredCategories {
    Array(Vec<String>),
    /// A JSON string whose content is itself JSON.
    Encoded(String),
    Unreadable,
}

impl StoredCategories {
    fn classify(raw: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Array(values)) => StoredCategories::Array(
                values
                    .into_iter()
                    .filter_map(|v| match v {
                        serde_json::Value::String(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
            ),
            Ok(serde_json::Value::String(inner)) => StoredCategories::Encoded(inner),
            _ => StoredCategories::Unreadable,
        }
    }
}

/// raw → array, or raw → string → array, else empty.
pub fn decode_categories(raw: &str) -> Vec<String> {
    match StoredCategories::classify(raw) {
        StoredCategories::Array(v) => v,
        StoredCategories::Encoded(inner) => match StoredCategories::classify(&inner) {
            StoredCategories::Array(v) => v,
            _ => Vec::new(),
        },
        StoredCategories::Unreadable => Vec::new(),
    }
}

/// Process-local map.
#[derive(Debug, Default)]
pub struct LocalCategories {
    inner: RwLock<HashMap<String, Vec<String>>>,
}

#[async_trait]
impl CategoryBackend for LocalCategories {
    async fn read(&self, sources: &[String]) -> NewsResult<HashMap<String, Vec<String>>> {
        let map = self.inner.read().expect("category lock poisoned");
        Ok(sources
            .iter()
            .filter_map(|s| map.get(s).map(|v| (s.clone(), v.clone())))
            .collect())
    }

    async fn read_all(&self) -> NewsResult<HashMap<String, Vec<String>>> {
        Ok(self.inner.read().expect("category lock poisoned").clone())
    }

    async fn merge(&self, incoming: &BTreeMap<String, Vec<String>>) -> NewsResult<usize> {
        let mut map = self.inner.write().expect("category lock poisoned");
        let mut changed = 0;
        for (source, cats) in incoming {
            let stored = map.get(source).map(Vec::as_slice).unwrap_or_default();
            let merged = merge_sorted(stored, cats);
            if merged != stored {
                map.insert(source.clone(), merged);
                changed += 1;
            }
        }
        Ok(changed)
    }
}

/// Compare-and-set on one hash field. ARGV: field, expected-present flag, expected raw
/// value, new value. Returns 1 when written, 0 when the field moved underneath us.
static SWAP_FIELD: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if ARGV[2] == '1' then
  if current ~= ARGV[3] then return 0 end
elseif current then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
return 1
"#,
    )
});

/// Swap attempts per source before giving up on a contended merge.
const MAX_SWAP_ATTEMPTS: usize = 16;

/// Hash `{prefix}:categories`, field = source id, value = JSON array.
#[derive(Debug, Clone)]
pub struct RedisCategories {
    backend: RedisBackend,
    key: String,
}

impl RedisCategories {
    pub fn new(backend: RedisBackend) -> Self {
        Self {
            key: backend.key("categories"),
            backend,
        }
    }
}

#[async_trait]
impl CategoryBackend for RedisCategories {
    async fn read(&self, sources: &[String]) -> NewsResult<HashMap<String, Vec<String>>> {
        if sources.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.backend.conn();
        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.key)
            .arg(sources)
            .query_async(&mut conn)
            .await?;
        Ok(sources
            .iter()
            .zip(raw)
            .filter_map(|(s, v)| v.map(|v| (s.clone(), decode_categories(&v))))
            .collect())
    }

    async fn read_all(&self) -> NewsResult<HashMap<String, Vec<String>>> {
        let mut conn = self.backend.conn();
        let raw: HashMap<String, String> = conn.hgetall(&self.key).await?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| {
                let cats = decode_categories(&v);
                (k, cats)
            })
            .collect())
    }

    async fn merge(&self, incoming: &BTreeMap<String, Vec<String>>) -> NewsResult<usize> {
        let mut conn = self.backend.conn();
        let mut changed = 0;
        for (source, cats) in incoming {
            let mut attempts = 0;
            loop {
                let raw: Option<String> = conn.hget(&self.key, source).await?;
                let stored = raw.as_deref().map(decode_categories).unwrap_or_default();
                let merged = merge_sorted(&stored, cats);
                if merged == stored {
                    break;
                }
                let json = serde_json::to_string(&merged)
                    .map_err(|e| NewsError::backend(format!("encoding categories: {e}")))?;
                let swapped: i64 = SWAP_FIELD
                    .key(&self.key)
                    .arg(source)
                    .arg(if raw.is_some() { "1" } else { "0" })
                    .arg(raw.as_deref().unwrap_or_default())
                    .arg(json)
                    .invoke_async(&mut conn)
                    .await?;
                if swapped == 1 {
                    changed += 1;
                    break;
                }
                attempts += 1;
                if attempts >= MAX_SWAP_ATTEMPTS {
                    return Err(NewsError::backend(format!(
                        "category merge for {source} kept conflicting"
                    )));
                }
                tracing::debug!(target: "categories", %source, attempts, "category merge retry");
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(source: &str, cats: &[&str]) -> NewsItem {
        NewsItem {
            id: format!("{source}-{}", cats.join("-")),
            title: "t".into(),
            summary: String::new(),
            url: None,
            source: source.into(),
            categories: cats.iter().map(|c| c.to_string()).collect(),
            published_at: chrono::Utc::now(),
            image_url: None,
        }
    }

    #[test]
    fn decodes_plain_and_double_encoded_arrays() {
        assert_eq!(decode_categories(r#"["A","b"]"#), vec!["A", "b"]);
        assert_eq!(decode_categories(r#""[\"A\",\"b\"]""#), vec!["A", "b"]);
        // only one extra level is unwrapped
        assert!(decode_categories(r#""\"[\\\"A\\\"]\"""#).is_empty());
        assert!(decode_categories("not json").is_empty());
        assert!(decode_categories(r#"{"a":1}"#).is_empty());
        assert!(decode_categories(r#""plain string""#).is_empty());
    }

    #[test]
    fn merge_is_case_insensitive_union_sorted() {
        let stored = vec!["Markets".to_string(), "tech".to_string()];
        let incoming = vec!["Tech".to_string(), "ai".to_string(), "MARKETS".to_string()];
        assert_eq!(merge_sorted(&stored, &incoming), vec!["ai", "Markets", "tech"]);
    }

    #[tokio::test]
    async fn categories_never_disappear_across_batches() {
        let idx = CategoryIndex::new(Arc::new(LocalCategories::default()));
        idx.update_from_items(&[item("Tech Wire", &["AI", "Chips"])])
            .await
            .unwrap();
        idx.update_from_items(&[item("Tech Wire", &["ai", "Cloud"])])
            .await
            .unwrap();
        idx.update_from_items(&[item("Tech Wire", &["News"])])
            .await
            .unwrap();

        assert_eq!(
            idx.for_source("tech-wire").await.unwrap(),
            vec!["AI", "Chips", "Cloud", "News"]
        );
    }

    #[tokio::test]
    async fn unchanged_sets_are_not_written() {
        let idx = CategoryIndex::new(Arc::new(LocalCategories::default()));

        let batch = vec![item("World Desk", &["Politics"]), item("Tech Wire", &["AI"])];
        assert_eq!(idx.update_from_items(&batch).await.unwrap(), 2);

        // steady state: same categories, different casing
        let again = vec![item("World Desk", &["politics"]), item("Tech Wire", &["ai"])];
        assert_eq!(idx.update_from_items(&again).await.unwrap(), 0);
        assert_eq!(idx.for_source("world-desk").await.unwrap(), vec!["Politics"]);

        // only the changed source is written
        let one_new = vec![item("World Desk", &["Europe"]), item("Tech Wire", &["AI"])];
        assert_eq!(idx.update_from_items(&one_new).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn union_across_selected_sources() {
        let idx = CategoryIndex::new(Arc::new(LocalCategories::default()));
        idx.update_from_items(&[
            item("World Desk", &["Politics", "Europe"]),
            item("Tech Wire", &["AI", "politics"]),
        ])
        .await
        .unwrap();

        assert_eq!(
            idx.categories(&[]).await.unwrap().len(),
            3,
            "Politics and politics collapse"
        );
        assert_eq!(
            idx.categories(&["tech-wire".to_string()]).await.unwrap(),
            vec!["AI", "politics"]
        );
        assert!(idx
            .categories(&["unknown".to_string()])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_batches_for_one_source_keep_every_category() {
        let idx = Arc::new(CategoryIndex::new(Arc::new(LocalCategories::default())));
        let tasks: Vec<_> = (0..400)
            .map(|n| {
                let idx = idx.clone();
                tokio::spawn(async move {
                    let cat = format!("topic-{n:03}");
                    idx.update_from_items(&[item("Wire", &[cat.as_str()])]).await
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let stored = idx.for_source("wire").await.unwrap();
        assert_eq!(stored.len(), 400);
        assert_eq!(stored.first().map(String::as_str), Some("topic-000"));
        assert_eq!(stored.last().map(String::as_str), Some("topic-399"));
    }
}
