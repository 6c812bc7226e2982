//! # Aggregation service
//! Fans a headline request out to the configured providers, merges the results and keeps them
//! in a TTL cache with stale-while-revalidate reads.
//!
//! At most one upstream fetch is outstanding per cache key. Concurrent callers join the
//! pending [`Shared`] future; the fetch itself runs as a spawned task, so it completes even if
//! every waiter goes away, and its in-flight entry is removed by a drop guard whatever the
//! outcome.

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::TtlCache;
use crate::error::{NewsError, NewsResult};
use crate::ingest::types::{FetchRequest, NewsProvider};
use crate::model::{recency_order, NewsItem};

pub type Headlines = Arc<Vec<NewsItem>>;
type SharedFetch = Shared<BoxFuture<'static, NewsResult<Headlines>>>;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("headlines_cache_hits_total", "Fresh cache hits.");
        describe_counter!(
            "headlines_cache_stale_total",
            "Stale cache entries served while revalidating."
        );
        describe_counter!("headlines_cache_misses_total", "Cold cache misses.");
        describe_counter!("headlines_fetch_total", "Upstream fan-out fetches started.");
        describe_counter!(
            "headlines_fetch_joined_total",
            "Requests that joined an in-flight fetch."
        );
        describe_counter!(
            "headlines_provider_failures_total",
            "Provider slices dropped from a fetch (error or timeout)."
        );
        describe_counter!(
            "headlines_fetch_failures_total",
            "Fetches where every provider failed."
        );
    });
}

/// What a headline request asks for. Equal params share one cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlineParams {
    pub limit: usize,
    pub retention_days: u32,
    /// Provider/source ids; empty selects every provider.
    pub sources: Vec<String>,
}

impl HeadlineParams {
    pub fn cache_key(&self) -> String {
        let mut sources: Vec<&str> = self.sources.iter().map(String::as_str).collect();
        sources.sort_unstable();
        sources.dedup();
        let selector = if sources.is_empty() {
            "*".to_string()
        } else {
            sources.join(",")
        };
        format!(
            "headlines:{}:{}:{}",
            self.limit, self.retention_days, selector
        )
    }
}

/// Receives every merged batch from a successful upstream fetch.
#[async_trait::async_trait]
pub trait BatchSink: Send + Sync {
    async fn accept(&self, params: &HeadlineParams, items: &[NewsItem]) -> NewsResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    pub cache_ttl: Duration,
    /// Deadline for a single provider call.
    pub provider_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            provider_timeout: Duration::from_secs(12),
        }
    }
}

#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

struct Inner {
    providers: Vec<Arc<dyn NewsProvider>>,
    cache: Mutex<TtlCache<String, Headlines>>,
    in_flight: Mutex<HashMap<String, SharedFetch>>,
    config: AggregatorConfig,
    sink: Option<Arc<dyn BatchSink>>,
}

/// Removes the in-flight entry when the fetch task ends, including by panic.
struct InFlightGuard {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.inner.in_flight.lock() {
            map.remove(&self.key);
        }
    }
}

impl Aggregator {
    pub fn new(
        providers: Vec<Arc<dyn NewsProvider>>,
        config: AggregatorConfig,
        sink: Option<Arc<dyn BatchSink>>,
    ) -> Self {
        ensure_metrics_described();
        Self {
            inner: Arc::new(Inner {
                providers,
                cache: Mutex::new(TtlCache::new()),
                in_flight: Mutex::new(HashMap::new()),
                config,
                sink,
            }),
        }
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.inner
            .providers
            .iter()
            .map(|p| p.id().to_string())
            .collect()
    }

    /// Number of fetches currently outstanding.
    pub fn in_flight_len(&self) -> usize {
        self.inner.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Fresh entry → returned as is. Stale entry → returned at once, refresh started (or
    /// joined) in the background. No entry → wait for the fetch.
    pub async fn list_headlines(&self, params: &HeadlineParams) -> NewsResult<Headlines> {
        let key = params.cache_key();
        let cached = self
            .inner
            .cache
            .lock()
            .expect("headline cache poisoned")
            .get_with_stale(&key);

        match cached {
            Some((items, false)) => {
                counter!("headlines_cache_hits_total").increment(1);
                Ok(items)
            }
            Some((items, true)) => {
                counter!("headlines_cache_stale_total").increment(1);
                // the task is already spawned; the handle isn't needed
                drop(self.start_or_join(&key, params));
                Ok(items)
            }
            None => {
                counter!("headlines_cache_misses_total").increment(1);
                self.start_or_join(&key, params).await
            }
        }
    }

    /// `force = false` reads like [`Self::list_headlines`]. `force = true` always goes
    /// upstream, still coalesced with any fetch already running for the key.
    pub async fn refresh_headlines(
        &self,
        params: &HeadlineParams,
        force: bool,
    ) -> NewsResult<Headlines> {
        if !force {
            return self.list_headlines(params).await;
        }
        self.start_or_join(&params.cache_key(), params).await
    }

    fn start_or_join(&self, key: &str, params: &HeadlineParams) -> SharedFetch {
        let mut in_flight = self.inner.in_flight.lock().expect("in-flight map poisoned");
        if let Some(pending) = in_flight.get(key) {
            counter!("headlines_fetch_joined_total").increment(1);
            return pending.clone();
        }

        let inner = Arc::clone(&self.inner);
        let task_key = key.to_string();
        let params = params.clone();
        let handle = tokio::spawn(async move {
            let _guard = InFlightGuard {
                inner: Arc::clone(&inner),
                key: task_key.clone(),
            };
            let res = inner.fetch_and_merge(&task_key, &params).await;
            if let Err(e) = &res {
                tracing::warn!(target: "aggregator", key = %task_key, error = %e, "headline fetch failed");
            }
            res
        });

        let shared = handle
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    Err(NewsError::upstream(format!("fetch task aborted: {e}")))
                })
            })
            .boxed()
            .shared();
        in_flight.insert(key.to_string(), shared.clone());
        shared
    }
}

impl Inner {
    async fn fetch_and_merge(&self, key: &str, params: &HeadlineParams) -> NewsResult<Headlines> {
        counter!("headlines_fetch_total").increment(1);

        let wanted: HashSet<&str> = params.sources.iter().map(String::as_str).collect();
        let selected: Vec<&Arc<dyn NewsProvider>> = self
            .providers
            .iter()
            .filter(|p| wanted.is_empty() || wanted.contains(p.id()))
            .collect();

        let mut merged = Vec::new();
        if !selected.is_empty() && params.limit > 0 {
            let req = FetchRequest {
                limit: params.limit.div_ceil(selected.len()),
                retention_days: params.retention_days,
            };
            let timeout = self.config.provider_timeout;
            let results = join_all(selected.iter().map(|p| async move {
                match tokio::time::timeout(timeout, p.fetch_headlines(req)).await {
                    Ok(res) => res,
                    Err(_) => Err(NewsError::upstream(format!(
                        "{}: timed out after {}s",
                        p.id(),
                        timeout.as_secs_f32()
                    ))),
                }
            }))
            .await;

            let mut failures = 0usize;
            for (provider, res) in selected.iter().zip(results) {
                match res {
                    Ok(items) => merged.extend(items),
                    Err(e) => {
                        failures += 1;
                        counter!("headlines_provider_failures_total", "provider" => provider.id().to_string())
                            .increment(1);
                        tracing::warn!(target: "aggregator", provider = provider.id(), error = %e, "provider failed, treating as empty");
                    }
                }
            }
            if failures == selected.len() {
                counter!("headlines_fetch_failures_total").increment(1);
                return Err(NewsError::upstream(format!(
                    "all {failures} providers failed"
                )));
            }
        }

        merged.sort_by(recency_order);
        let mut seen = HashSet::new();
        merged.retain(|it| seen.insert(it.id.clone()));
        merged.truncate(params.limit);
        let items: Headlines = Arc::new(merged);

        self.cache
            .lock()
            .expect("headline cache poisoned")
            .set(key.to_string(), Arc::clone(&items), self.config.cache_ttl);
        tracing::debug!(target: "aggregator", %key, count = items.len(), "headlines cached");

        if let Some(sink) = &self.sink {
            sink.accept(params, &items).await?;
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn item(id: &str, source: &str, ts: &str) -> NewsItem {
        NewsItem {
            id: id.into(),
            title: format!("Story {id}"),
            summary: String::new(),
            url: None,
            source: source.into(),
            categories: vec!["News".into()],
            published_at: crate::model::parse_published(ts).unwrap(),
            image_url: None,
        }
    }

    struct Stub {
        id: String,
        items: Vec<NewsItem>,
        delay: Duration,
        fail: AtomicBool,
        calls: AtomicUsize,
        last_limit: AtomicUsize,
    }

    impl Stub {
        fn new(id: &str, items: Vec<NewsItem>) -> Arc<Self> {
            Self::slow(id, items, Duration::from_millis(20))
        }

        fn slow(id: &str, items: Vec<NewsItem>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                items,
                delay,
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                last_limit: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NewsProvider for Stub {
        async fn fetch_headlines(&self, req: FetchRequest) -> NewsResult<Vec<NewsItem>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_limit.store(req.limit, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(NewsError::upstream("boom"));
            }
            Ok(self.items.iter().take(req.limit).cloned().collect())
        }
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            &self.id
        }
    }

    #[derive(Default)]
    struct CountingSink {
        batches: AtomicUsize,
    }

    #[async_trait]
    impl BatchSink for CountingSink {
        async fn accept(&self, _params: &HeadlineParams, _items: &[NewsItem]) -> NewsResult<()> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn params(limit: usize) -> HeadlineParams {
        HeadlineParams {
            limit,
            retention_days: 3,
            sources: vec![],
        }
    }

    fn agg(providers: Vec<Arc<Stub>>, ttl: Duration) -> Aggregator {
        let providers = providers
            .into_iter()
            .map(|p| p as Arc<dyn NewsProvider>)
            .collect();
        Aggregator::new(
            providers,
            AggregatorConfig {
                cache_ttl: ttl,
                provider_timeout: Duration::from_secs(1),
            },
            None,
        )
    }

    #[test]
    fn cache_key_ignores_selector_order_and_duplicates() {
        let a = HeadlineParams {
            limit: 10,
            retention_days: 2,
            sources: vec!["b".into(), "a".into(), "b".into()],
        };
        let b = HeadlineParams {
            limit: 10,
            retention_days: 2,
            sources: vec!["a".into(), "b".into()],
        };
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(params(10).cache_key(), "headlines:10:3:*");
        assert_ne!(params(10).cache_key(), params(11).cache_key());
    }

    #[tokio::test]
    async fn concurrent_forced_refreshes_share_one_fetch() {
        let p1 = Stub::new("one", vec![item("a", "one", "2024-01-02T00:00:00Z")]);
        let p2 = Stub::new("two", vec![item("b", "two", "2024-01-03T00:00:00Z")]);
        let sink = Arc::new(CountingSink::default());
        let agg = Aggregator::new(
            vec![p1.clone(), p2.clone()],
            AggregatorConfig::default(),
            Some(sink.clone()),
        );

        let p = params(10);
        let results = join_all((0..8).map(|_| agg.refresh_headlines(&p, true))).await;

        assert_eq!(p1.calls(), 1);
        assert_eq!(p2.calls(), 1);
        assert_eq!(sink.batches.load(Ordering::SeqCst), 1);
        let first = results[0].as_ref().unwrap();
        for r in &results {
            assert!(Arc::ptr_eq(first, r.as_ref().unwrap()));
        }
        assert_eq!(agg.in_flight_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_is_served_and_refreshed_once() {
        let p = Stub::new("one", vec![item("a", "one", "2024-01-02T00:00:00Z")]);
        let agg = agg(vec![p.clone()], Duration::from_secs(60));
        let params = params(5);

        let primed = agg.list_headlines(&params).await.unwrap();
        assert_eq!(p.calls(), 1);

        // fresh: no upstream call
        let again = agg.list_headlines(&params).await.unwrap();
        assert!(Arc::ptr_eq(&primed, &again));
        assert_eq!(p.calls(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..5 {
            let served = agg.list_headlines(&params).await.unwrap();
            assert!(Arc::ptr_eq(&primed, &served), "stale value served at once");
        }
        assert_eq!(agg.in_flight_len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(p.calls(), 2, "exactly one background refresh");
        assert_eq!(agg.in_flight_len(), 0);

        let refreshed = agg.list_headlines(&params).await.unwrap();
        assert!(!Arc::ptr_eq(&primed, &refreshed));
        assert_eq!(p.calls(), 2);
    }

    #[tokio::test]
    async fn merges_sorted_newest_first_and_truncates() {
        let p1 = Stub::new(
            "one",
            vec![
                item("a1", "one", "2024-01-05T00:00:00Z"),
                item("a2", "one", "2024-01-01T00:00:00Z"),
            ],
        );
        let p2 = Stub::new(
            "two",
            vec![
                item("b1", "two", "2024-01-04T00:00:00Z"),
                item("b2", "two", "2024-01-03T00:00:00Z"),
            ],
        );
        let agg = agg(vec![p1.clone(), p2.clone()], Duration::from_secs(60));

        let out = agg.refresh_headlines(&params(3), true).await.unwrap();
        let ids: Vec<_> = out.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "b1", "b2"]);
        // ceil(3 / 2)
        assert_eq!(p1.last_limit.load(Ordering::SeqCst), 2);
        assert_eq!(p2.last_limit.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn source_selector_limits_fan_out() {
        let p1 = Stub::new("one", vec![item("a", "one", "2024-01-05T00:00:00Z")]);
        let p2 = Stub::new("two", vec![item("b", "two", "2024-01-04T00:00:00Z")]);
        let agg = agg(vec![p1.clone(), p2.clone()], Duration::from_secs(60));

        let only_two = HeadlineParams {
            limit: 4,
            retention_days: 3,
            sources: vec!["two".into()],
        };
        let out = agg.refresh_headlines(&only_two, true).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(p1.calls(), 0);
        assert_eq!(p2.last_limit.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn one_failing_provider_contributes_nothing() {
        let good = Stub::new("good", vec![item("g", "good", "2024-01-05T00:00:00Z")]);
        let bad = Stub::new("bad", vec![item("x", "bad", "2024-01-06T00:00:00Z")]);
        bad.fail.store(true, Ordering::SeqCst);
        let agg = agg(vec![good, bad], Duration::from_secs(60));

        let out = agg.refresh_headlines(&params(10), true).await.unwrap();
        let ids: Vec<_> = out.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["g"]);
    }

    #[tokio::test(start_paused = true)]
    async fn all_failing_rejects_but_stale_value_keeps_serving() {
        let p = Stub::new("one", vec![item("a", "one", "2024-01-02T00:00:00Z")]);
        let agg = agg(vec![p.clone()], Duration::from_secs(60));
        let params = params(5);

        let primed = agg.list_headlines(&params).await.unwrap();
        p.fail.store(true, Ordering::SeqCst);

        let err = agg.refresh_headlines(&params, true).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UpstreamUnavailable);
        assert_eq!(agg.in_flight_len(), 0, "entry removed after failure");

        tokio::time::advance(Duration::from_secs(61)).await;
        let served = agg.list_headlines(&params).await.unwrap();
        assert!(Arc::ptr_eq(&primed, &served));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // failed background refresh leaves the stale value in place
        let still = agg.list_headlines(&params).await.unwrap();
        assert!(Arc::ptr_eq(&primed, &still));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(p.calls(), 4);
        assert_eq!(agg.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn cold_failure_surfaces_to_caller() {
        let p = Stub::new("one", vec![]);
        p.fail.store(true, Ordering::SeqCst);
        let agg = agg(vec![p.clone()], Duration::from_secs(60));

        assert!(agg.list_headlines(&params(5)).await.is_err());
        assert!(agg.list_headlines(&params(5)).await.is_err());
        assert_eq!(p.calls(), 2, "failed fetch isn't cached or left in flight");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_provider_times_out() {
        let fast = Stub::new("fast", vec![item("f", "fast", "2024-01-05T00:00:00Z")]);
        let hung = Stub::slow(
            "hung",
            vec![item("h", "hung", "2024-01-06T00:00:00Z")],
            Duration::from_secs(3600),
        );
        let agg = agg(vec![fast, hung], Duration::from_secs(60));

        let out = agg.refresh_headlines(&params(10), true).await.unwrap();
        let ids: Vec<_> = out.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["f"]);
    }

    #[tokio::test]
    async fn no_matching_providers_yields_empty() {
        let p = Stub::new("one", vec![item("a", "one", "2024-01-02T00:00:00Z")]);
        let agg = agg(vec![p.clone()], Duration::from_secs(60));
        let none = HeadlineParams {
            limit: 5,
            retention_days: 3,
            sources: vec!["nope".into()],
        };
        assert!(agg.list_headlines(&none).await.unwrap().is_empty());
        assert_eq!(p.calls(), 0);
    }
}
