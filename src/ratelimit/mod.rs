//! # Request rate limiter
//! Fixed-window counting per `(profile, client, bucket)` with `bucket = floor(now / window)`.
//!
//! Counters live in Redis (`INCR` + `EXPIRE`) when configured, otherwise in a local map that
//! a background task sweeps. Any limiter-internal error fails open; see [`middleware`].

pub mod memory;
pub mod middleware;
pub mod redis;

use async_trait::async_trait;
use metrics::describe_counter;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::error::NewsResult;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ratelimit_rejected_total", "Requests rejected with 429, by profile.");
        describe_counter!(
            "ratelimit_fail_open_total",
            "Requests let through because the limiter itself failed."
        );
    });
}

/// Route groups with independently configured ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    /// General browsing endpoints.
    Read,
    /// The expensive AI summary endpoint.
    Summary,
    /// Refresh and diagnostics.
    Admin,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Read => "read",
            Profile::Summary => "summary",
            Profile::Admin => "admin",
        }
    }
}

/// Only `GET`/`HEAD` are limited; paths outside the known groups bypass limiting.
pub fn profile_for(method: &axum::http::Method, path: &str) -> Option<Profile> {
    use axum::http::Method;
    if method != Method::GET && method != Method::HEAD {
        return None;
    }
    let path = path.trim_end_matches('/');
    let under = |prefix: &str| path == prefix || path.starts_with(&format!("{prefix}/"));
    if under("/api/summary") {
        Some(Profile::Summary)
    } else if under("/api/refresh") || under("/api/status") || under("/api/debug") {
        Some(Profile::Admin)
    } else if under("/api/news") || under("/api/headlines") || under("/api/categories") {
        Some(Profile::Read)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub read_limit: u64,
    pub summary_limit: u64,
    pub admin_limit: u64,
    /// Local-map sweep period; independent of `window`.
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            read_limit: 120,
            summary_limit: 10,
            admin_limit: 10,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl RateLimitConfig {
    pub fn ceiling(&self, profile: Profile) -> u64 {
        match profile {
            Profile::Read => self.read_limit,
            Profile::Summary => self.summary_limit,
            Profile::Admin => self.admin_limit,
        }
    }
}

/// Atomic increment-with-expiry. Returns the post-increment count.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increment(&self, key: &str, ttl: Duration) -> NewsResult<u64>;
}

/// Outcome for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the current bucket ends.
    pub reset_at: u64,
    /// Seconds until the bucket boundary, at least 1.
    pub retry_after_secs: u64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    counters: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, counters: Arc<dyn CounterStore>) -> Self {
        ensure_metrics_described();
        Self { config, counters }
    }

    /// Local counters also get their sweeper spawned here, so call from inside a runtime.
    pub fn build(config: RateLimitConfig, backend: &Backend) -> Self {
        let counters: Arc<dyn CounterStore> = match backend {
            Backend::Redis(r) => Arc::new(redis::RedisCounters::new(r.clone())),
            Backend::Local => {
                let local = Arc::new(memory::LocalCounters::new());
                memory::spawn_sweeper(&local, config.sweep_interval);
                local
            }
        };
        Self::new(config, counters)
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request at `now_ms` (unix milliseconds).
    pub async fn check_at(
        &self,
        profile: Profile,
        client_id: &str,
        now_ms: u64,
    ) -> NewsResult<Decision> {
        let window_ms = (self.config.window.as_millis() as u64).max(1);
        let bucket = now_ms / window_ms;
        let key = format!("{}:{}:{}", profile.as_str(), client_id, bucket);

        let count = self.counters.increment(&key, self.config.window).await?;
        let limit = self.config.ceiling(profile);
        let bucket_end_ms = (bucket + 1) * window_ms;
        let retry_after_secs = (bucket_end_ms - now_ms).div_ceil(1000).max(1);

        Ok(Decision {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at: bucket_end_ms.div_ceil(1000),
            retry_after_secs,
        })
    }

    pub async fn check(&self, profile: Profile, client_id: &str) -> NewsResult<Decision> {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.check_at(profile, client_id, now_ms).await
    }
}

/// Client key from the first `X-Forwarded-For` hop, else the peer address.
/// Lowercased, IPv4-mapped IPv6 prefix stripped, anything outside `[a-z0-9._-]` replaced.
pub fn client_id(forwarded_for: Option<&str>, peer: Option<&str>) -> String {
    let raw = forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(str::trim).filter(|v| !v.is_empty()))
        .unwrap_or("unknown");
    let lowered = raw.to_ascii_lowercase();
    let stripped = lowered.strip_prefix("::ffff:").unwrap_or(&lowered);
    stripped
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    fn limiter(ceiling: u64) -> RateLimiter {
        let cfg = RateLimitConfig {
            window: Duration::from_secs(60),
            read_limit: ceiling,
            summary_limit: 1,
            admin_limit: 1,
            sweep_interval: Duration::from_secs(30),
        };
        RateLimiter::new(cfg, Arc::new(memory::LocalCounters::new()))
    }

    #[tokio::test]
    async fn fourth_request_in_bucket_is_rejected() {
        let rl = limiter(3);
        // 10s into a 60s bucket
        let now = 1_700_000_040_000u64 - (1_700_000_040_000u64 % 60_000) + 10_000;

        let mut remaining = Vec::new();
        for _ in 0..3 {
            let d = rl.check_at(Profile::Read, "1.2.3.4", now).await.unwrap();
            assert!(d.allowed);
            remaining.push(d.remaining);
        }
        assert_eq!(remaining, vec![2, 1, 0]);

        let d = rl.check_at(Profile::Read, "1.2.3.4", now).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.retry_after_secs, 50);
        assert_eq!(d.reset_at * 1000, now + 50_000);
    }

    #[tokio::test]
    async fn buckets_clients_and_profiles_are_independent() {
        let rl = limiter(1);
        let now = 120_000u64;
        assert!(rl.check_at(Profile::Read, "a", now).await.unwrap().allowed);
        assert!(!rl.check_at(Profile::Read, "a", now).await.unwrap().allowed);
        assert!(rl.check_at(Profile::Read, "b", now).await.unwrap().allowed);
        assert!(rl.check_at(Profile::Admin, "a", now).await.unwrap().allowed);
        // next bucket
        assert!(rl.check_at(Profile::Read, "a", now + 60_000).await.unwrap().allowed);
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        let window_ms = 60_000u64;
        let now = 2 * window_ms - 1;
        let bucket_end = (now / window_ms + 1) * window_ms;
        assert_eq!((bucket_end - now).div_ceil(1000).max(1), 1);
    }

    #[test]
    fn profiles_by_method_and_path() {
        assert_eq!(profile_for(&Method::GET, "/api/news"), Some(Profile::Read));
        assert_eq!(profile_for(&Method::HEAD, "/api/categories/"), Some(Profile::Read));
        assert_eq!(
            profile_for(&Method::GET, "/api/summary/abc"),
            Some(Profile::Summary)
        );
        assert_eq!(profile_for(&Method::GET, "/api/refresh"), Some(Profile::Admin));
        assert_eq!(profile_for(&Method::POST, "/api/refresh"), None);
        assert_eq!(profile_for(&Method::GET, "/health"), None);
        assert_eq!(profile_for(&Method::GET, "/api/newsletter"), None);
    }

    #[test]
    fn client_ids_are_normalized() {
        assert_eq!(
            client_id(Some("203.0.113.7, 10.0.0.1"), Some("10.0.0.1")),
            "203.0.113.7"
        );
        assert_eq!(client_id(None, Some("::ffff:192.168.1.9")), "192.168.1.9");
        assert_eq!(client_id(Some("  "), Some("2001:DB8::1")), "2001_db8__1");
        assert_eq!(client_id(None, None), "unknown");
        assert_eq!(client_id(Some("evil:key*"), None), "evil_key_");
    }
}
