// src/config.rs
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::aggregator::AggregatorConfig;
use crate::ingest::config::ENV_PROVIDERS_PATH;
use crate::ratelimit::RateLimitConfig;
use crate::service::{ServiceConfig, MAX_PAGE_LIMIT, MAX_RETENTION_DAYS};
use crate::store::ScanLimits;

pub const ENV_BIND_ADDR: &str = "BIND_ADDR";
pub const ENV_REDIS_URL: &str = "REDIS_URL";
pub const ENV_KEY_PREFIX: &str = "NEWS_KEY_PREFIX";

/// Process configuration. Every knob has a default; bad values are logged and ignored.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub providers_path: Option<PathBuf>,
    /// `None` disables the periodic refresh.
    pub refresh_interval: Option<Duration>,
    pub aggregator: AggregatorConfig,
    pub service: ServiceConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            redis_url: None,
            key_prefix: "news".to_string(),
            providers_path: None,
            refresh_interval: Some(Duration::from_secs(900)),
            aggregator: AggregatorConfig::default(),
            service: ServiceConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| {
            lookup(k)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let d = Self::default();

        let refresh_secs = parse_or(&get, "REFRESH_INTERVAL_SECS", 900u64);
        let rl = d.rate_limit;

        Self {
            bind_addr: parse_or(&get, ENV_BIND_ADDR, d.bind_addr),
            redis_url: get(ENV_REDIS_URL),
            key_prefix: get(ENV_KEY_PREFIX).unwrap_or(d.key_prefix),
            providers_path: get(ENV_PROVIDERS_PATH).map(PathBuf::from),
            refresh_interval: (refresh_secs > 0).then(|| Duration::from_secs(refresh_secs)),
            aggregator: AggregatorConfig {
                cache_ttl: secs_or(&get, "HEADLINE_CACHE_TTL_SECS", d.aggregator.cache_ttl),
                provider_timeout: secs_or(
                    &get,
                    "PROVIDER_TIMEOUT_SECS",
                    d.aggregator.provider_timeout,
                ),
            },
            service: ServiceConfig {
                default_limit: bounded_or(
                    &get,
                    "DEFAULT_LIMIT",
                    d.service.default_limit,
                    MAX_PAGE_LIMIT,
                ),
                default_retention_days: bounded_or(
                    &get,
                    "DEFAULT_RETENTION_DAYS",
                    d.service.default_retention_days,
                    MAX_RETENTION_DAYS,
                ),
                scan: ScanLimits {
                    chunk_size: positive_or(&get, "SCAN_CHUNK_SIZE", d.service.scan.chunk_size),
                    max_chunks: positive_or(&get, "SCAN_MAX_CHUNKS", d.service.scan.max_chunks),
                },
            },
            rate_limit: RateLimitConfig {
                window: secs_or(&get, "RATE_LIMIT_WINDOW_SECS", rl.window),
                read_limit: positive_or(&get, "RATE_LIMIT_READ", rl.read_limit),
                summary_limit: positive_or(&get, "RATE_LIMIT_SUMMARY", rl.summary_limit),
                admin_limit: positive_or(&get, "RATE_LIMIT_ADMIN", rl.admin_limit),
                sweep_interval: secs_or(&get, "RATE_LIMIT_SWEEP_SECS", rl.sweep_interval),
            },
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> T
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(key, value = %raw, "invalid config value, using default");
            default
        }
    }
}

fn positive_or<T, G>(get: &G, key: &str, default: T) -> T
where
    T: FromStr + PartialOrd + Default + Copy,
    G: Fn(&str) -> Option<String>,
{
    let v = parse_or(get, key, default);
    if v > T::default() {
        v
    } else {
        tracing::warn!(key, "config value must be positive, using default");
        default
    }
}

/// Positive and at most `max`; request validation rejects anything above it.
fn bounded_or<T, G>(get: &G, key: &str, default: T, max: T) -> T
where
    T: FromStr + PartialOrd + Default + Copy + std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let v = positive_or(get, key, default);
    if v <= max {
        v
    } else {
        tracing::warn!(key, value = %v, max = %max, "config value above maximum, using default");
        default
    }
}

fn secs_or<G>(get: &G, key: &str, default: Duration) -> Duration
where
    G: Fn(&str) -> Option<String>,
{
    Duration::from_secs(positive_or(get, key, default.as_secs()))
}
