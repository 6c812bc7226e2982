use async_trait::async_trait;
use std::time::Duration;

use crate::backend::RedisBackend;
use crate::error::NewsResult;
use crate::ratelimit::CounterStore;

/// `INCR` + `EXPIRE` in one atomic pipeline under `{prefix}:rl:{group}:{client}:{bucket}`.
#[derive(Debug, Clone)]
pub struct RedisCounters {
    backend: RedisBackend,
}

impl RedisCounters {
    pub fn new(backend: RedisBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl CounterStore for RedisCounters {
    async fn increment(&self, key: &str, ttl: Duration) -> NewsResult<u64> {
        let full_key = self.backend.key(&format!("rl:{key}"));
        let ttl_secs = ttl.as_secs().max(1);
        let mut conn = self.backend.conn();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&full_key)
            .cmd("EXPIRE")
            .arg(&full_key)
            .arg(ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}
