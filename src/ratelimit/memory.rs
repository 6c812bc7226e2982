use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{NewsError, NewsResult};
use crate::ratelimit::CounterStore;

/// Process-local counters. Expired buckets are reclaimed by [`LocalCounters::sweep`].
#[derive(Debug, Default)]
pub struct LocalCounters {
    inner: Mutex<HashMap<String, (u64, Instant)>>,
}

impl LocalCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = map.len();
        map.retain(|_, (_, expires_at)| *expires_at > now);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for LocalCounters {
    async fn increment(&self, key: &str, ttl: Duration) -> NewsResult<u64> {
        let now = Instant::now();
        // a poisoned map surfaces as a backend error so the middleware fails open
        let mut map = self
            .inner
            .lock()
            .map_err(|_| NewsError::backend("rate counter mutex poisoned"))?;
        let entry = map.entry(key.to_string()).or_insert((0, now + ttl));
        if entry.1 <= now {
            *entry = (0, now + ttl);
        }
        entry.0 += 1;
        Ok(entry.0)
    }
}

/// Periodic sweep. Holds only a `Weak`, so the task ends once the counters are dropped.
pub fn spawn_sweeper(counters: &Arc<LocalCounters>, every: Duration) -> JoinHandle<()> {
    let weak: Weak<LocalCounters> = Arc::downgrade(counters);
    let every = every.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(counters) = weak.upgrade() else {
                break;
            };
            let removed = counters.sweep();
            if removed > 0 {
                tracing::debug!(target: "ratelimit", removed, "swept expired rate buckets");
            }
        }
    })
}
