// src/ingest/types.rs
use crate::error::NewsResult;
use crate::model::NewsItem;

/// Per-provider slice of a headline fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub limit: usize,
    pub retention_days: u32,
}

/// An upstream news adapter. Pure function of its constructor configuration.
///
/// Ordinary upstream non-2xx responses yield `Ok(vec![])`; `Err` is reserved for transport
/// failures and malformed bodies.
#[async_trait::async_trait]
pub trait NewsProvider: Send + Sync {
    async fn fetch_headlines(&self, req: FetchRequest) -> NewsResult<Vec<NewsItem>>;
    /// Source id (see [`crate::model::source_key`]).
    fn id(&self) -> &str;
    /// Display name stamped onto every item.
    fn name(&self) -> &str;
}
