// src/ingest/providers/json_api.rs
//! NewsAPI-style JSON provider: `GET {base_url}{endpoint}?apiKey=..&pageSize=..&from=..`.

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, histogram};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{NewsError, NewsResult};
use crate::ingest::types::{FetchRequest, NewsProvider};
use crate::ingest::{finalize_batch, retention_cutoff};
use crate::model::{source_key, NewsItem, RawItem};

#[derive(Debug, Clone)]
pub struct JsonApiConfig {
    /// Display name stamped onto items.
    pub name: String,
    pub base_url: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Query parameter carrying the key (`apiKey` for NewsAPI).
    pub api_key_param: String,
    /// Upstream-side source filter (`sources=` query parameter).
    pub source_filter: Option<String>,
    /// Category applied when the upstream gives none.
    pub default_category: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(alias = "results", alias = "items", default)]
    articles: Option<Vec<ApiArticle>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiArticle {
    #[serde(alias = "article_id", default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(alias = "summary", default)]
    description: Option<String>,
    #[serde(alias = "link", default)]
    url: Option<String>,
    #[serde(alias = "image_url", alias = "imageUrl", default)]
    url_to_image: Option<String>,
    #[serde(alias = "pubDate", alias = "published_at", default)]
    published_at: Option<String>,
    #[serde(alias = "categories", default)]
    category: Option<OneOrMany>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

pub struct JsonApiProvider {
    id: String,
    cfg: JsonApiConfig,
    client: reqwest::Client,
}

impl JsonApiProvider {
    pub fn new(cfg: JsonApiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("headline-hub/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(cfg.timeout)
            .build()?;
        Ok(Self {
            id: source_key(&cfg.name),
            cfg,
            client,
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/{}",
            self.cfg.base_url.trim_end_matches('/'),
            self.cfg.endpoint.trim_start_matches('/')
        )
    }

    /// Parse a response body into items. Malformed JSON is an upstream error.
    pub fn parse_body(&self, body: &str) -> NewsResult<Vec<NewsItem>> {
        let resp: ApiResponse = serde_json::from_str(body)
            .map_err(|e| NewsError::upstream(format!("{}: malformed body: {e}", self.cfg.name)))?;

        let mut rejected = 0u64;
        let mut out = Vec::new();
        for a in resp.articles.unwrap_or_default() {
            let mut categories = a.category.map(OneOrMany::into_vec).unwrap_or_default();
            if categories.is_empty() {
                categories.extend(self.cfg.default_category.clone());
            }
            let raw = RawItem {
                id: a.id,
                title: a.title,
                summary: a.description,
                url: a.url,
                categories,
                published_at: a.published_at,
                image_url: a.url_to_image,
            };
            match raw.into_item(&self.cfg.name) {
                Some(it) => out.push(it),
                None => rejected += 1,
            }
        }
        counter!("ingest_rejected_total").increment(rejected);
        Ok(out)
    }
}

#[async_trait]
impl NewsProvider for JsonApiProvider {
    async fn fetch_headlines(&self, req: FetchRequest) -> NewsResult<Vec<NewsItem>> {
        let t0 = std::time::Instant::now();
        let now = Utc::now();
        let from = retention_cutoff(now, req.retention_days)
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();

        let mut query: Vec<(&str, String)> = vec![
            ("pageSize", req.limit.to_string()),
            ("from", from),
            ("sortBy", "publishedAt".to_string()),
        ];
        if let Some(key) = &self.cfg.api_key {
            query.push((self.cfg.api_key_param.as_str(), key.clone()));
        }
        if let Some(filter) = &self.cfg.source_filter {
            query.push(("sources", filter.clone()));
        }

        let resp = self
            .client
            .get(self.url())
            .query(&query)
            .send()
            .await
            .map_err(|e| {
                counter!("provider_errors_total", "provider" => self.id.clone()).increment(1);
                NewsError::upstream(format!("{}: request failed: {e}", self.cfg.name))
            })?;

        let status = resp.status();
        if !status.is_success() {
            tracing::warn!(
                target: "ingest",
                provider = %self.id,
                status = status.as_u16(),
                "provider returned non-success status"
            );
            return Ok(Vec::new());
        }

        let body = resp
            .text()
            .await
            .map_err(|e| NewsError::upstream(format!("{}: reading body: {e}", self.cfg.name)))?;
        let items = self.parse_body(&body)?;
        let (items, dropped) = finalize_batch(items, now, req.retention_days, req.limit);
        if dropped > 0 {
            tracing::debug!(target: "ingest", provider = %self.id, dropped, "items outside retention window");
        }

        histogram!("provider_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("ingest_items_total").increment(items.len() as u64);
        Ok(items)
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.cfg.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> JsonApiProvider {
        JsonApiProvider::new(JsonApiConfig {
            name: "Tech Wire".into(),
            base_url: "https://api.example.com/".into(),
            endpoint: "/v2/top-headlines".into(),
            api_key: None,
            api_key_param: "apiKey".into(),
            source_filter: None,
            default_category: Some("Technology".into()),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn builds_url_without_double_slashes() {
        assert_eq!(provider().url(), "https://api.example.com/v2/top-headlines");
        assert_eq!(provider().id(), "tech-wire");
    }

    #[test]
    fn parses_articles_and_applies_defaults() {
        let body = include_str!("../../../tests/fixtures/newsapi.json");
        let items = provider().parse_body(body).unwrap();
        // one article has no publishedAt, one has an empty title
        assert_eq!(items.len(), 3);
        let first = &items[0];
        assert_eq!(first.source, "Tech Wire");
        assert_eq!(first.title, "Chipmaker unveils new accelerator");
        assert_eq!(first.categories, vec!["Technology"]);
        assert_eq!(
            first.image_url.as_deref(),
            Some("https://img.example.com/chip.jpg")
        );
        let tagged = items.iter().find(|i| i.id == "abc-123").unwrap();
        assert_eq!(tagged.categories, vec!["Business", "Markets"]);
    }

    #[test]
    fn results_alias_and_string_category() {
        let body = r#"{"results":[{"title":"Rates on hold","link":"https://x.test/r","pubDate":"2024-01-03T08:00:00Z","category":"Economy"}]}"#;
        let items = provider().parse_body(body).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].categories, vec!["Economy"]);
        assert_eq!(items[0].url.as_deref(), Some("https://x.test/r"));
    }

    #[test]
    fn malformed_body_is_upstream_error() {
        let err = provider().parse_body("<html>oops</html>").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UpstreamUnavailable);
    }

    #[test]
    fn missing_article_list_is_empty() {
        assert!(provider()
            .parse_body(r#"{"status":"ok"}"#)
            .unwrap()
            .is_empty());
    }
}
