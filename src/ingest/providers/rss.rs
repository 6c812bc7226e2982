// src/ingest/providers/rss.rs
use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{NewsError, NewsResult};
use crate::ingest::finalize_batch;
use crate::ingest::types::{FetchRequest, NewsProvider};
use crate::model::{source_key, NewsItem, RawItem};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Guid>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    #[serde(rename = "category", default)]
    categories: Vec<String>,
    enclosure: Option<Enclosure>,
}

#[derive(Debug, Deserialize)]
struct Guid {
    #[serde(rename = "$text")]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Enclosure {
    #[serde(rename = "@url")]
    url: Option<String>,
    #[serde(rename = "@type")]
    kind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RssConfig {
    pub name: String,
    pub url: String,
    pub default_category: Option<String>,
    pub timeout: Duration,
}

pub struct RssProvider {
    id: String,
    cfg: RssConfig,
    client: reqwest::Client,
}

impl RssProvider {
    pub fn new(cfg: RssConfig) -> anyhow::Result<Self> {
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

    pub fn parse_feed(&self, xml: &str) -> NewsResult<Vec<NewsItem>> {
        let xml_clean = scrub_html_entities_for_xml(xml);
        let rss: Rss = from_str(&xml_clean)
            .map_err(|e| NewsError::upstream(format!("{}: parsing rss xml: {e}", self.cfg.name)))?;

        let mut out = Vec::with_capacity(rss.channel.item.len());
        let mut rejected = 0u64;
        for it in rss.channel.item {
            let mut categories = it.categories;
            if categories.is_empty() {
                categories.extend(self.cfg.default_category.clone());
            }
            let image_url = it
                .enclosure
                .filter(|e| e.kind.as_deref().is_some_and(|k| k.starts_with("image/")))
                .and_then(|e| e.url);
            let raw = RawItem {
                id: it.guid.and_then(|g| g.value),
                title: it.title,
                summary: it.description,
                url: it.link,
                categories,
                published_at: it.pub_date,
                image_url,
            };
            match raw.into_item(&self.cfg.name) {
                Some(item) => out.push(item),
                None => rejected += 1,
            }
        }
        counter!("ingest_rejected_total").increment(rejected);
        Ok(out)
    }
}

#[async_trait]
impl NewsProvider for RssProvider {
    async fn fetch_headlines(&self, req: FetchRequest) -> NewsResult<Vec<NewsItem>> {
        let t0 = std::time::Instant::now();
        let resp = match self.client.get(&self.cfg.url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(target: "ingest", error = ?e, provider = %self.id, "provider http error");
                counter!("provider_errors_total", "provider" => self.id.clone()).increment(1);
                return Err(NewsError::upstream(format!("{}: http get: {e}", self.cfg.name)));
            }
        };
        if !resp.status().is_success() {
            tracing::warn!(
                target: "ingest",
                provider = %self.id,
                status = resp.status().as_u16(),
                "feed returned non-success status"
            );
            return Ok(Vec::new());
        }
        let body = resp
            .text()
            .await
            .map_err(|e| NewsError::upstream(format!("{}: reading body: {e}", self.cfg.name)))?;

        let items = self.parse_feed(&body)?;
        let (items, dropped) = finalize_batch(items, Utc::now(), req.retention_days, req.limit);
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

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
