//! # News item model
//! The one record type that flows from providers through the cache into the store.
//!
//! Items are built from loosely-shaped upstream fields via [`RawItem::into_item`], which is the
//! only place where categories get normalised, timestamps parsed and ids synthesised. Anything
//! read back from a backend goes through [`NewsItem::from_stored`] and is dropped when it does
//! not validate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Category used when an upstream gives none.
pub const FALLBACK_CATEGORY: &str = "News";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewsItem {
    pub id: String,
    pub title: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Display name of the feed the item came from.
    pub source: String,
    pub categories: Vec<String>,
    pub published_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl NewsItem {
    /// Shape check applied to anything coming back from a backend.
    pub fn validate(&self) -> bool {
        !self.id.trim().is_empty()
            && !self.title.trim().is_empty()
            && !self.source.trim().is_empty()
            && !self.categories.is_empty()
            && self.categories.iter().all(|c| !c.trim().is_empty())
    }

    /// Decode a stored JSON body. Corrupt or partial records yield `None`.
    pub fn from_stored(raw: &str) -> Option<Self> {
        let item: NewsItem = serde_json::from_str(raw).ok()?;
        item.validate().then_some(item)
    }

    /// Sort/prune key in epoch milliseconds.
    pub fn score(&self) -> i64 {
        self.published_at.timestamp_millis()
    }

    pub fn source_key(&self) -> String {
        source_key(&self.source)
    }
}

/// Recency order: newest first, title then id as tiebreakers so repeated merges don't flicker.
pub fn recency_order(a: &NewsItem, b: &NewsItem) -> std::cmp::Ordering {
    b.published_at
        .cmp(&a.published_at)
        .then_with(|| a.title.cmp(&b.title))
        .then_with(|| a.id.cmp(&b.id))
}

/// Store order: newest millisecond first, equal scores by id descending. This is the order a
/// Redis `ZREVRANGE` over the `(score, id)` index yields, so every backend pages identically.
pub fn index_order(a: &NewsItem, b: &NewsItem) -> std::cmp::Ordering {
    b.score().cmp(&a.score()).then_with(|| b.id.cmp(&a.id))
}

/// Loosely-typed item as an adapter sees it, before validation.
#[derive(Debug, Clone, Default)]
pub struct RawItem {
    pub id: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub categories: Vec<String>,
    pub published_at: Option<String>,
    pub image_url: Option<String>,
}

impl RawItem {
    /// Build a [`NewsItem`] stamped with `source`. Returns `None` when the title is empty
    /// after normalisation or when the timestamp doesn't parse.
    pub fn into_item(self, source: &str) -> Option<NewsItem> {
        let title = crate::ingest::normalize_text(self.title.as_deref().unwrap_or_default());
        if title.is_empty() {
            return None;
        }
        let published_at = parse_published(self.published_at.as_deref()?)?;
        let summary = crate::ingest::normalize_text(self.summary.as_deref().unwrap_or_default());
        let url = non_empty(self.url);
        let id = non_empty(self.id).unwrap_or_else(|| synth_id(source, url.as_deref(), &title));

        Some(NewsItem {
            id,
            title,
            summary,
            url,
            source: source.to_string(),
            categories: normalize_categories(self.categories),
            published_at,
            image_url: non_empty(self.image_url),
        })
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Accepts RFC 3339 (`2024-01-03T00:00:00Z`), RFC 3339 without seconds and RFC 2822 (RSS).
pub fn parse_published(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    if ts.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(ts) {
        return Some(dt.with_timezone(&Utc));
    }
    // "2024-01-03T00:00Z"
    chrono::NaiveDateTime::parse_from_str(ts.trim_end_matches('Z'), "%Y-%m-%dT%H:%M")
        .ok()
        .filter(|_| ts.ends_with('Z'))
        .map(|naive| naive.and_utc())
}

/// Trim, drop empties, dedup case-insensitively keeping first-seen spelling and order.
/// Never returns an empty list.
pub fn normalize_categories<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for c in raw {
        let t = c.as_ref().trim();
        if t.is_empty() {
            continue;
        }
        if seen.insert(t.to_lowercase()) {
            out.push(t.to_string());
        }
    }
    if out.is_empty() {
        out.push(FALLBACK_CATEGORY.to_string());
    }
    out
}

/// Source id used by selectors and the category index: lowercase, runs of non-alphanumerics
/// collapsed to a single `-`.
pub fn source_key(display: &str) -> String {
    let mut out = String::with_capacity(display.len());
    let mut dash = false;
    for ch in display.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            out.push(ch);
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

fn synth_id(source: &str, url: Option<&str>, title: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    match url {
        Some(u) => hasher.update(u.as_bytes()),
        None => {
            hasher.update(source_key(source).as_bytes());
            hasher.update(b"\n");
            hasher.update(title.as_bytes());
        }
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(24);
    for b in digest.iter().take(12) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(title: &str, ts: &str) -> RawItem {
        RawItem {
            title: Some(title.into()),
            published_at: Some(ts.into()),
            ..Default::default()
        }
    }

    #[test]
    fn categories_dedup_case_insensitive_in_first_seen_order() {
        let out = normalize_categories(["Tech", " markets ", "tech", "", "Markets", "AI"]);
        assert_eq!(out, vec!["Tech", "markets", "AI"]);
    }

    #[test]
    fn categories_fall_back_to_news() {
        let empty: Vec<String> = vec![];
        assert_eq!(normalize_categories(empty), vec!["News"]);
        assert_eq!(normalize_categories(["  "]), vec!["News"]);
    }

    #[test]
    fn parses_supported_timestamp_shapes() {
        assert!(parse_published("2024-01-03T00:00:00Z").is_some());
        assert!(parse_published("2024-01-03T00:00:00+02:00").is_some());
        assert!(parse_published("Wed, 03 Jan 2024 10:00:00 GMT").is_some());
        assert_eq!(
            parse_published("2024-01-03T00:00Z"),
            parse_published("2024-01-03T00:00:00Z")
        );
        assert!(parse_published("yesterday").is_none());
        assert!(parse_published("").is_none());
    }

    #[test]
    fn unparseable_timestamp_rejects_item() {
        assert!(raw("Headline", "not a date").into_item("Wire").is_none());
        assert!(raw("   ", "2024-01-03T00:00:00Z").into_item("Wire").is_none());
    }

    #[test]
    fn synthesized_id_is_stable_and_prefers_url() {
        let a = raw("Markets rally", "2024-01-03T00:00:00Z")
            .into_item("Wire")
            .unwrap();
        let b = raw("Markets rally", "2024-01-03T05:00:00Z")
            .into_item("Wire")
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.categories, vec!["News"]);

        let mut with_url = raw("Markets rally", "2024-01-03T00:00:00Z");
        with_url.url = Some("https://example.com/a".into());
        let c = with_url.into_item("Wire").unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn stored_records_that_fail_shape_are_absent() {
        assert!(NewsItem::from_stored("{not json").is_none());
        let partial = r#"{"id":"x","title":"t","summary":"","source":"S","categories":[],"publishedAt":"2024-01-01T00:00:00Z"}"#;
        assert!(NewsItem::from_stored(partial).is_none());
        let ok = r#"{"id":"x","title":"t","summary":"","source":"S","categories":["News"],"publishedAt":"2024-01-01T00:00:00Z"}"#;
        assert_eq!(NewsItem::from_stored(ok).unwrap().id, "x");
    }

    #[test]
    fn source_key_slugs_display_names() {
        assert_eq!(source_key("BBC News"), "bbc-news");
        assert_eq!(source_key("  The Verge!! "), "the-verge");
        assert_eq!(source_key("hacker_news"), "hacker-news");
    }
}
