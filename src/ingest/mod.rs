// src/ingest/mod.rs
pub mod config;
pub mod providers;
pub mod scheduler;
pub mod types;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, describe_counter, describe_histogram};
use once_cell::sync::OnceCell;

use crate::model::NewsItem;

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "ingest_items_total",
            "Items parsed from providers after normalization."
        );
        describe_counter!(
            "ingest_rejected_total",
            "Upstream items dropped (no title, bad timestamp, outside retention)."
        );
        describe_counter!("provider_errors_total", "Provider fetch/parse errors.");
        describe_histogram!(
            "provider_fetch_ms",
            "Provider fetch + parse time in milliseconds."
        );
    });
}

/// Normalize text: decode entities, strip tags, collapse whitespace, cap length.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 5) Length cap: 1500 chars
    if out.chars().count() > 1500 {
        out = out.chars().take(1500).collect();
    }

    out
}

/// Oldest `publishedAt` a provider should still return for `retention_days`.
pub fn retention_cutoff(now: DateTime<Utc>, retention_days: u32) -> DateTime<Utc> {
    now - Duration::days(i64::from(retention_days))
}

/// Drop items older than the retention window and cap at `limit`, newest first.
/// Retention drops are counted in `ingest_rejected_total`.
pub(crate) fn finalize_batch(
    mut items: Vec<NewsItem>,
    now: DateTime<Utc>,
    retention_days: u32,
    limit: usize,
) -> (Vec<NewsItem>, usize) {
    let cutoff = retention_cutoff(now, retention_days);
    let before = items.len();
    items.retain(|it| it.published_at >= cutoff);
    let dropped = before - items.len();
    counter!("ingest_rejected_total").increment(dropped as u64);
    items.sort_by(crate::model::recency_order);
    items.truncate(limit);
    (items, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawItem;

    #[test]
    fn normalize_text_strips_tags_and_collapses_ws() {
        let s = "  <p>Hello,&nbsp;&nbsp; <b>world</b>?</p>  ";
        assert_eq!(normalize_text(s), "Hello, world?");
    }

    #[test]
    fn normalize_text_maps_typographic_quotes() {
        assert_eq!(normalize_text("\u{201C}Hi\u{201D} it\u{2019}s"), "\"Hi\" it's");
    }

    #[test]
    fn normalize_text_cleans_feed_markup() {
        let s = "Fed holds rates &amp; signals cuts <a href=\"https://x.test/a?b=1&amp;c=2\">Read more</a>\n<img src=\"p.jpg\"/>";
        assert_eq!(normalize_text(s), "Fed holds rates & signals cuts Read more");
        assert_eq!(normalize_text("It&#8217;s official!"), "It's official!");
        assert_eq!(normalize_text("<br/>\t "), "");
    }

    #[test]
    fn normalize_text_caps_by_chars_not_bytes() {
        let n = normalize_text(&"é".repeat(2_000));
        assert_eq!(n.chars().count(), 1_500);
    }

    #[test]
    fn finalize_drops_old_items_and_caps() {
        let now = "2024-01-10T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let mk = |t: &str, ts: &str| {
            RawItem {
                title: Some(t.into()),
                published_at: Some(ts.into()),
                ..Default::default()
            }
            .into_item("Wire")
            .unwrap()
        };
        let items = vec![
            mk("old", "2024-01-01T00:00:00Z"),
            mk("b", "2024-01-09T00:00:00Z"),
            mk("a", "2024-01-09T12:00:00Z"),
            mk("c", "2024-01-08T00:00:00Z"),
        ];
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let (kept, dropped) =
            metrics::with_local_recorder(&recorder, || finalize_batch(items, now, 3, 2));
        assert_eq!(dropped, 1);
        let titles: Vec<_> = kept.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["a", "b"]);
        assert!(
            handle.render().contains("ingest_rejected_total 1"),
            "{}",
            handle.render()
        );
    }
}
