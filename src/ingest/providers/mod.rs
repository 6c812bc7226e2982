// src/ingest/providers/mod.rs
pub mod json_api;
pub mod rss;

use std::sync::Arc;
use std::time::Duration;

use crate::ingest::config::ProviderSpec;
use crate::ingest::types::NewsProvider;

use self::json_api::{JsonApiConfig, JsonApiProvider};
use self::rss::{RssConfig, RssProvider};

/// Build adapters from config entries. Entries whose API key variable is unset are skipped.
pub fn build_providers(
    specs: &[ProviderSpec],
    timeout: Duration,
) -> anyhow::Result<Vec<Arc<dyn NewsProvider>>> {
    crate::ingest::ensure_metrics_described();
    let mut out: Vec<Arc<dyn NewsProvider>> = Vec::with_capacity(specs.len());
    for spec in specs {
        match spec {
            ProviderSpec::JsonApi {
                name,
                base_url,
                endpoint,
                api_key_env,
                api_key_param,
                sources,
                category,
            } => {
                let api_key = match api_key_env {
                    Some(var) => match std::env::var(var) {
                        Ok(v) if !v.trim().is_empty() => Some(v),
                        _ => {
                            tracing::warn!(
                                target: "ingest",
                                provider = %name,
                                env = %var,
                                "api key env var missing, provider skipped"
                            );
                            continue;
                        }
                    },
                    None => None,
                };
                out.push(Arc::new(JsonApiProvider::new(JsonApiConfig {
                    name: name.clone(),
                    base_url: base_url.clone(),
                    endpoint: endpoint.clone(),
                    api_key,
                    api_key_param: api_key_param.clone(),
                    source_filter: sources.clone(),
                    default_category: category.clone(),
                    timeout,
                })?));
            }
            ProviderSpec::Rss {
                name,
                url,
                category,
            } => out.push(Arc::new(RssProvider::new(RssConfig {
                name: name.clone(),
                url: url.clone(),
                default_category: category.clone(),
                timeout,
            })?)),
        }
    }
    tracing::info!(target: "ingest", providers = out.len(), "providers configured");
    Ok(out)
}
