// src/ingest/config.rs
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_PROVIDERS_PATH: &str = "PROVIDERS_PATH";

fn default_api_key_param() -> String {
    "apiKey".to_string()
}

/// One upstream feed, as written in `config/providers.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderSpec {
    JsonApi {
        name: String,
        base_url: String,
        endpoint: String,
        /// Name of the env var holding the key; never the key itself.
        #[serde(default)]
        api_key_env: Option<String>,
        #[serde(default = "default_api_key_param")]
        api_key_param: String,
        #[serde(default)]
        sources: Option<String>,
        #[serde(default)]
        category: Option<String>,
    },
    Rss {
        name: String,
        url: String,
        #[serde(default)]
        category: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct ProvidersFile {
    #[serde(default)]
    providers: Vec<ProviderSpec>,
}

/// Load provider specs from an explicit path. Supports TOML or JSON formats.
pub fn load_providers_from(path: &Path) -> Result<Vec<ProviderSpec>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading providers from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_providers(&content, ext.as_str())
}

/// Load providers using env var + fallbacks:
/// 1) explicit path (from `$PROVIDERS_PATH`)
/// 2) config/providers.toml
/// 3) config/providers.json
pub fn load_providers_default(explicit: Option<&Path>) -> Result<Vec<ProviderSpec>> {
    if let Some(pb) = explicit {
        if pb.exists() {
            return load_providers_from(pb);
        }
        return Err(anyhow!(
            "{ENV_PROVIDERS_PATH} points to non-existent path {}",
            pb.display()
        ));
    }
    let toml_p = PathBuf::from("config/providers.toml");
    if toml_p.exists() {
        return load_providers_from(&toml_p);
    }
    let json_p = PathBuf::from("config/providers.json");
    if json_p.exists() {
        return load_providers_from(&json_p);
    }
    Ok(Vec::new())
}

fn parse_providers(s: &str, hint_ext: &str) -> Result<Vec<ProviderSpec>> {
    let parsed: ProvidersFile = if hint_ext == "json" {
        serde_json::from_str(s).context("parsing providers json")?
    } else {
        toml::from_str(s).context("parsing providers toml")?
    };
    let mut names = std::collections::HashSet::new();
    for p in &parsed.providers {
        let name = match p {
            ProviderSpec::JsonApi { name, .. } | ProviderSpec::Rss { name, .. } => name,
        };
        if crate::model::source_key(name).is_empty() {
            return Err(anyhow!("provider name {name:?} has no usable characters"));
        }
        if !names.insert(crate::model::source_key(name)) {
            return Err(anyhow!("duplicate provider name {name:?}"));
        }
    }
    Ok(parsed.providers)
}
