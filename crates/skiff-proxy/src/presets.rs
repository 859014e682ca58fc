//! PAC preset catalogue.

use std::sync::Arc;

use serde::Deserialize;
use skiff_core::PacPreset;
use tracing::warn;

use crate::error::Result;
use crate::http_cache::HttpCache;

/// Default preset index.
pub const DEFAULT_INDEX_URL: &str =
    "https://raw.githubusercontent.com/shadowsocks/v2ray-rules-dat/release/pac/index.json";

/// Ceiling for the index document.
pub const INDEX_MAX_BYTES: u64 = 1_500_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexEntry {
    id: Option<String>,
    name: Option<String>,
    description: Option<String>,
    source_url: Option<String>,
}

/// Fetches the preset index through the HTTP cache.
pub struct PresetCatalog {
    cache: Arc<HttpCache>,
    index_url: String,
}

impl PresetCatalog {
    pub fn new(cache: Arc<HttpCache>) -> Self {
        Self::with_index_url(cache, DEFAULT_INDEX_URL)
    }

    pub fn with_index_url(cache: Arc<HttpCache>, index_url: impl Into<String>) -> Self {
        Self {
            cache,
            index_url: index_url.into(),
        }
    }

    /// Lists presets. Failures are logged and yield an empty list.
    pub async fn presets(&self) -> Vec<PacPreset> {
        match self.fetch().await {
            Ok(presets) => presets,
            Err(e) => {
                warn!(url = %self.index_url, error = %e, "Unable to fetch PAC presets");
                Vec::new()
            }
        }
    }

    async fn fetch(&self) -> Result<Vec<PacPreset>> {
        let key = format!("pac-presets:{}", self.index_url);
        let result = self
            .cache
            .get_string(&self.index_url, &key, INDEX_MAX_BYTES)
            .await?;
        let entries: Vec<IndexEntry> = serde_json::from_str(&result.content)?;
        Ok(parse_entries(entries))
    }
}

fn parse_entries(entries: Vec<IndexEntry>) -> Vec<PacPreset> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let id = entry.id.filter(|v| !v.trim().is_empty())?;
            let source_url = entry.source_url.filter(|v| !v.trim().is_empty())?;
            Some(PacPreset {
                name: entry.name.unwrap_or_else(|| id.clone()),
                description: entry.description.unwrap_or_default(),
                id,
                source_url,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_without_id_or_source_are_skipped() {
        let json = r#"[
            {"id": "gfw", "name": "GFW list", "description": "Blocked sites", "sourceUrl": "https://x/gfw.txt"},
            {"id": "bare", "sourceUrl": "https://x/bare.txt"},
            {"id": "", "sourceUrl": "https://x/none.txt"},
            {"id": "nosource"}
        ]"#;
        let entries: Vec<IndexEntry> = serde_json::from_str(json).unwrap();
        let presets = parse_entries(entries);

        assert_eq!(presets.len(), 2);
        assert_eq!(presets[0].name, "GFW list");
        assert_eq!(presets[1].id, "bare");
        assert_eq!(presets[1].name, "bare");
        assert_eq!(presets[1].description, "");
    }
}
