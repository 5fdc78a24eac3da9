use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning values shared by indexers, aggregators and generators.
///
/// Passed explicitly into constructors rather than read from global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of hits requested from an index per round trip.
    pub page_size: usize,
    /// Upper bound on distinct values returned by facet listings and group-by buckets.
    pub max_facet_cardinality: usize,
    /// Joiner used when a collection declares compound index fields but no joiner.
    pub compound_joiner: String,
    /// Whether tokens inside one fulltext value must all match (AND) or any (OR).
    pub fulltext_conjunction_and: bool,
    /// Search-engine query type used for exact matches.
    pub exact_match_query_type: String,
    /// When set, exact and pattern clauses are duplicated against `field.<multifield>`.
    pub multifield: Option<String>,
    /// Per-request timeout applied when the caller's context has no deadline.
    pub request_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_facet_cardinality: 10_000,
            compound_joiner: ":".to_string(),
            fulltext_conjunction_and: true,
            exact_match_query_type: "term".to_string(),
            multifield: None,
            request_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_multifield(mut self, suffix: impl Into<String>) -> Self {
        self.multifield = Some(suffix.into());
        self
    }
}

/// Connection surface handed to `Registry::connect`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Overrides the host portion of the connection string when non-empty.
    pub endpoint: String,
    /// Connection string of the primary search indexer.
    pub indexer: String,
    /// Secondary indexers that receive every write but never serve queries.
    pub additional_indexers: Vec<String>,
    pub skip_initialize: bool,
    pub autocreate_collections: bool,
}

impl ConnectOptions {
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn with_indexer(mut self, indexer: impl Into<String>) -> Self {
        self.indexer = indexer.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_fill_missing_keys_with_defaults() {
        let opts = ConnectOptions::from_json(r#"{"indexer": "memory://", "autocreate_collections": true}"#)
            .unwrap();
        assert_eq!(opts.indexer, "memory://");
        assert!(opts.autocreate_collections);
        assert!(!opts.skip_initialize);
        assert!(opts.additional_indexers.is_empty());
    }

    #[test]
    fn engine_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.page_size, 100);
        assert_eq!(config.max_facet_cardinality, 10_000);
        assert_eq!(config.compound_joiner, ":");
        assert!(config.fulltext_conjunction_and);
    }
}
