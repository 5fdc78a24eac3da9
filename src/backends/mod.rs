//! Storage backends and the protocols the query engine drives them through.

pub mod aggregator;
pub mod caching;
pub mod elasticsearch;
pub mod indexer;
pub mod kv;
pub mod memory;
pub mod registry;

pub use aggregator::{AggregateStats, Aggregator};
pub use caching::{CacheStats, CachingBackend};
pub use elasticsearch::{ElasticsearchIndexer, HttpTransport, SearchTransport};
pub use indexer::{IndexPage, Indexer, ResultFn};
pub use kv::SledBackend;
pub use memory::{MemoryBackend, MemoryIndexer};
pub use registry::Registry;

use crate::context::Context;
use crate::dal::{Collection, FieldType, Record};
use crate::error::{QuarryError, Result};
use crate::filter::Filter;
use crate::types::Value;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendFeature {
    PartialSearch,
    CompositeKeys,
    Constraints,
    TimeToLive,
}

/// Parsed `scheme[+protocol]://host[:port]/dataset?key=value` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    backend: String,
    protocol: Option<String>,
    host: String,
    dataset: String,
    options: HashMap<String, String>,
}

impl ConnectionString {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || QuarryError::InvalidConnectionString(input.to_string());

        let (scheme, rest) = input.split_once("://").ok_or_else(invalid)?;
        if scheme.is_empty() {
            return Err(invalid());
        }

        let (backend, protocol) = match scheme.split_once('+') {
            Some((b, p)) => (b.to_string(), Some(p.to_string())),
            None => (scheme.to_string(), None),
        };

        let (location, query) = match rest.split_once('?') {
            Some((l, q)) => (l, Some(q)),
            None => (rest, None),
        };

        let (host, dataset) = match location.find('/') {
            Some(i) => (&location[..i], &location[i..]),
            None => (location, ""),
        };

        let mut options = HashMap::new();
        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            options.insert(key.to_string(), value.to_string());
        }

        Ok(Self {
            backend,
            protocol,
            host: host.to_string(),
            dataset: dataset.to_string(),
            options,
        })
    }

    /// The scheme without any `+protocol` suffix.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path portion, including the leading `/` when present.
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn opt(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn opt_bool(&self, key: &str) -> bool {
        matches!(self.opt(key), Some("true" | "1" | "yes"))
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.backend)?;
        if let Some(protocol) = &self.protocol {
            write!(f, "+{}", protocol)?;
        }
        write!(f, "://{}{}", self.host, self.dataset)?;

        if !self.options.is_empty() {
            let mut pairs: Vec<String> = self
                .options
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "?{}", pairs.join("&"))?;
        }

        Ok(())
    }
}

/// A store that persists and retrieves whole records by identity.
///
/// Every call is synchronous; `ctx` carries cancellation and the deadline.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn connection_string(&self) -> &ConnectionString;

    fn initialize(&self, ctx: &Context) -> Result<()>;

    /// Make a collection definition known without creating storage for it.
    fn register_collection(&self, collection: Collection);

    /// Attach the indexer that serves queries, plus any that only receive writes.
    fn set_indexer(&self, primary: Arc<dyn Indexer>, additional: Vec<Arc<dyn Indexer>>);

    fn exists(&self, ctx: &Context, collection: &str, id: &Value) -> Result<bool>;

    /// Fetch one record. A non-empty `fields` projects the result.
    fn retrieve(&self, ctx: &Context, collection: &str, id: &Value, fields: &[String])
    -> Result<Record>;

    fn insert(&self, ctx: &Context, collection: &str, records: &[Record]) -> Result<()>;

    /// Replace stored records. A non-empty `target` limits the update to
    /// those fields, keeping the rest of the stored record.
    fn update(
        &self,
        ctx: &Context,
        collection: &str,
        records: &[Record],
        target: &[String],
    ) -> Result<()>;

    fn delete(&self, ctx: &Context, collection: &str, ids: &[Value]) -> Result<()>;

    fn create_collection(&self, ctx: &Context, definition: Collection) -> Result<()>;

    fn delete_collection(&self, ctx: &Context, collection: &str) -> Result<()>;

    fn list_collections(&self) -> Result<Vec<String>>;

    fn get_collection(&self, collection: &str) -> Result<Arc<Collection>>;

    fn with_search(&self, collection: &Collection, filter: Option<&Filter>)
    -> Option<Arc<dyn Indexer>>;

    fn with_aggregator(&self, collection: &Collection) -> Option<Arc<dyn Aggregator>>;

    fn flush(&self, ctx: &Context) -> Result<()>;

    fn ping(&self, ctx: &Context, timeout: Duration) -> Result<()>;

    fn supports(&self, feature: BackendFeature) -> bool;
}

/// Indexers attached to one backend. Writes fan out to all of them; only
/// the primary serves queries and aggregation.
#[derive(Default)]
pub struct IndexerSet {
    primary: RwLock<Option<Arc<dyn Indexer>>>,
    additional: RwLock<Vec<Arc<dyn Indexer>>>,
}

impl IndexerSet {
    pub fn set(&self, primary: Arc<dyn Indexer>, additional: Vec<Arc<dyn Indexer>>) {
        *self.primary.write() = Some(primary);
        *self.additional.write() = additional;
    }

    pub fn primary(&self) -> Option<Arc<dyn Indexer>> {
        self.primary.read().clone()
    }

    pub fn aggregator(&self) -> Option<Arc<dyn Aggregator>> {
        self.primary().and_then(|indexer| indexer.aggregator())
    }

    fn all(&self) -> Vec<Arc<dyn Indexer>> {
        let mut all: Vec<Arc<dyn Indexer>> = self.primary.read().iter().cloned().collect();
        all.extend(self.additional.read().iter().cloned());
        all
    }

    pub fn index(&self, ctx: &Context, collection: &Collection, records: &[Record]) -> Result<()> {
        for indexer in self.all() {
            indexer.index(ctx, collection, records)?;
        }
        Ok(())
    }

    pub fn remove(&self, ctx: &Context, collection: &Collection, ids: &[Value]) -> Result<()> {
        for indexer in self.all() {
            indexer.index_remove(ctx, collection, ids)?;
        }
        Ok(())
    }

    /// Drop everything indexed for `collection`.
    pub fn clear(&self, ctx: &Context, collection: &Collection) -> Result<()> {
        for indexer in self.all() {
            indexer.delete_query(ctx, collection, None)?;
        }
        Ok(())
    }

    pub fn flush(&self, ctx: &Context) -> Result<()> {
        for indexer in self.all() {
            indexer.flush_index(ctx)?;
        }
        Ok(())
    }
}

/// Apply the collection schema to a record about to be stored. Records without
/// an identity get a fresh v4 UUID when the identity field is UUID-typed.
pub(crate) fn prepare_record(collection: &Collection, record: &Record) -> Result<Record> {
    let id = match &record.id {
        Value::Null if collection.identity_field_type == FieldType::Uuid => {
            Value::Uuid(Uuid::new_v4())
        }
        Value::Null => {
            return Err(QuarryError::InvalidValue(format!(
                "{}: cannot store a record without an identity",
                collection.name
            )));
        }
        id => id.clone(),
    };

    collection.make_record(id, record.fields.clone())
}

/// Merge `incoming` into `existing`, limited to `target` fields when given.
pub(crate) fn merge_update(existing: Option<Record>, incoming: &Record, target: &[String]) -> Record {
    match existing {
        Some(mut stored) if !target.is_empty() => {
            for field in target {
                match incoming.get(field) {
                    Some(value) => stored.insert(field.clone(), value.clone()),
                    None => {
                        stored.fields.remove(field);
                    }
                }
            }
            stored
        }
        _ => incoming.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_protocol_host_and_options() {
        let cs = ConnectionString::parse("elasticsearch+https://search.local:9200/?refresh=true")
            .unwrap();
        assert_eq!(cs.backend(), "elasticsearch");
        assert_eq!(cs.protocol(), Some("https"));
        assert_eq!(cs.host(), "search.local:9200");
        assert_eq!(cs.dataset(), "/");
        assert!(cs.opt_bool("refresh"));
        assert_eq!(cs.to_string(), "elasticsearch+https://search.local:9200/?refresh=true");
    }

    #[test]
    fn parses_paths_without_host() {
        let cs = ConnectionString::parse("sled:///var/lib/quarry").unwrap();
        assert_eq!(cs.backend(), "sled");
        assert_eq!(cs.host(), "");
        assert_eq!(cs.dataset(), "/var/lib/quarry");

        let cs = ConnectionString::parse("memory://").unwrap();
        assert_eq!(cs.backend(), "memory");
        assert_eq!(cs.dataset(), "");
    }

    #[test]
    fn rejects_strings_without_scheme() {
        assert!(matches!(
            ConnectionString::parse("localhost:9200"),
            Err(QuarryError::InvalidConnectionString(_))
        ));
    }

    #[test]
    fn targeted_update_keeps_other_fields() {
        let stored = Record::new(1).set("name", "a").set("age", 3);
        let incoming = Record::new(1).set("name", "b").set("age", 99);
        let merged = merge_update(Some(stored), &incoming, &["name".to_string()]);
        assert_eq!(merged.get("name"), Some(&Value::from("b")));
        assert_eq!(merged.get("age"), Some(&Value::Int(3)));
    }
}
