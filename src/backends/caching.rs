use super::{Aggregator, Backend, BackendFeature, ConnectionString, Indexer};
use crate::context::Context;
use crate::dal::{Collection, Record};
use crate::error::Result;
use crate::filter::Filter;
use crate::types::Value;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub item_count: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_ratio: f64,
}

/// Read-through cache in front of any backend.
///
/// Records are keyed by `(collection, identity)`; only scalar identities are
/// cached. Writes made through this wrapper invalidate the keys they touch.
pub struct CachingBackend {
    backend: Arc<dyn Backend>,
    cache: DashMap<(String, Value), Record>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl CachingBackend {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            cache: DashMap::new(),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Discard every cached record in every collection.
    pub fn reset_cache(&self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hit_count.load(Ordering::Relaxed);
        let misses = self.miss_count.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            item_count: self.cache.len(),
            hit_count: hits,
            miss_count: misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Cache key with the identity coerced to the collection's identity
    /// type, so `1` and `"1"` share an entry. Unknown collections and
    /// unconvertible identities keep the raw value.
    fn key(&self, collection: &str, id: &Value) -> (String, Value) {
        let id = self
            .backend
            .get_collection(collection)
            .and_then(|c| c.coerce_identity(id.clone()))
            .unwrap_or_else(|_| id.clone());
        (collection.to_string(), id)
    }

    fn invalidate<'a>(&self, collection: &str, ids: impl IntoIterator<Item = &'a Value>) {
        for id in ids {
            self.cache.remove(&self.key(collection, id));
        }
    }
}

impl Backend for CachingBackend {
    fn name(&self) -> &str {
        self.backend.name()
    }

    fn connection_string(&self) -> &ConnectionString {
        self.backend.connection_string()
    }

    fn initialize(&self, ctx: &Context) -> Result<()> {
        self.backend.initialize(ctx)
    }

    fn register_collection(&self, collection: Collection) {
        self.backend.register_collection(collection)
    }

    fn set_indexer(&self, primary: Arc<dyn Indexer>, additional: Vec<Arc<dyn Indexer>>) {
        self.backend.set_indexer(primary, additional)
    }

    fn exists(&self, ctx: &Context, collection: &str, id: &Value) -> Result<bool> {
        self.backend.exists(ctx, collection, id)
    }

    fn retrieve(
        &self,
        ctx: &Context,
        collection: &str,
        id: &Value,
        fields: &[String],
    ) -> Result<Record> {
        if !id.is_scalar() {
            return self.backend.retrieve(ctx, collection, id, fields);
        }

        let key = self.key(collection, id);

        if let Some(cached) = self.cache.get(&key) {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            return Ok(cached.project(fields));
        }

        self.miss_count.fetch_add(1, Ordering::Relaxed);
        let record = self.backend.retrieve(ctx, collection, id, fields)?;

        // a projected record is not the whole record
        if fields.is_empty() {
            debug!(collection, id = %id, "caching retrieved record");
            self.cache.insert(key, record.clone());
        }

        Ok(record)
    }

    fn insert(&self, ctx: &Context, collection: &str, records: &[Record]) -> Result<()> {
        self.invalidate(collection, records.iter().map(|r| &r.id));
        self.backend.insert(ctx, collection, records)
    }

    fn update(
        &self,
        ctx: &Context,
        collection: &str,
        records: &[Record],
        target: &[String],
    ) -> Result<()> {
        let result = self.backend.update(ctx, collection, records, target);
        self.invalidate(collection, records.iter().map(|r| &r.id));
        result
    }

    fn delete(&self, ctx: &Context, collection: &str, ids: &[Value]) -> Result<()> {
        let result = self.backend.delete(ctx, collection, ids);
        self.invalidate(collection, ids);
        result
    }

    fn create_collection(&self, ctx: &Context, definition: Collection) -> Result<()> {
        self.backend.create_collection(ctx, definition)
    }

    fn delete_collection(&self, ctx: &Context, collection: &str) -> Result<()> {
        let result = self.backend.delete_collection(ctx, collection);
        self.cache.retain(|(name, _), _| name != collection);
        result
    }

    fn list_collections(&self) -> Result<Vec<String>> {
        self.backend.list_collections()
    }

    fn get_collection(&self, collection: &str) -> Result<Arc<Collection>> {
        self.backend.get_collection(collection)
    }

    fn with_search(
        &self,
        collection: &Collection,
        filter: Option<&Filter>,
    ) -> Option<Arc<dyn Indexer>> {
        self.backend.with_search(collection, filter)
    }

    fn with_aggregator(&self, collection: &Collection) -> Option<Arc<dyn Aggregator>> {
        self.backend.with_aggregator(collection)
    }

    fn flush(&self, ctx: &Context) -> Result<()> {
        self.backend.flush(ctx)
    }

    fn ping(&self, ctx: &Context, timeout: Duration) -> Result<()> {
        self.backend.ping(ctx, timeout)
    }

    fn supports(&self, feature: BackendFeature) -> bool {
        self.backend.supports(feature)
    }
}
