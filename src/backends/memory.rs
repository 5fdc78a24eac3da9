//! In-process backend and index.
//!
//! `MemoryBackend` keeps records in a concurrent map and fans writes out to
//! its indexers. `MemoryIndexer` evaluates filters with the matcher
//! generator and implements the full aggregation contract, which makes it
//! the default index for stores that have no search engine of their own.

use super::aggregator::count_via_query;
use super::{
    AggregateStats, Aggregator, Backend, BackendFeature, ConnectionString, IndexPage, Indexer,
    IndexerSet, ResultFn, merge_update, prepare_record,
};
use crate::config::{ConnectOptions, EngineConfig};
use crate::context::Context;
use crate::dal::{Collection, Record, RecordSet};
use crate::error::{QuarryError, Result};
use crate::filter::generators::{CompiledFilter, Generator, MatcherGenerator};
use crate::filter::{Aggregate, Aggregation, Filter};
use crate::types::Value;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

pub struct MemoryBackend {
    conn: ConnectionString,
    autocreate_collections: bool,
    registered: DashMap<String, Collection>,
    collections: DashMap<String, Arc<Collection>>,
    records: DashMap<(String, Value), Record>,
    indexers: IndexerSet,
}

impl MemoryBackend {
    pub fn new(conn: ConnectionString, options: &ConnectOptions) -> Self {
        info!(connection = %conn, "creating memory backend");

        Self {
            conn,
            autocreate_collections: options.autocreate_collections,
            registered: DashMap::new(),
            collections: DashMap::new(),
            records: DashMap::new(),
            indexers: IndexerSet::default(),
        }
    }

    fn collection_for_write(&self, ctx: &Context, name: &str) -> Result<Arc<Collection>> {
        match self.get_collection(name) {
            Err(err) if err.is_not_found() && self.autocreate_collections => {
                let definition = self
                    .registered
                    .get(name)
                    .map(|c| c.clone())
                    .unwrap_or_else(|| Collection::new(name));
                self.create_collection(ctx, definition)?;
                self.get_collection(name)
            }
            other => other,
        }
    }

    fn key(collection: &str, id: &Value) -> (String, Value) {
        (collection.to_string(), id.clone())
    }

    /// Stored keys addressed by `id`. A scalar identity in a compound
    /// collection addresses every tuple it leads, in key order.
    fn keys_for(&self, collection: &Collection, id: &Value) -> Result<Vec<Value>> {
        let id = collection.lookup_key(id)?;
        if !collection.is_compound() || matches!(id, Value::Array(_)) {
            return Ok(vec![id]);
        }

        let mut keys: Vec<Value> = self
            .records
            .iter()
            .filter(|entry| {
                let (name, stored) = entry.key();
                *name == collection.name && collection.key_matches(stored, &id)
            })
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort_by(|a, b| a.compare(b));
        Ok(keys)
    }

    /// Live copy of the record stored under `key`; expired records are dropped on sight.
    fn load_key(&self, collection: &Collection, key: &Value) -> Option<Record> {
        let key = Self::key(&collection.name, key);
        let record = self.records.get(&key).map(|r| r.clone())?;

        if collection.is_expired(&record) {
            self.records.remove(&key);
            return None;
        }

        Some(record)
    }

    fn load(&self, collection: &Collection, id: &Value) -> Result<Option<Record>> {
        Ok(self
            .keys_for(collection, id)?
            .iter()
            .find_map(|key| self.load_key(collection, key)))
    }

    fn store(&self, collection: &Collection, records: &[Record]) -> Result<()> {
        for record in records {
            let key = collection.storage_key(record)?;
            self.records
                .insert(Self::key(&collection.name, &key), record.clone());
        }
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn connection_string(&self) -> &ConnectionString {
        &self.conn
    }

    fn initialize(&self, ctx: &Context) -> Result<()> {
        let pending: Vec<Collection> = self
            .registered
            .iter()
            .filter(|entry| !self.collections.contains_key(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();

        for definition in pending {
            self.create_collection(ctx, definition)?;
        }

        Ok(())
    }

    fn register_collection(&self, collection: Collection) {
        self.registered.insert(collection.name.clone(), collection);
    }

    fn set_indexer(&self, primary: Arc<dyn Indexer>, additional: Vec<Arc<dyn Indexer>>) {
        self.indexers.set(primary, additional);
    }

    fn exists(&self, ctx: &Context, collection: &str, id: &Value) -> Result<bool> {
        ctx.check()?;
        let collection = self.get_collection(collection)?;
        Ok(self.load(&collection, id)?.is_some())
    }

    fn retrieve(
        &self,
        ctx: &Context,
        collection: &str,
        id: &Value,
        fields: &[String],
    ) -> Result<Record> {
        ctx.check()?;
        let collection = self.get_collection(collection)?;

        match self.load(&collection, id)? {
            Some(record) => Ok(record.project(fields)),
            None => Err(QuarryError::NotFound(format!("{}/{}", collection.name, id))),
        }
    }

    fn insert(&self, ctx: &Context, collection: &str, records: &[Record]) -> Result<()> {
        ctx.check()?;
        let collection = self.collection_for_write(ctx, collection)?;

        let stored = records
            .iter()
            .map(|r| prepare_record(&collection, r))
            .collect::<Result<Vec<_>>>()?;

        self.store(&collection, &stored)?;
        self.indexers.index(ctx, &collection, &stored)
    }

    fn update(
        &self,
        ctx: &Context,
        collection: &str,
        records: &[Record],
        target: &[String],
    ) -> Result<()> {
        ctx.check()?;
        let collection = self.get_collection(collection)?;
        let mut stored = Vec::with_capacity(records.len());

        for record in records {
            let key = collection.storage_key(record)?;
            let existing = self.load_key(&collection, &key).ok_or_else(|| {
                QuarryError::NotFound(format!("{}/{}", collection.name, key))
            })?;
            let merged = merge_update(Some(existing), record, target);
            stored.push(prepare_record(&collection, &merged)?);
        }

        self.store(&collection, &stored)?;

        self.indexers.index(ctx, &collection, &stored)
    }

    fn delete(&self, ctx: &Context, collection: &str, ids: &[Value]) -> Result<()> {
        ctx.check()?;
        let collection = self.get_collection(collection)?;

        let ids = ids
            .iter()
            .map(|id| collection.lookup_key(id))
            .collect::<Result<Vec<_>>>()?;

        for id in &ids {
            for key in self.keys_for(&collection, id)? {
                self.records.remove(&Self::key(&collection.name, &key));
            }
        }

        self.indexers.remove(ctx, &collection, &ids)
    }

    fn create_collection(&self, _ctx: &Context, definition: Collection) -> Result<()> {
        if self.collections.contains_key(&definition.name) {
            return Err(QuarryError::CollectionAlreadyExists(definition.name));
        }

        debug!(collection = %definition.name, "creating collection");
        self.collections
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    fn delete_collection(&self, ctx: &Context, collection: &str) -> Result<()> {
        let (_, definition) = self
            .collections
            .remove(collection)
            .ok_or_else(|| QuarryError::CollectionNotFound(collection.to_string()))?;

        self.records.retain(|(name, _), _| name != collection);
        self.indexers.clear(ctx, &definition)
    }

    fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    fn get_collection(&self, collection: &str) -> Result<Arc<Collection>> {
        self.collections
            .get(collection)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| QuarryError::CollectionNotFound(collection.to_string()))
    }

    fn with_search(
        &self,
        _collection: &Collection,
        _filter: Option<&Filter>,
    ) -> Option<Arc<dyn Indexer>> {
        self.indexers.primary()
    }

    fn with_aggregator(&self, _collection: &Collection) -> Option<Arc<dyn Aggregator>> {
        self.indexers.aggregator()
    }

    fn flush(&self, ctx: &Context) -> Result<()> {
        self.indexers.flush(ctx)
    }

    fn ping(&self, ctx: &Context, _timeout: Duration) -> Result<()> {
        ctx.check()
    }

    fn supports(&self, feature: BackendFeature) -> bool {
        matches!(
            feature,
            BackendFeature::CompositeKeys | BackendFeature::TimeToLive | BackendFeature::PartialSearch
        )
    }
}

/// In-process search index keyed by index name, then by index identity.
pub struct MemoryIndexer {
    conn: ConnectionString,
    config: EngineConfig,
    generator: MatcherGenerator,
    parent: RwLock<Option<Weak<dyn Backend>>>,
    documents: DashMap<String, BTreeMap<String, Record>>,
}

impl MemoryIndexer {
    pub fn new(conn: ConnectionString, config: EngineConfig) -> Self {
        info!(connection = %conn, "creating memory indexer");

        let generator =
            MatcherGenerator::default().with_fulltext_conjunction_and(config.fulltext_conjunction_and);

        Self {
            conn,
            config,
            generator,
            parent: RwLock::new(None),
            documents: DashMap::new(),
        }
    }

    fn compile(&self, collection: &Collection, filter: &Filter) -> Result<CompiledFilter> {
        self.generator
            .render(collection.index_name(), filter)
            .map(|rendered| rendered.query)
            .map_err(QuarryError::render)
    }

    /// Index identities whose leading component is `id`.
    fn keys_for(&self, collection: &Collection, id: &Value) -> Vec<String> {
        let key = collection.index_key(id, &self.config.compound_joiner);
        let Some(docs) = self.documents.get(collection.index_name()) else {
            return Vec::new();
        };

        if !collection.is_compound() {
            return docs.contains_key(&key).then_some(key).into_iter().collect();
        }

        let prefix = format!("{}{}", key, collection.compound_joiner(&self.config.compound_joiner));
        docs.keys()
            .filter(|k| **k == key || k.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Sorted snapshot of the live records matching `filter`.
    fn matching(&self, collection: &Collection, filter: &Filter) -> Result<Vec<Record>> {
        let compiled = self.compile(collection, filter)?;

        let mut matches: Vec<Record> = self
            .documents
            .get(collection.index_name())
            .map(|docs| {
                docs.values()
                    .filter(|r| !collection.is_expired(r) && compiled.matches(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        compiled.sort(&mut matches);
        Ok(matches)
    }

    fn stats(
        &self,
        ctx: &Context,
        collection: &Collection,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<AggregateStats> {
        ctx.check()?;
        let filter = filter.cloned().unwrap_or_default();
        let matches = self.matching(collection, &filter)?;

        Ok(AggregateStats::from_values(matches.iter().filter_map(|r| {
            r.lookup(field, &filter.identity_field)
                .and_then(Value::as_f64)
        })))
    }
}

impl Indexer for MemoryIndexer {
    fn index_connection_string(&self) -> &ConnectionString {
        &self.conn
    }

    fn engine_config(&self) -> &EngineConfig {
        &self.config
    }

    fn index_initialize(&self, parent: Weak<dyn Backend>) -> Result<()> {
        *self.parent.write() = Some(parent);
        Ok(())
    }

    fn get_backend(&self) -> Option<Arc<dyn Backend>> {
        self.parent.read().as_ref().and_then(Weak::upgrade)
    }

    fn index_exists(&self, ctx: &Context, collection: &Collection, id: &Value) -> Result<bool> {
        ctx.check()?;
        Ok(!self.keys_for(collection, id).is_empty())
    }

    fn index_retrieve(&self, ctx: &Context, collection: &Collection, id: &Value) -> Result<Record> {
        ctx.check()?;
        let key = collection.index_key(id, &self.config.compound_joiner);

        self.documents
            .get(collection.index_name())
            .and_then(|docs| docs.get(&key).cloned())
            .ok_or_else(|| QuarryError::NotFound(format!("{}/{}", collection.index_name(), key)))
    }

    fn index_remove(&self, ctx: &Context, collection: &Collection, ids: &[Value]) -> Result<()> {
        ctx.check()?;

        for id in ids {
            let keys = self.keys_for(collection, id);
            if let Some(mut docs) = self.documents.get_mut(collection.index_name()) {
                for key in keys {
                    docs.remove(&key);
                }
            }
        }

        Ok(())
    }

    fn index(&self, ctx: &Context, collection: &Collection, records: &[Record]) -> Result<()> {
        ctx.check()?;
        let mut docs = self
            .documents
            .entry(collection.index_name().to_string())
            .or_default();

        for record in records {
            let key = collection.index_identity(record, &self.config.compound_joiner);
            let mut doc = record.clone();
            if collection.is_compound() {
                doc.id = Value::String(key.clone());
            }
            docs.insert(key, doc);
        }

        Ok(())
    }

    fn query_func(
        &self,
        ctx: &Context,
        collection: &Collection,
        filter: Option<&Filter>,
        result_fn: &mut ResultFn<'_>,
    ) -> Result<()> {
        ctx.check()?;
        let filter = filter.cloned().unwrap_or_default();
        let matches = self.matching(collection, &filter)?;
        let total = matches.len();

        let page = IndexPage::for_window(
            filter.offset,
            filter.limit,
            Some(total as u64),
            self.config.page_size,
        );
        let take = if filter.limit > 0 { filter.limit } else { total };

        debug!(
            index = collection.index_name(),
            total,
            offset = filter.offset,
            limit = filter.limit,
            "memory index query"
        );

        for record in matches.into_iter().skip(filter.offset).take(take) {
            ctx.check()?;
            if result_fn(record.project(&filter.fields), &page)?.is_break() {
                break;
            }
        }

        Ok(())
    }

    fn list_values(
        &self,
        ctx: &Context,
        collection: &Collection,
        fields: &[String],
        filter: Option<&Filter>,
    ) -> Result<HashMap<String, Vec<Value>>> {
        ctx.check()?;
        let filter = filter.cloned().unwrap_or_default();
        let matches = self.matching(collection, &filter)?;
        let mut values = HashMap::new();

        for field in fields {
            let mut distinct: Vec<Value> = Vec::new();

            for record in &matches {
                let Some(value) = record.lookup(field, &filter.identity_field) else {
                    continue;
                };
                let items = match value {
                    Value::Array(items) => items.clone(),
                    Value::Null => continue,
                    other => vec![other.clone()],
                };
                for item in items {
                    if !distinct.contains(&item) {
                        distinct.push(item);
                    }
                }
            }

            distinct.sort_by(|a, b| a.compare(b));
            distinct.truncate(self.config.max_facet_cardinality);
            values.insert(field.clone(), distinct);
        }

        Ok(values)
    }

    fn delete_query(
        &self,
        ctx: &Context,
        collection: &Collection,
        filter: Option<&Filter>,
    ) -> Result<()> {
        ctx.check()?;

        let Some(filter) = filter.filter(|f| !f.is_match_all()) else {
            self.documents.remove(collection.index_name());
            return Ok(());
        };

        let compiled = self.compile(collection, filter)?;
        if let Some(mut docs) = self.documents.get_mut(collection.index_name()) {
            docs.retain(|_, record| !compiled.matches(record));
        }

        Ok(())
    }

    fn flush_index(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn aggregator(self: Arc<Self>) -> Option<Arc<dyn Aggregator>> {
        Some(self)
    }
}

impl Aggregator for MemoryIndexer {
    fn aggregator_connection_string(&self) -> &ConnectionString {
        &self.conn
    }

    fn sum(
        &self,
        ctx: &Context,
        collection: &Collection,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<f64> {
        Ok(self.stats(ctx, collection, field, filter)?.sum)
    }

    fn count(&self, ctx: &Context, collection: &Collection, filter: Option<&Filter>) -> Result<u64> {
        count_via_query(self, ctx, collection, filter)
    }

    fn minimum(
        &self,
        ctx: &Context,
        collection: &Collection,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<f64> {
        Ok(self.stats(ctx, collection, field, filter)?.min)
    }

    fn maximum(
        &self,
        ctx: &Context,
        collection: &Collection,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<f64> {
        Ok(self.stats(ctx, collection, field, filter)?.max)
    }

    fn average(
        &self,
        ctx: &Context,
        collection: &Collection,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<f64> {
        Ok(self.stats(ctx, collection, field, filter)?.avg)
    }

    fn group_by(
        &self,
        ctx: &Context,
        collection: &Collection,
        group_by: &[String],
        aggregates: &[Aggregate],
        filter: Option<&Filter>,
    ) -> Result<RecordSet> {
        ctx.check()?;
        let filter = filter.cloned().unwrap_or_default();
        let matches = self.matching(collection, &filter)?;

        let mut groups: Vec<(Vec<Value>, Vec<&Record>)> = Vec::new();
        for record in &matches {
            let key: Vec<Value> = group_by
                .iter()
                .map(|g| {
                    record
                        .lookup(g, &filter.identity_field)
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect();

            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(record),
                None => groups.push((key, vec![record])),
            }
        }

        if group_by.is_empty() && groups.is_empty() {
            groups.push((Vec::new(), Vec::new()));
        }

        groups.sort_by(|(a, _), (b, _)| Value::Array(a.clone()).compare(&Value::Array(b.clone())));

        let mut results = RecordSet::new();
        for (key, members) in groups {
            let id = match key.as_slice() {
                [single] => single.clone(),
                [] => Value::Null,
                _ => Value::Array(key.clone()),
            };
            let mut record = Record::new(id);

            for (field, value) in group_by.iter().zip(key) {
                record.insert(field.clone(), value);
            }

            for aggregate in aggregates {
                let value = match aggregate.aggregation {
                    Aggregation::Count => Value::Int(members.len() as i64),
                    other => {
                        let stats = AggregateStats::from_values(members.iter().filter_map(|r| {
                            r.lookup(&aggregate.field, &filter.identity_field)
                                .and_then(Value::as_f64)
                        }));
                        Value::Float(stats.get(other))
                    }
                };
                record.insert(aggregate.result_key(), value);
            }

            results.push(record);
        }

        results.result_count = results.len() as u64;
        results.known_size = true;
        results.total_pages = 1;
        results.page = 1;
        Ok(results)
    }
}
