//! Key-value backend over sled: one tree per collection, records stored as
//! bincode, collection definitions as JSON in a metadata tree.

use super::{
    Aggregator, Backend, BackendFeature, ConnectionString, Indexer, IndexerSet, merge_update,
    prepare_record,
};
use crate::config::ConnectOptions;
use crate::context::Context;
use crate::dal::{Collection, Record};
use crate::error::{QuarryError, Result};
use crate::filter::Filter;
use crate::types::Value;
use dashmap::DashMap;
use sled::{Db, Tree};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const COLLECTIONS_TREE: &str = "__collections__";

pub struct SledBackend {
    conn: ConnectionString,
    db: Db,
    autocreate_collections: bool,
    registered: DashMap<String, Collection>,
    collections: DashMap<String, Arc<Collection>>,
    indexers: IndexerSet,
}

impl SledBackend {
    /// Opens `sled:///path/to/db`. `?temporary=true` opens a throwaway
    /// database that is removed on drop.
    pub fn open(conn: ConnectionString, options: &ConnectOptions) -> Result<Self> {
        let path = format!("{}{}", conn.host(), conn.dataset());
        if path.is_empty() && !conn.opt_bool("temporary") {
            return Err(QuarryError::InvalidConnectionString(conn.to_string()));
        }

        info!(connection = %conn, path, "opening sled backend");

        let mut config = sled::Config::new()
            .cache_capacity(1024 * 1024 * 128)
            .flush_every_ms(Some(1000))
            .mode(sled::Mode::HighThroughput)
            .temporary(conn.opt_bool("temporary"));

        if !path.is_empty() {
            config = config.path(&path);
        }

        let db = config.open()?;

        Ok(Self {
            conn,
            db,
            autocreate_collections: options.autocreate_collections,
            registered: DashMap::new(),
            collections: DashMap::new(),
            indexers: IndexerSet::default(),
        })
    }

    fn tree(&self, collection: &str) -> Result<Tree> {
        Ok(self.db.open_tree(collection.as_bytes())?)
    }

    /// Encoded keys addressed by `id`. A scalar identity in a compound
    /// collection addresses every stored tuple it leads.
    fn keys_for(&self, collection: &Collection, id: &Value) -> Result<Vec<Vec<u8>>> {
        let id = collection.lookup_key(id)?;
        if !collection.is_compound() || matches!(id, Value::Array(_)) {
            return Ok(vec![bincode::serialize(&id)?]);
        }

        let mut keys = Vec::new();
        for entry in self.tree(&collection.name)?.iter() {
            let (key, _) = entry?;
            let stored: Value = bincode::deserialize(&key)?;
            if collection.key_matches(&stored, &id) {
                keys.push(key.to_vec());
            }
        }
        Ok(keys)
    }

    fn load_key(&self, collection: &Collection, tree: &Tree, key: &[u8]) -> Result<Option<Record>> {
        let Some(bytes) = tree.get(key)? else {
            return Ok(None);
        };

        let record: Record = bincode::deserialize(&bytes)?;
        if collection.is_expired(&record) {
            tree.remove(key)?;
            return Ok(None);
        }

        Ok(Some(record))
    }

    fn load(&self, collection: &Collection, id: &Value) -> Result<Option<Record>> {
        let tree = self.tree(&collection.name)?;
        for key in self.keys_for(collection, id)? {
            if let Some(record) = self.load_key(collection, &tree, &key)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn store(&self, collection: &Collection, records: &[Record]) -> Result<()> {
        let tree = self.tree(&collection.name)?;

        let batch = records
            .iter()
            .try_fold(sled::Batch::default(), |mut batch, record| -> Result<_> {
                let key = collection.storage_key(record)?;
                batch.insert(bincode::serialize(&key)?, bincode::serialize(record)?);
                Ok(batch)
            })?;

        tree.apply_batch(batch)?;
        Ok(())
    }

    /// Every live record of a collection, in key order.
    fn scan(&self, collection: &Collection) -> Result<Vec<Record>> {
        let mut records = Vec::new();

        for entry in self.tree(&collection.name)?.iter() {
            let (_, bytes) = entry?;
            let record: Record = bincode::deserialize(&bytes)?;
            if !collection.is_expired(&record) {
                records.push(record);
            }
        }

        Ok(records)
    }
}

impl Backend for SledBackend {
    fn name(&self) -> &str {
        "sled"
    }

    fn connection_string(&self) -> &ConnectionString {
        &self.conn
    }

    /// Loads persisted collection definitions, creates registered ones that
    /// are missing, and replays stored records into the attached indexers.
    fn initialize(&self, ctx: &Context) -> Result<()> {
        let meta = self.tree(COLLECTIONS_TREE)?;

        for entry in meta.iter() {
            let (_, bytes) = entry?;
            let definition: Collection = serde_json::from_slice(&bytes)?;
            self.collections
                .insert(definition.name.clone(), Arc::new(definition));
        }

        let pending: Vec<Collection> = self
            .registered
            .iter()
            .filter(|entry| !self.collections.contains_key(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();

        for definition in pending {
            self.create_collection(ctx, definition)?;
        }

        let collections: Vec<Arc<Collection>> =
            self.collections.iter().map(|c| Arc::clone(c.value())).collect();

        for collection in collections {
            ctx.check()?;
            let records = self.scan(&collection)?;
            debug!(collection = %collection.name, count = records.len(), "reindexing");
            self.indexers.index(ctx, &collection, &records)?;
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

        let tree = self.tree(&collection.name)?;

        for record in records {
            let key = collection.storage_key(record)?;
            let existing = self
                .load_key(&collection, &tree, &bincode::serialize(&key)?)?
                .ok_or_else(|| QuarryError::NotFound(format!("{}/{}", collection.name, key)))?;
            let merged = merge_update(Some(existing), record, target);
            stored.push(prepare_record(&collection, &merged)?);
        }

        self.store(&collection, &stored)?;
        self.indexers.index(ctx, &collection, &stored)
    }

    fn delete(&self, ctx: &Context, collection: &str, ids: &[Value]) -> Result<()> {
        ctx.check()?;
        let collection = self.get_collection(collection)?;
        let tree = self.tree(&collection.name)?;

        let mut batch = sled::Batch::default();
        for id in ids {
            for key in self.keys_for(&collection, id)? {
                batch.remove(key);
            }
        }
        tree.apply_batch(batch)?;

        self.indexers.remove(ctx, &collection, ids)
    }

    fn create_collection(&self, _ctx: &Context, definition: Collection) -> Result<()> {
        if self.collections.contains_key(&definition.name) {
            return Err(QuarryError::CollectionAlreadyExists(definition.name));
        }

        debug!(collection = %definition.name, "creating collection");
        self.tree(COLLECTIONS_TREE)?
            .insert(definition.name.as_bytes(), serde_json::to_vec(&definition)?)?;
        self.tree(&definition.name)?;

        self.collections
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    fn delete_collection(&self, ctx: &Context, collection: &str) -> Result<()> {
        let (_, definition) = self
            .collections
            .remove(collection)
            .ok_or_else(|| QuarryError::CollectionNotFound(collection.to_string()))?;

        self.tree(COLLECTIONS_TREE)?.remove(collection.as_bytes())?;
        self.db.drop_tree(collection.as_bytes())?;
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
        self.db.flush()?;
        self.indexers.flush(ctx)
    }

    fn ping(&self, ctx: &Context, _timeout: Duration) -> Result<()> {
        ctx.check()?;
        self.db.size_on_disk()?;
        Ok(())
    }

    fn supports(&self, feature: BackendFeature) -> bool {
        matches!(
            feature,
            BackendFeature::CompositeKeys | BackendFeature::TimeToLive | BackendFeature::PartialSearch
        )
    }
}

impl Drop for SledBackend {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            warn!(error = %e, "error flushing database");
        }
    }
}
