#![allow(dead_code)]

use quarry::backends::{
    Aggregator, Backend, BackendFeature, ConnectionString, Indexer, MemoryBackend, MemoryIndexer,
};
use quarry::{
    Collection, ConnectOptions, Context, EngineConfig, Field, FieldType, Filter, QuarryError,
    Record, Result, Value,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Pass-through backend that counts retrieves and can be told to fail them.
pub struct CountingBackend {
    inner: Arc<dyn Backend>,
    pub retrieves: AtomicUsize,
    pub fail_retrieves: AtomicBool,
}

impl CountingBackend {
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self {
            inner,
            retrieves: AtomicUsize::new(0),
            fail_retrieves: AtomicBool::new(false),
        }
    }

    pub fn retrieve_count(&self) -> usize {
        self.retrieves.load(Ordering::SeqCst)
    }
}

impl Backend for CountingBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn connection_string(&self) -> &ConnectionString {
        self.inner.connection_string()
    }

    fn initialize(&self, ctx: &Context) -> Result<()> {
        self.inner.initialize(ctx)
    }

    fn register_collection(&self, collection: Collection) {
        self.inner.register_collection(collection)
    }

    fn set_indexer(&self, primary: Arc<dyn Indexer>, additional: Vec<Arc<dyn Indexer>>) {
        self.inner.set_indexer(primary, additional)
    }

    fn exists(&self, ctx: &Context, collection: &str, id: &Value) -> Result<bool> {
        self.inner.exists(ctx, collection, id)
    }

    fn retrieve(
        &self,
        ctx: &Context,
        collection: &str,
        id: &Value,
        fields: &[String],
    ) -> Result<Record> {
        self.retrieves.fetch_add(1, Ordering::SeqCst);
        if self.fail_retrieves.load(Ordering::SeqCst) {
            return Err(QuarryError::NotFound(format!("{}/{}", collection, id)));
        }
        self.inner.retrieve(ctx, collection, id, fields)
    }

    fn insert(&self, ctx: &Context, collection: &str, records: &[Record]) -> Result<()> {
        self.inner.insert(ctx, collection, records)
    }

    fn update(
        &self,
        ctx: &Context,
        collection: &str,
        records: &[Record],
        target: &[String],
    ) -> Result<()> {
        self.inner.update(ctx, collection, records, target)
    }

    fn delete(&self, ctx: &Context, collection: &str, ids: &[Value]) -> Result<()> {
        self.inner.delete(ctx, collection, ids)
    }

    fn create_collection(&self, ctx: &Context, definition: Collection) -> Result<()> {
        self.inner.create_collection(ctx, definition)
    }

    fn delete_collection(&self, ctx: &Context, collection: &str) -> Result<()> {
        self.inner.delete_collection(ctx, collection)
    }

    fn list_collections(&self) -> Result<Vec<String>> {
        self.inner.list_collections()
    }

    fn get_collection(&self, collection: &str) -> Result<Arc<Collection>> {
        self.inner.get_collection(collection)
    }

    fn with_search(&self, collection: &Collection, filter: Option<&Filter>) -> Option<Arc<dyn Indexer>> {
        self.inner.with_search(collection, filter)
    }

    fn with_aggregator(&self, collection: &Collection) -> Option<Arc<dyn Aggregator>> {
        self.inner.with_aggregator(collection)
    }

    fn flush(&self, ctx: &Context) -> Result<()> {
        self.inner.flush(ctx)
    }

    fn ping(&self, ctx: &Context, timeout: Duration) -> Result<()> {
        self.inner.ping(ctx, timeout)
    }

    fn supports(&self, feature: BackendFeature) -> bool {
        self.inner.supports(feature)
    }
}

/// Route library logs to the test harness; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("quarry=debug")
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub counting: Arc<CountingBackend>,
    pub backend: Arc<dyn Backend>,
    pub indexer: Arc<MemoryIndexer>,
}

/// Memory backend wrapped in a counter, with a memory indexer whose parent
/// is the counter so every authoritative fetch is observed.
pub fn counted_memory(config: EngineConfig) -> Harness {
    init_tracing();

    let inner: Arc<dyn Backend> = Arc::new(MemoryBackend::new(
        ConnectionString::parse("memory://").unwrap(),
        &ConnectOptions::default(),
    ));
    let counting = Arc::new(CountingBackend::new(inner));
    let backend: Arc<dyn Backend> = counting.clone();

    let indexer = Arc::new(MemoryIndexer::new(
        ConnectionString::parse("memory://").unwrap(),
        config,
    ));
    indexer.index_initialize(Arc::downgrade(&backend)).unwrap();
    backend.set_indexer(indexer.clone(), Vec::new());

    Harness {
        counting,
        backend,
        indexer,
    }
}

pub fn users() -> Collection {
    Collection::new("users")
        .with_identity("id", FieldType::Int)
        .with_field(Field::new("name", FieldType::String))
        .with_field(Field::new("age", FieldType::Int))
        .with_field(Field::new("city", FieldType::String))
}

/// `count` users with ids `1..=count`, ages `20 + id % 10` and alternating cities.
pub fn seed_users(backend: &dyn Backend, count: i64) {
    let ctx = Context::background();
    backend.create_collection(&ctx, users()).unwrap();

    let records: Vec<Record> = (1..=count)
        .map(|i| {
            Record::new(i)
                .set("name", format!("user{:03}", i))
                .set("age", 20 + i % 10)
                .set("city", if i % 2 == 0 { "Wellington" } else { "Auckland" })
        })
        .collect();

    backend.insert(&ctx, "users", &records).unwrap();
}
