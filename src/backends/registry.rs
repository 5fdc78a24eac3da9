//! Connection-string driven construction of backends and indexers.

use super::{
    Backend, ConnectionString, ElasticsearchIndexer, Indexer, MemoryBackend, MemoryIndexer,
    SledBackend,
};
use crate::config::{ConnectOptions, EngineConfig};
use crate::context::Context;
use crate::error::{QuarryError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub type BackendConstructor =
    fn(ConnectionString, &ConnectOptions) -> Result<Arc<dyn Backend>>;

pub type IndexerConstructor = fn(ConnectionString, &EngineConfig) -> Result<Arc<dyn Indexer>>;

fn memory_backend(conn: ConnectionString, options: &ConnectOptions) -> Result<Arc<dyn Backend>> {
    Ok(Arc::new(MemoryBackend::new(conn, options)))
}

fn sled_backend(conn: ConnectionString, options: &ConnectOptions) -> Result<Arc<dyn Backend>> {
    Ok(Arc::new(SledBackend::open(conn, options)?))
}

fn memory_indexer(conn: ConnectionString, config: &EngineConfig) -> Result<Arc<dyn Indexer>> {
    Ok(Arc::new(MemoryIndexer::new(conn, config.clone())))
}

fn elasticsearch_indexer(conn: ConnectionString, config: &EngineConfig) -> Result<Arc<dyn Indexer>> {
    Ok(Arc::new(ElasticsearchIndexer::new(conn, config.clone())))
}

/// Maps connection string schemes to backend and indexer constructors.
pub struct Registry {
    backends: HashMap<String, BackendConstructor>,
    indexers: HashMap<String, IndexerConstructor>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Registry {
    /// A registry that knows no schemes at all.
    pub fn empty() -> Self {
        Self {
            backends: HashMap::new(),
            indexers: HashMap::new(),
        }
    }

    /// `memory` and `sled` backends; `memory` and `elasticsearch` indexers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        registry.register_backend("memory", memory_backend);
        registry.register_backend("sled", sled_backend);
        registry.register_indexer("memory", memory_indexer);
        registry.register_indexer("elasticsearch", elasticsearch_indexer);

        registry
    }

    pub fn register_backend(&mut self, scheme: impl Into<String>, constructor: BackendConstructor) {
        self.backends.insert(scheme.into(), constructor);
    }

    pub fn register_indexer(&mut self, scheme: impl Into<String>, constructor: IndexerConstructor) {
        self.indexers.insert(scheme.into(), constructor);
    }

    pub fn make_indexer(&self, conn_str: &str, config: &EngineConfig) -> Result<Arc<dyn Indexer>> {
        let conn = ConnectionString::parse(conn_str)?;
        let constructor = self
            .indexers
            .get(conn.backend())
            .ok_or_else(|| QuarryError::UnknownIndexer(conn.backend().to_string()))?;

        debug!(indexer = %conn, "creating indexer");
        constructor(conn, config)
    }

    /// Build a backend from `conn_str`, wire up its indexers, and initialize
    /// it unless `skip_initialize` is set.
    ///
    /// Without an explicit indexer the backend is served by an in-memory index.
    pub fn connect(
        &self,
        ctx: &Context,
        conn_str: &str,
        options: &ConnectOptions,
        config: &EngineConfig,
    ) -> Result<Arc<dyn Backend>> {
        let mut conn = ConnectionString::parse(conn_str)?;
        if !options.endpoint.is_empty() {
            conn = conn.with_host(options.endpoint.clone());
        }

        let constructor = self
            .backends
            .get(conn.backend())
            .ok_or_else(|| QuarryError::UnknownBackend(conn.backend().to_string()))?;

        info!(backend = %conn, indexer = %options.indexer, "connecting");
        let backend = constructor(conn, options)?;

        let primary = if options.indexer.is_empty() {
            self.make_indexer("memory://", config)?
        } else {
            self.make_indexer(&options.indexer, config)?
        };

        let additional = options
            .additional_indexers
            .iter()
            .map(|conn_str| self.make_indexer(conn_str, config))
            .collect::<Result<Vec<_>>>()?;

        for indexer in std::iter::once(&primary).chain(additional.iter()) {
            indexer.index_initialize(Arc::downgrade(&backend))?;
        }
        backend.set_indexer(primary, additional);

        if !options.skip_initialize {
            backend.initialize(ctx)?;
        }

        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_wires_default_memory_indexer() {
        let registry = Registry::with_defaults();
        let backend = registry
            .connect(
                &Context::background(),
                "memory://",
                &ConnectOptions::default(),
                &EngineConfig::default(),
            )
            .unwrap();

        assert_eq!(backend.name(), "memory");

        let collection = crate::dal::Collection::new("things");
        let indexer = backend.with_search(&collection, None).unwrap();
        assert!(indexer.get_backend().is_some());
        assert!(backend.with_aggregator(&collection).is_some());
    }

    #[test]
    fn unknown_schemes_are_rejected() {
        let registry = Registry::with_defaults();
        let ctx = Context::background();
        let config = EngineConfig::default();

        let err = registry
            .connect(&ctx, "postgres://db/app", &ConnectOptions::default(), &config)
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Unknown backend type \"postgres\"");

        let options = ConnectOptions::default().with_indexer("solr://localhost");
        let err = registry.connect(&ctx, "memory://", &options, &config).err().unwrap();
        assert!(matches!(err, QuarryError::UnknownIndexer(_)));
    }

    #[test]
    fn endpoint_overrides_host() {
        let registry = Registry::with_defaults();
        let options = ConnectOptions {
            endpoint: "other:1234".to_string(),
            skip_initialize: true,
            ..ConnectOptions::default()
        };

        let backend = registry
            .connect(
                &Context::background(),
                "memory://localhost",
                &options,
                &EngineConfig::default(),
            )
            .unwrap();
        assert_eq!(backend.connection_string().host(), "other:1234");
    }
}
