//! Typed facade over a backend for one [`Model`].

use crate::backends::{Aggregator, Backend, IndexPage, Indexer};
use crate::context::Context;
use crate::dal::{Collection, Model, Record, RecordSet};
use crate::error::{QuarryError, Result};
use crate::filter::{Aggregate, Criterion, Filter};
use crate::types::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::debug;

pub struct Mapper<M: Model> {
    backend: Arc<dyn Backend>,
    collection: Collection,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> Clone for Mapper<M> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            collection: self.collection.clone(),
            _model: PhantomData,
        }
    }
}

fn decode<M: Model>(record: &Record) -> Result<M> {
    if let Some(err) = &record.error {
        return Err(QuarryError::Record {
            id: record.id.to_string(),
            cause: Arc::clone(err),
        });
    }
    M::from_record(record)
}

impl<M: Model> Mapper<M> {
    /// Registers the model's collection with `backend` so it can be created
    /// on initialize or on first write.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let collection = M::collection();
        backend.register_collection(collection.clone());

        Self {
            backend,
            collection,
            _model: PhantomData,
        }
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    fn indexer(&self) -> Result<Arc<dyn Indexer>> {
        self.backend
            .with_search(&self.collection, None)
            .ok_or_else(|| {
                QuarryError::Unsupported(format!(
                    "{}: backend {} has no search indexer",
                    self.collection.name,
                    self.backend.name()
                ))
            })
    }

    fn aggregator(&self) -> Result<Arc<dyn Aggregator>> {
        self.backend.with_aggregator(&self.collection).ok_or_else(|| {
            QuarryError::Unsupported(format!(
                "{}: backend {} has no aggregator",
                self.collection.name,
                self.backend.name()
            ))
        })
    }

    /// Create the collection if the backend does not have it yet.
    pub fn migrate(&self, ctx: &Context) -> Result<()> {
        match self.backend.create_collection(ctx, self.collection.clone()) {
            Err(QuarryError::CollectionAlreadyExists(_)) | Ok(()) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn drop_collection(&self, ctx: &Context) -> Result<()> {
        self.backend.delete_collection(ctx, &self.collection.name)
    }

    pub fn exists(&self, ctx: &Context, id: impl Into<Value>) -> Result<bool> {
        self.backend.exists(ctx, &self.collection.name, &id.into())
    }

    pub fn create(&self, ctx: &Context, item: &M) -> Result<()> {
        self.backend
            .insert(ctx, &self.collection.name, &[item.to_record()])
    }

    pub fn get(&self, ctx: &Context, id: impl Into<Value>) -> Result<M> {
        let record = self
            .backend
            .retrieve(ctx, &self.collection.name, &id.into(), &[])?;
        decode(&record)
    }

    pub fn update(&self, ctx: &Context, item: &M) -> Result<()> {
        self.backend
            .update(ctx, &self.collection.name, &[item.to_record()], &[])
    }

    pub fn create_or_update(&self, ctx: &Context, item: &M) -> Result<()> {
        if self.exists(ctx, item.id())? {
            self.update(ctx, item)
        } else {
            self.create(ctx, item)
        }
    }

    pub fn delete(&self, ctx: &Context, ids: &[Value]) -> Result<()> {
        self.backend.delete(ctx, &self.collection.name, ids)
    }

    /// Delete every record matching `filter` from the backend and its indexes.
    pub fn delete_query(&self, ctx: &Context, filter: &Filter) -> Result<usize> {
        let mut probe = filter.clone().with_id_only();
        probe.limit = 0;
        probe.offset = 0;

        let ids = self
            .indexer()?
            .query(ctx, &self.collection, Some(&probe), None)?
            .ids();

        debug!(collection = %self.collection.name, count = ids.len(), "deleting by query");

        if !ids.is_empty() {
            self.delete(ctx, &ids)?;
        }
        Ok(ids.len())
    }

    /// Records whose `field` equals `value`.
    pub fn find(&self, ctx: &Context, field: &str, value: impl Into<Value>) -> Result<Vec<M>> {
        self.list_with_filter(ctx, &Filter::all().with(Criterion::is(field, value)))
    }

    /// Stream decoded matches of `filter` to `each` until it breaks.
    pub fn find_func<F>(&self, ctx: &Context, filter: &Filter, mut each: F) -> Result<()>
    where
        F: FnMut(M, &IndexPage) -> Result<ControlFlow<()>>,
    {
        let mut forward = |record: Record, page: &IndexPage| -> Result<ControlFlow<()>> {
            each(decode(&record)?, page)
        };

        self.indexer()?
            .query(ctx, &self.collection, Some(filter), Some(&mut forward))?;
        Ok(())
    }

    pub fn all(&self, ctx: &Context) -> Result<Vec<M>> {
        self.list_with_filter(ctx, &Filter::all())
    }

    pub fn each<F>(&self, ctx: &Context, mut each: F) -> Result<()>
    where
        F: FnMut(M) -> Result<ControlFlow<()>>,
    {
        self.find_func(ctx, &Filter::all(), |item, _| each(item))
    }

    /// Distinct values of `fields` across the collection.
    pub fn list(&self, ctx: &Context, fields: &[String]) -> Result<HashMap<String, Vec<Value>>> {
        self.indexer()?
            .list_values(ctx, &self.collection, fields, None)
    }

    pub fn list_with_filter(&self, ctx: &Context, filter: &Filter) -> Result<Vec<M>> {
        self.query(ctx, filter)?.iter().map(decode).collect()
    }

    /// The raw result set, including pagination details.
    pub fn query(&self, ctx: &Context, filter: &Filter) -> Result<RecordSet> {
        self.indexer()?
            .query(ctx, &self.collection, Some(filter), None)
    }

    pub fn sum(&self, ctx: &Context, field: &str, filter: Option<&Filter>) -> Result<f64> {
        self.aggregator()?.sum(ctx, &self.collection, field, filter)
    }

    pub fn count(&self, ctx: &Context, filter: Option<&Filter>) -> Result<u64> {
        self.aggregator()?.count(ctx, &self.collection, filter)
    }

    pub fn minimum(&self, ctx: &Context, field: &str, filter: Option<&Filter>) -> Result<f64> {
        self.aggregator()?
            .minimum(ctx, &self.collection, field, filter)
    }

    pub fn maximum(&self, ctx: &Context, field: &str, filter: Option<&Filter>) -> Result<f64> {
        self.aggregator()?
            .maximum(ctx, &self.collection, field, filter)
    }

    pub fn average(&self, ctx: &Context, field: &str, filter: Option<&Filter>) -> Result<f64> {
        self.aggregator()?
            .average(ctx, &self.collection, field, filter)
    }

    pub fn group_by(
        &self,
        ctx: &Context,
        group_by: &[String],
        aggregates: &[Aggregate],
        filter: Option<&Filter>,
    ) -> Result<RecordSet> {
        self.aggregator()?
            .group_by(ctx, &self.collection, group_by, aggregates, filter)
    }
}
