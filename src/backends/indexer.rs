use super::{Aggregator, Backend, ConnectionString};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::dal::{Collection, Record, RecordSet};
use crate::error::{QuarryError, Result};
use crate::filter::Filter;
use crate::types::Value;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Pagination state attached to every match surfaced by an indexer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexPage {
    pub page: usize,
    pub total_pages: usize,
    pub limit: usize,
    pub offset: usize,
    /// `None` when the backend does not know the full result size.
    pub total_results: Option<u64>,
}

impl IndexPage {
    /// Page metadata for a window of `limit` records starting at `offset`
    /// out of `total`. A zero `limit` is replaced by `fallback_limit`.
    pub fn for_window(offset: usize, limit: usize, total: Option<u64>, fallback_limit: usize) -> Self {
        let page_limit = if limit > 0 { limit } else { fallback_limit.max(1) };

        let total_pages = match total {
            Some(_) if limit == 0 => 1,
            Some(t) => (t as usize).div_ceil(page_limit),
            None => 0,
        };

        Self {
            page: (offset + 1).div_ceil(page_limit),
            total_pages,
            limit: page_limit,
            offset,
            total_results: total,
        }
    }
}

/// Per-match callback. `Break` stops the query early without an error.
pub type ResultFn<'a> = dyn FnMut(Record, &IndexPage) -> Result<ControlFlow<()>> + 'a;

/// Executes filters against a search index and keeps it in step with writes.
pub trait Indexer: Send + Sync {
    fn index_connection_string(&self) -> &ConnectionString;

    fn engine_config(&self) -> &EngineConfig;

    /// Attach the owning backend. The reference is weak; the backend owns
    /// its indexers, not the other way round.
    fn index_initialize(&self, parent: Weak<dyn Backend>) -> Result<()>;

    fn get_backend(&self) -> Option<Arc<dyn Backend>>;

    fn index_exists(&self, ctx: &Context, collection: &Collection, id: &Value) -> Result<bool>;

    fn index_retrieve(&self, ctx: &Context, collection: &Collection, id: &Value) -> Result<Record>;

    fn index_remove(&self, ctx: &Context, collection: &Collection, ids: &[Value]) -> Result<()>;

    fn index(&self, ctx: &Context, collection: &Collection, records: &[Record]) -> Result<()>;

    /// Stream every match of `filter` to `result_fn`, in result order.
    fn query_func(
        &self,
        ctx: &Context,
        collection: &Collection,
        filter: Option<&Filter>,
        result_fn: &mut ResultFn<'_>,
    ) -> Result<()>;

    /// Run `filter`, forwarding matches to `result_fn` when given or
    /// accumulating them otherwise.
    fn query(
        &self,
        ctx: &Context,
        collection: &Collection,
        filter: Option<&Filter>,
        result_fn: Option<&mut ResultFn<'_>>,
    ) -> Result<RecordSet> {
        default_query(self, ctx, collection, filter, result_fn)
    }

    /// Distinct values of each field among the records matching `filter`.
    fn list_values(
        &self,
        ctx: &Context,
        collection: &Collection,
        fields: &[String],
        filter: Option<&Filter>,
    ) -> Result<HashMap<String, Vec<Value>>>;

    fn delete_query(&self, ctx: &Context, collection: &Collection, filter: Option<&Filter>)
    -> Result<()>;

    fn flush_index(&self, ctx: &Context) -> Result<()>;

    /// The aggregator view of this indexer, when it has one.
    fn aggregator(self: Arc<Self>) -> Option<Arc<dyn Aggregator>> {
        None
    }
}

/// Fold one page's metadata into the accumulating result set.
pub fn populate_page_details(records: &mut RecordSet, filter: &Filter, page: &IndexPage) {
    match page.total_results {
        Some(total) => {
            records.known_size = true;
            records.result_count = total;
        }
        None => records.result_count = records.len() as u64,
    }

    records.total_pages = if page.total_pages > 0 {
        page.total_pages
    } else if filter.limit > 0 {
        (records.result_count as usize).div_ceil(filter.limit)
    } else {
        1
    };

    if records.records_per_page == 0 {
        records.records_per_page = page.limit;
    }

    if page.limit > 0 {
        records.page = (filter.offset + 1).div_ceil(page.limit);
    }
}

/// Split a compound index identity back into the collection's identity and
/// compound fields. Components missing from the identity are taken from the
/// trailing compound fields of the record itself. Returns the full tuple the
/// owning backend stores the record under.
pub fn reconcile_compound_identity(
    collection: &Collection,
    record: &mut Record,
    fallback_joiner: &str,
) -> Result<Value> {
    let expected = collection.index_compound_fields.len();
    let joiner = collection.compound_joiner(fallback_joiner);

    let mut parts: Vec<Value> = match &record.id {
        Value::Array(items) => items.clone(),
        id => id
            .to_string()
            .split(joiner)
            .map(|part| Value::String(part.to_string()))
            .collect(),
    };

    if parts.len() < expected {
        let short = expected - parts.len();
        for field in &collection.index_compound_fields[expected - short..] {
            if let Some(value) = record.get(field).filter(|v| !v.is_null()) {
                parts.push(value.clone());
            }
        }
    }

    if parts.len() != expected {
        return Err(QuarryError::CompoundKey {
            id: record.id.to_string(),
            expected,
            got: parts.len(),
        });
    }

    let tuple = collection.lookup_key(&Value::Array(parts))?;
    let Value::Array(parts) = &tuple else {
        return Ok(tuple);
    };

    if let Some(first) = parts.first() {
        record.id = first.clone();
    }

    for (field, value) in collection.index_compound_fields[1..].iter().zip(&parts[1..]) {
        record.insert(field.clone(), value.clone());
    }

    Ok(tuple)
}

/// The query algorithm shared by every indexer: compound identity
/// reconciliation, id-only routing, authoritative fetch from the owning
/// backend, result delivery and pagination bookkeeping.
pub fn default_query<I: Indexer + ?Sized>(
    indexer: &I,
    ctx: &Context,
    collection: &Collection,
    filter: Option<&Filter>,
    mut result_fn: Option<&mut ResultFn<'_>>,
) -> Result<RecordSet> {
    let match_all = Filter::all();
    let f = filter.unwrap_or(&match_all);
    let parent = indexer.get_backend();
    let id_only = f.id_only();
    let force_index_record = f.force_index_record();
    let joiner = indexer.engine_config().compound_joiner.clone();
    let mut records = RecordSet::new();
    let mut matched = false;

    debug!(
        collection = %collection.name,
        id_only,
        force_index_record,
        "querying index"
    );

    indexer.query_func(ctx, collection, filter, &mut |mut index_record: Record, page: &IndexPage| {
        ctx.check()?;
        matched = true;

        let fetch_key = if collection.is_compound() {
            reconcile_compound_identity(collection, &mut index_record, &joiner)?
        } else {
            index_record.id.clone()
        };

        let match_error = index_record.error.clone();

        let record = if id_only {
            let mut empty = Record::new(index_record.id);
            empty.error = match_error;
            empty
        } else {
            match parent.as_ref() {
                Some(parent) if !force_index_record => {
                    match parent.retrieve(ctx, &collection.name, &fetch_key, &f.fields) {
                        Ok(mut record) => {
                            if record.error.is_none() {
                                record.error = match_error;
                            }
                            record
                        }
                        Err(err) => {
                            warn!(
                                collection = %collection.name,
                                id = %index_record.id,
                                error = %err,
                                "failed to retrieve indexed record"
                            );
                            Record::with_error(index_record.id, Arc::new(err))
                        }
                    }
                }
                _ => index_record,
            }
        };

        let flow = match result_fn.as_deref_mut() {
            Some(callback) => callback(record, page),
            None => {
                records.push(record);
                Ok(ControlFlow::Continue(()))
            }
        };

        populate_page_details(&mut records, f, page);
        flow
    })?;

    if !matched {
        let page_size = indexer.engine_config().page_size;
        let empty = IndexPage::for_window(f.offset, f.limit, Some(0), page_size);
        populate_page_details(&mut records, f, &empty);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::FieldType;

    fn variants() -> Collection {
        Collection::new("variants")
            .with_identity("id", FieldType::Int)
            .with_field(crate::dal::Field::new("variant", FieldType::Int))
            .with_compound_fields(["id", "variant"], None)
    }

    #[test]
    fn compound_identity_splits_on_joiner() {
        let mut record = Record::new("5:42");
        reconcile_compound_identity(&variants(), &mut record, ":").unwrap();
        assert_eq!(record.id, Value::Int(5));
        assert_eq!(record.get("variant"), Some(&Value::Int(42)));
    }

    #[test]
    fn compound_identity_recovers_trailing_fields() {
        let mut record = Record::new("5").set("variant", 42);
        reconcile_compound_identity(&variants(), &mut record, ":").unwrap();
        assert_eq!(record.id, Value::Int(5));
        assert_eq!(record.get("variant"), Some(&Value::Int(42)));
    }

    #[test]
    fn compound_identity_mismatch_names_counts() {
        let mut record = Record::new("5");
        let err = reconcile_compound_identity(&variants(), &mut record, ":").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Index item 5: expected 2 compound field components, got 1"
        );
    }

    #[test]
    fn page_details_prefer_backend_totals() {
        let filter = Filter::all().with_limit(10).with_offset(20);
        let mut records = RecordSet::new();
        let page = IndexPage {
            page: 3,
            total_pages: 0,
            limit: 10,
            offset: 20,
            total_results: Some(95),
        };

        populate_page_details(&mut records, &filter, &page);
        assert!(records.known_size);
        assert_eq!(records.result_count, 95);
        assert_eq!(records.total_pages, 10);
        assert_eq!(records.page, 3);
        assert_eq!(records.records_per_page, 10);
    }

    #[test]
    fn page_details_fall_back_to_row_count() {
        let mut records = RecordSet::from_records(vec![Record::new(1), Record::new(2)]);
        let page = IndexPage::default();

        populate_page_details(&mut records, &Filter::all(), &page);
        assert!(!records.known_size);
        assert_eq!(records.result_count, 2);
        assert_eq!(records.total_pages, 1);
    }

    #[test]
    fn window_pages_follow_limit() {
        let page = IndexPage::for_window(25, 10, Some(42), 100);
        assert_eq!(page.page, 3);
        assert_eq!(page.total_pages, 5);
        assert_eq!(page.limit, 10);

        let unbounded = IndexPage::for_window(0, 0, Some(42), 100);
        assert_eq!(unbounded.total_pages, 1);
        assert_eq!(unbounded.limit, 100);
    }
}
