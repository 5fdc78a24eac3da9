//! Elasticsearch-backed index.
//!
//! Queries are compiled by the Elasticsearch generator, paged through
//! `_search` in `page_size` windows, and streamed to the caller. Writes go
//! through `_bulk`. All HTTP traffic goes through a [`SearchTransport`] so
//! the wire plan can be exercised without a running cluster.

mod aggregator;
pub mod transport;

pub use transport::{HttpTransport, Method, SearchTransport, TransportRequest, TransportResponse};

use super::{Aggregator, Backend, ConnectionString, IndexPage, Indexer, ResultFn};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::dal::{Collection, Record};
use crate::error::{QuarryError, Result};
use crate::filter::Filter;
use crate::filter::generators::{ElasticsearchGenerator, Generator};
use crate::types::Value;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HitsTotal {
    Count(u64),
    Object { value: u64 },
}

impl HitsTotal {
    fn value(&self) -> u64 {
        match self {
            HitsTotal::Count(v) | HitsTotal::Object { value: v } => *v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Option<Map<String, JsonValue>>,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    total: Option<HitsTotal>,
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: Hits,
    #[serde(default)]
    aggregations: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source", default)]
    source: Option<Map<String, JsonValue>>,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<JsonValue>,
}

#[derive(Debug, Serialize)]
struct BulkAction<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_id")]
    id: &'a str,
}

pub struct ElasticsearchIndexer {
    conn: ConnectionString,
    config: EngineConfig,
    generator: ElasticsearchGenerator,
    transport: Arc<dyn SearchTransport>,
    parent: RwLock<Option<Weak<dyn Backend>>>,
}

fn encode<T: Serialize + ?Sized>(body: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(body).map_err(|e| QuarryError::RequestEncode(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(body: JsonValue) -> Result<T> {
    serde_json::from_value(body).map_err(|e| QuarryError::ResponseDecode(e.to_string()))
}

impl ElasticsearchIndexer {
    pub fn new(conn: ConnectionString, config: EngineConfig) -> Self {
        let transport = Arc::new(HttpTransport::from_connection(&conn, &config));
        Self::with_transport(conn, config, transport)
    }

    pub fn with_transport(
        conn: ConnectionString,
        config: EngineConfig,
        transport: Arc<dyn SearchTransport>,
    ) -> Self {
        info!(connection = %conn, "creating elasticsearch indexer");

        Self {
            generator: ElasticsearchGenerator::from_config(&config),
            conn,
            config,
            transport,
            parent: RwLock::new(None),
        }
    }

    /// Send a request and decode a successful JSON response.
    fn request(&self, ctx: &Context, request: TransportRequest) -> Result<JsonValue> {
        self.transport
            .send(ctx, &request)?
            .error_for_status()?
            .json()
    }

    fn refresh_suffix(&self) -> &'static str {
        if self.conn.opt_bool("refresh") {
            "?refresh=true"
        } else {
            ""
        }
    }

    fn query_clause(&self, filter: Option<&Filter>) -> Result<Option<JsonValue>> {
        match filter {
            Some(f) => Ok(self
                .generator
                .render_query(f)
                .map_err(QuarryError::render)?
                .query),
            None => Ok(None),
        }
    }

    /// Turn a stored document back into a record of `collection`.
    fn to_record(
        &self,
        collection: &Collection,
        id: String,
        source: Option<Map<String, JsonValue>>,
    ) -> Record {
        let raw = Value::String(id);
        let id = if collection.is_compound() {
            raw
        } else {
            collection.coerce_identity(raw.clone()).unwrap_or(raw)
        };

        let mut record = Record::new(id);
        for (key, value) in source.unwrap_or_default() {
            if key == collection.identity_field {
                continue;
            }
            let value = Value::from_json(&value);
            let value = collection.coerce_field(&key, value.clone()).unwrap_or(value);
            record.fields.insert(key, value);
        }
        record
    }

    fn search(&self, ctx: &Context, collection: &Collection, body: &JsonValue) -> Result<SearchResponse> {
        let path = format!("/{}/_search", collection.index_name());
        decode(self.request(ctx, TransportRequest::post(path, encode(body)?))?)
    }

    fn send_bulk(&self, ctx: &Context, body: Vec<u8>) -> Result<()> {
        let path = format!("/_bulk{}", self.refresh_suffix());
        let response: BulkResponse = decode(self.request(ctx, TransportRequest::bulk(path, body))?)?;

        if response.errors {
            let reason = response
                .items
                .iter()
                .filter_map(|item| item.as_object()?.values().next()?.get("error").cloned())
                .next()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "bulk request reported errors".to_string());
            return Err(QuarryError::Transport(reason));
        }

        Ok(())
    }
}

impl Indexer for ElasticsearchIndexer {
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
        let path = format!(
            "/{}/_doc/{}",
            collection.index_name(),
            collection.index_key(id, &self.config.compound_joiner)
        );
        let response = self.transport.send(ctx, &TransportRequest::get(path))?;

        if response.status == 404 {
            return Ok(false);
        }

        let doc: GetResponse = decode(response.error_for_status()?.json()?)?;
        Ok(doc.found)
    }

    fn index_retrieve(&self, ctx: &Context, collection: &Collection, id: &Value) -> Result<Record> {
        let path = format!(
            "/{}/_doc/{}",
            collection.index_name(),
            collection.index_key(id, &self.config.compound_joiner)
        );
        let response = self.transport.send(ctx, &TransportRequest::get(path))?;

        if response.status == 404 {
            return Err(QuarryError::NotFound(format!("{}/{}", collection.name, id)));
        }

        let doc: GetResponse = decode(response.error_for_status()?.json()?)?;
        if !doc.found {
            return Err(QuarryError::NotFound(format!("{}/{}", collection.name, id)));
        }

        Ok(self.to_record(collection, doc.id, doc.source))
    }

    /// Compound documents are keyed by the joined identity, so they are
    /// removed by query on the identity field instead of by document id.
    fn index_remove(&self, ctx: &Context, collection: &Collection, ids: &[Value]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        ctx.check()?;

        // a bare identity in a compound collection names every tuple it leads
        let (leading, exact): (Vec<&Value>, Vec<&Value>) = ids
            .iter()
            .partition(|id| collection.is_compound() && !matches!(id, Value::Array(_)));

        if !leading.is_empty() {
            let mut terms = Map::new();
            terms.insert(
                collection.identity_field.clone(),
                leading.iter().map(|id| id.to_json()).collect(),
            );
            let body = json!({ "query": { "terms": terms } });
            let path = format!("/{}/_delete_by_query", collection.index_name());
            self.request(ctx, TransportRequest::post(path, encode(&body)?))?;
        }

        if exact.is_empty() {
            return Ok(());
        }

        let index = collection.index_name();
        let mut body = Vec::new();
        for id in exact {
            let id = collection.index_key(id, &self.config.compound_joiner);
            body.extend(encode(&json!({ "delete": BulkAction { index, id: &id } }))?);
            body.push(b'\n');
        }

        self.send_bulk(ctx, body)
    }

    fn index(&self, ctx: &Context, collection: &Collection, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        ctx.check()?;

        let index = collection.index_name();
        let mut body = Vec::new();

        for record in records {
            let id = collection.index_identity(record, &self.config.compound_joiner);
            let source: Map<String, JsonValue> = collection
                .map_from_record(record)?
                .into_iter()
                .map(|(k, v)| (k, v.to_json()))
                .collect();

            body.extend(encode(&json!({ "index": BulkAction { index, id: &id } }))?);
            body.push(b'\n');
            body.extend(encode(&source)?);
            body.push(b'\n');
        }

        debug!(index, count = records.len(), "bulk indexing");
        self.send_bulk(ctx, body)
    }

    /// Pages through `_search` until the window is filled, the engine runs
    /// out of hits, or the callback breaks.
    fn query_func(
        &self,
        ctx: &Context,
        collection: &Collection,
        filter: Option<&Filter>,
        result_fn: &mut ResultFn<'_>,
    ) -> Result<()> {
        let filter = filter.cloned().unwrap_or_default();
        let mut search = self
            .generator
            .render(collection.index_name(), &filter)
            .map_err(QuarryError::render)?
            .query;

        let page_size = self.config.page_size.max(1);
        let mut offset = filter.offset;
        let mut delivered = 0;

        loop {
            ctx.check()?;

            let size = if filter.limit > 0 {
                (filter.limit - delivered).min(page_size)
            } else {
                page_size
            };
            if size == 0 {
                break;
            }

            search.size = Some(size);
            search.from = (offset > 0).then_some(offset);

            let body = serde_json::to_value(&search)
                .map_err(|e| QuarryError::RequestEncode(e.to_string()))?;
            let response = self.search(ctx, collection, &body)?;

            let total = response.hits.total.as_ref().map(HitsTotal::value);
            let page = IndexPage::for_window(filter.offset, filter.limit, total, page_size);
            let count = response.hits.hits.len();

            debug!(index = collection.index_name(), offset, count, total, "search page");

            for hit in response.hits.hits {
                let record = self.to_record(collection, hit.id, hit.source);
                if result_fn(record, &page)?.is_break() {
                    return Ok(());
                }
            }

            delivered += count;
            offset += count;

            if count < size || total.is_some_and(|t| offset as u64 >= t) {
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

        let aggs: Map<String, JsonValue> = fields
            .iter()
            .map(|field| {
                let terms = json!({
                    "terms": { "field": field, "size": self.config.max_facet_cardinality }
                });
                (field.clone(), terms)
            })
            .collect();

        let mut body = json!({ "size": 0, "aggs": aggs });
        if let Some(query) = self.query_clause(filter)? {
            body["query"] = query;
        }

        let response = self.search(ctx, collection, &body)?;
        let aggregations = response.aggregations.unwrap_or(JsonValue::Null);

        let mut out = HashMap::new();
        for field in fields {
            let values = aggregations[field.as_str()]["buckets"]
                .as_array()
                .map(|buckets| {
                    buckets
                        .iter()
                        .map(|bucket| Value::from_json(&bucket["key"]))
                        .collect()
                })
                .unwrap_or_default();
            out.insert(field.clone(), values);
        }

        Ok(out)
    }

    fn delete_query(
        &self,
        ctx: &Context,
        collection: &Collection,
        filter: Option<&Filter>,
    ) -> Result<()> {
        ctx.check()?;

        let query = self
            .query_clause(filter)?
            .unwrap_or_else(|| json!({ "match_all": {} }));
        let path = format!("/{}/_delete_by_query", collection.index_name());

        match self.request(ctx, TransportRequest::post(path, encode(&json!({ "query": query }))?)) {
            Err(QuarryError::HttpStatus { status: 404, .. }) => {
                warn!(index = collection.index_name(), "delete on missing index");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    fn flush_index(&self, ctx: &Context) -> Result<()> {
        self.request(ctx, TransportRequest::post("/_refresh", Vec::new()))?;
        Ok(())
    }

    fn aggregator(self: Arc<Self>) -> Option<Arc<dyn Aggregator>> {
        Some(self)
    }
}
