use super::{ElasticsearchIndexer, TransportRequest, decode, encode};
use crate::backends::aggregator::count_via_query;
use crate::backends::{AggregateStats, Aggregator, ConnectionString, Indexer};
use crate::context::Context;
use crate::dal::{Collection, Record, RecordSet};
use crate::error::{QuarryError, Result};
use crate::filter::{Aggregate, Aggregation, Filter};
use crate::types::Value;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use tracing::debug;

/// Body of an aggregation request against the collection's aggregator index.
#[derive(Debug, Serialize)]
struct AggregationQuery {
    aggs: Map<String, JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<JsonValue>,
    size: usize,
}

#[derive(Debug, Deserialize)]
struct AggregationResponse {
    #[serde(default)]
    aggregations: Map<String, JsonValue>,
}

fn stats_agg(field: &str) -> JsonValue {
    json!({ "stats": { "field": field } })
}

fn stats_from(node: &JsonValue) -> AggregateStats {
    let number = |key: &str| node[key].as_f64().unwrap_or(0.0);

    AggregateStats {
        count: node["count"].as_u64().unwrap_or(0),
        sum: number("sum"),
        min: number("min"),
        max: number("max"),
        avg: number("avg"),
    }
}

impl ElasticsearchIndexer {
    fn run_aggregation(
        &self,
        ctx: &Context,
        collection: &Collection,
        aggs: Map<String, JsonValue>,
        filter: Option<&Filter>,
    ) -> Result<Map<String, JsonValue>> {
        ctx.check()?;

        let body = AggregationQuery {
            aggs,
            filter: self.query_clause(filter)?,
            size: 0,
        };
        let path = format!("/{}/_search", collection.aggregator_name());

        debug!(path, "aggregation request");

        let response: AggregationResponse =
            decode(self.request(ctx, TransportRequest::post(path, encode(&body)?))?)?;
        Ok(response.aggregations)
    }

    fn field_stats(
        &self,
        ctx: &Context,
        collection: &Collection,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<AggregateStats> {
        let mut aggs = Map::new();
        aggs.insert(field.to_string(), stats_agg(field));

        let aggregations = self.run_aggregation(ctx, collection, aggs, filter)?;
        let node = aggregations.get(field).ok_or_else(|| {
            QuarryError::ResponseDecode(format!("missing aggregation {:?}", field))
        })?;

        Ok(stats_from(node))
    }

    /// Terms aggregations nested one level per group field, with a `stats`
    /// leaf for every non-count aggregate.
    fn nested_aggs(&self, group_by: &[String], aggregates: &[Aggregate]) -> Map<String, JsonValue> {
        match group_by.split_first() {
            None => aggregates
                .iter()
                .filter(|a| a.aggregation != Aggregation::Count)
                .map(|a| (a.field.clone(), stats_agg(&a.field)))
                .collect(),
            Some((field, rest)) => {
                let mut terms = json!({
                    "terms": { "field": field, "size": self.config.max_facet_cardinality }
                });
                let children = self.nested_aggs(rest, aggregates);
                if !children.is_empty() {
                    terms["aggs"] = JsonValue::Object(children);
                }

                let mut aggs = Map::new();
                aggs.insert(field.clone(), terms);
                aggs
            }
        }
    }
}

/// Walk the bucket tree, emitting one record per leaf bucket.
fn collect_groups(
    node: &JsonValue,
    group_by: &[String],
    all_groups: &[String],
    key: Vec<Value>,
    doc_count: u64,
    aggregates: &[Aggregate],
    out: &mut RecordSet,
) {
    match group_by.split_first() {
        Some((field, rest)) => {
            let buckets = node[field.as_str()]["buckets"]
                .as_array()
                .cloned()
                .unwrap_or_default();

            for bucket in buckets {
                let mut key = key.clone();
                key.push(Value::from_json(&bucket["key"]));
                let count = bucket["doc_count"].as_u64().unwrap_or(0);
                collect_groups(&bucket, rest, all_groups, key, count, aggregates, out);
            }
        }
        None => {
            let id = match key.as_slice() {
                [single] => single.clone(),
                [] => Value::Null,
                _ => Value::Array(key.clone()),
            };
            let mut record = Record::new(id);

            for (field, value) in all_groups.iter().zip(key) {
                record.insert(field.clone(), value);
            }

            for aggregate in aggregates {
                let value = match aggregate.aggregation {
                    Aggregation::Count => Value::Int(doc_count as i64),
                    other => Value::Float(stats_from(&node[aggregate.field.as_str()]).get(other)),
                };
                record.insert(aggregate.result_key(), value);
            }

            out.push(record);
        }
    }
}

impl Aggregator for ElasticsearchIndexer {
    fn aggregator_connection_string(&self) -> &ConnectionString {
        self.index_connection_string()
    }

    fn sum(
        &self,
        ctx: &Context,
        collection: &Collection,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<f64> {
        Ok(self.field_stats(ctx, collection, field, filter)?.sum)
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
        Ok(self.field_stats(ctx, collection, field, filter)?.min)
    }

    fn maximum(
        &self,
        ctx: &Context,
        collection: &Collection,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<f64> {
        Ok(self.field_stats(ctx, collection, field, filter)?.max)
    }

    fn average(
        &self,
        ctx: &Context,
        collection: &Collection,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<f64> {
        Ok(self.field_stats(ctx, collection, field, filter)?.avg)
    }

    fn group_by(
        &self,
        ctx: &Context,
        collection: &Collection,
        group_by: &[String],
        aggregates: &[Aggregate],
        filter: Option<&Filter>,
    ) -> Result<RecordSet> {
        let aggs = self.nested_aggs(group_by, aggregates);

        let whole_set_count = if group_by.is_empty()
            && aggregates.iter().any(|a| a.aggregation == Aggregation::Count)
        {
            self.count(ctx, collection, filter)?
        } else {
            0
        };

        let aggregations = if aggs.is_empty() {
            Map::new()
        } else {
            self.run_aggregation(ctx, collection, aggs, filter)?
        };

        let mut results = RecordSet::new();
        collect_groups(
            &JsonValue::Object(aggregations),
            group_by,
            group_by,
            Vec::new(),
            whole_set_count,
            aggregates,
            &mut results,
        );

        results.result_count = results.len() as u64;
        results.known_size = true;
        results.total_pages = 1;
        results.page = 1;
        Ok(results)
    }
}
