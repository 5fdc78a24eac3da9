mod common;

use common::{counted_memory, seed_users};
use quarry::backends::elasticsearch::{SearchTransport, TransportRequest, TransportResponse};
use quarry::backends::{Aggregator, ConnectionString, ElasticsearchIndexer, Indexer};
use quarry::{
    Aggregate, Aggregation, Collection, Context, Criterion, EngineConfig, FieldType, Filter,
    Operator, QuarryError, Result, Value,
};
use parking_lot::Mutex;
use serde_json::{Value as JsonValue, json};
use std::collections::VecDeque;
use std::sync::Arc;

#[test]
fn test_memory_rollups() {
    let h = counted_memory(EngineConfig::default());
    seed_users(h.backend.as_ref(), 10);
    let ctx = Context::background();
    let users = h.backend.get_collection("users").unwrap();
    let agg = h.backend.with_aggregator(&users).unwrap();

    // ages are 21..=29 for ids 1..=9 and 20 for id 10
    assert_eq!(agg.sum(&ctx, &users, "age", None).unwrap(), 245.0);
    assert_eq!(agg.minimum(&ctx, &users, "age", None).unwrap(), 20.0);
    assert_eq!(agg.maximum(&ctx, &users, "age", None).unwrap(), 29.0);
    assert_eq!(agg.average(&ctx, &users, "age", None).unwrap(), 24.5);

    let wellington = Filter::all().with(Criterion::is("city", "Wellington"));
    assert_eq!(agg.count(&ctx, &users, Some(&wellington)).unwrap(), 5);
    assert_eq!(agg.sum(&ctx, &users, "age", Some(&wellington)).unwrap(), 120.0);
}

#[test]
fn test_count_matches_result_size() {
    let h = counted_memory(EngineConfig::default().with_page_size(3));
    seed_users(h.backend.as_ref(), 37);
    let ctx = Context::background();
    let users = h.backend.get_collection("users").unwrap();
    let agg = h.backend.with_aggregator(&users).unwrap();

    for (filter, expected) in [
        (Filter::all(), 37),
        (Filter::all().with(Criterion::new("age", Operator::Gte, [25])), 18),
        (Filter::all().with(Criterion::is("name", "nobody")), 0),
    ] {
        let count = agg.count(&ctx, &users, Some(&filter)).unwrap();
        let all = h.indexer.query(&ctx, &users, Some(&filter), None).unwrap();
        assert_eq!(count, expected);
        assert_eq!(count, all.len() as u64);
    }

    // counting is id-only and never touches the backend
    assert_eq!(h.counting.retrieve_count(), 37 + 18);
}

#[test]
fn test_empty_set_rollups_are_zero() {
    let h = counted_memory(EngineConfig::default());
    seed_users(h.backend.as_ref(), 3);
    let ctx = Context::background();
    let users = h.backend.get_collection("users").unwrap();
    let agg = h.backend.with_aggregator(&users).unwrap();

    let none = Filter::all().with(Criterion::is("city", "Nelson"));
    assert_eq!(agg.sum(&ctx, &users, "age", Some(&none)).unwrap(), 0.0);
    assert_eq!(agg.average(&ctx, &users, "age", Some(&none)).unwrap(), 0.0);
    assert_eq!(agg.count(&ctx, &users, Some(&none)).unwrap(), 0);
}

#[test]
fn test_memory_group_by() {
    let h = counted_memory(EngineConfig::default());
    seed_users(h.backend.as_ref(), 6);
    let ctx = Context::background();
    let users = h.backend.get_collection("users").unwrap();
    let agg = h.backend.with_aggregator(&users).unwrap();

    let groups = agg
        .group_by(
            &ctx,
            &users,
            &["city".to_string()],
            &[Aggregate::count(), Aggregate::new(Aggregation::Maximum, "age")],
            None,
        )
        .unwrap();

    assert_eq!(groups.len(), 2);
    let auckland = &groups.records[0];
    assert_eq!(auckland.id, Value::from("Auckland"));
    assert_eq!(auckland.get("city"), Some(&Value::from("Auckland")));
    assert_eq!(auckland.get("count"), Some(&Value::Int(3)));
    assert_eq!(auckland.get("max_age"), Some(&Value::Float(25.0)));

    let whole = agg
        .group_by(&ctx, &users, &[], &[Aggregate::count()], None)
        .unwrap();
    assert_eq!(whole.len(), 1);
    assert_eq!(whole.records[0].get("count"), Some(&Value::Int(6)));
}

#[derive(Default)]
struct Scripted {
    responses: Mutex<VecDeque<TransportResponse>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl Scripted {
    fn then(self, status: u16, body: JsonValue) -> Self {
        self.responses
            .lock()
            .push_back(TransportResponse::new(status, body.to_string()));
        self
    }
}

impl SearchTransport for Scripted {
    fn send(&self, _ctx: &Context, request: &TransportRequest) -> Result<TransportResponse> {
        self.requests.lock().push(request.clone());
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| QuarryError::Transport("no scripted response".into()))
    }
}

fn orders() -> Collection {
    Collection::new("orders").with_identity("id", FieldType::Int)
}

fn search_indexer(transport: Arc<Scripted>) -> Arc<ElasticsearchIndexer> {
    Arc::new(ElasticsearchIndexer::with_transport(
        ConnectionString::parse("elasticsearch://search:9200").unwrap(),
        EngineConfig::default(),
        transport,
    ))
}

#[test]
fn test_search_engine_count_reads_total() {
    let transport = Arc::new(Scripted::default().then(
        200,
        json!({"hits": {"total": {"value": 1234, "relation": "eq"}, "hits": [{"_id": "1"}]}}),
    ));
    let es = search_indexer(Arc::clone(&transport));
    let agg = es.clone().aggregator().unwrap();

    let count = agg.count(&Context::background(), &orders(), None).unwrap();
    assert_eq!(count, 1234);

    let requests = transport.requests.lock();
    assert_eq!(requests.len(), 1);
    let body = requests[0].json_body().unwrap();
    assert_eq!(body["size"], 1);
    assert_eq!(body["_source"], false);
}

#[test]
fn test_search_engine_count_with_no_hits() {
    let transport = Arc::new(Scripted::default().then(200, json!({"hits": {"total": 0, "hits": []}})));
    let es = search_indexer(transport);
    let agg = es.clone().aggregator().unwrap();

    assert_eq!(agg.count(&Context::background(), &orders(), None).unwrap(), 0);
}

#[test]
fn test_search_engine_stats_use_field_key() {
    let transport = Arc::new(Scripted::default().then(
        200,
        json!({"aggregations": {"amount": {"count": 4, "sum": 10.0, "min": 1.0, "max": 4.0, "avg": 2.5}}}),
    ));
    let es = search_indexer(Arc::clone(&transport));
    let agg = es.clone().aggregator().unwrap();

    let avg = agg
        .average(&Context::background(), &orders(), "amount", None)
        .unwrap();
    assert_eq!(avg, 2.5);

    let requests = transport.requests.lock();
    assert_eq!(requests[0].path, "/orders/_search");
    let body = requests[0].json_body().unwrap();
    assert_eq!(body, json!({"aggs": {"amount": {"stats": {"field": "amount"}}}, "size": 0}));
}

#[test]
fn test_search_engine_failure_is_hard_error() {
    let transport = Arc::new(Scripted::default().then(502, json!({})));
    let es = search_indexer(transport);
    let agg = es.clone().aggregator().unwrap();

    let err = agg
        .sum(&Context::background(), &orders(), "amount", None)
        .unwrap_err();
    assert!(matches!(err, QuarryError::HttpStatus { status: 502, .. }));
}

#[test]
fn test_search_engine_undecodable_response() {
    let transport = Arc::new(Scripted::default());
    transport
        .responses
        .lock()
        .push_back(TransportResponse::new(200, "not json"));
    let es = search_indexer(transport);
    let agg = es.clone().aggregator().unwrap();

    let err = agg
        .maximum(&Context::background(), &orders(), "amount", None)
        .unwrap_err();
    assert!(matches!(err, QuarryError::ResponseDecode(_)));
}
