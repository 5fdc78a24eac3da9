mod common;

use common::{CountingBackend, seed_users};
use quarry::backends::{Backend, ConnectionString, MemoryBackend};
use quarry::{CachingBackend, ConnectOptions, Context, Record, Value};
use std::sync::Arc;
use std::thread;

fn cached() -> (Arc<CountingBackend>, CachingBackend) {
    let memory: Arc<dyn Backend> = Arc::new(MemoryBackend::new(
        ConnectionString::parse("memory://").unwrap(),
        &ConnectOptions::default(),
    ));
    let counting = Arc::new(CountingBackend::new(memory));
    let cache = CachingBackend::new(counting.clone());
    (counting, cache)
}

#[test]
fn test_second_retrieve_is_served_from_cache() {
    let (counting, cache) = cached();
    seed_users(&cache, 3);
    let ctx = Context::background();

    let first = cache.retrieve(&ctx, "users", &Value::Int(1), &[]).unwrap();
    let second = cache.retrieve(&ctx, "users", &Value::Int(1), &[]).unwrap();

    assert_eq!(counting.retrieve_count(), 1);
    assert_eq!(first.get("name"), second.get("name"));

    let stats = cache.stats();
    assert_eq!(stats.hit_count, 1);
    assert_eq!(stats.miss_count, 1);
    assert_eq!(stats.item_count, 1);
    assert_eq!(stats.hit_ratio, 0.5);
}

#[test]
fn test_reset_cache_calls_through_again() {
    let (counting, cache) = cached();
    seed_users(&cache, 2);
    let ctx = Context::background();

    cache.retrieve(&ctx, "users", &Value::Int(1), &[]).unwrap();
    cache.retrieve(&ctx, "users", &Value::Int(2), &[]).unwrap();
    cache.reset_cache();
    cache.retrieve(&ctx, "users", &Value::Int(1), &[]).unwrap();

    assert_eq!(counting.retrieve_count(), 3);
    assert_eq!(cache.stats().item_count, 1);
}

#[test]
fn test_composite_identities_bypass_cache() {
    let (counting, cache) = cached();
    let ctx = Context::background();
    let id = Value::Array(vec![Value::Int(1), Value::Int(2)]);

    for _ in 0..3 {
        let _ = cache.retrieve(&ctx, "users", &id, &[]);
    }

    assert_eq!(counting.retrieve_count(), 3);
    assert_eq!(cache.stats().item_count, 0);
}

#[test]
fn test_backend_errors_are_not_cached() {
    let (counting, cache) = cached();
    seed_users(&cache, 1);
    let ctx = Context::background();

    let err = cache.retrieve(&ctx, "users", &Value::Int(99), &[]).unwrap_err();
    assert!(err.is_not_found());
    assert!(cache.retrieve(&ctx, "users", &Value::Int(99), &[]).is_err());

    assert_eq!(counting.retrieve_count(), 2);
    assert_eq!(cache.stats().item_count, 0);
}

#[test]
fn test_projected_retrieve_does_not_populate() {
    let (counting, cache) = cached();
    seed_users(&cache, 1);
    let ctx = Context::background();
    let name = vec!["name".to_string()];

    let projected = cache.retrieve(&ctx, "users", &Value::Int(1), &name).unwrap();
    assert_eq!(projected.fields.len(), 1);
    assert_eq!(cache.stats().item_count, 0);

    // a cached full record serves later projections
    cache.retrieve(&ctx, "users", &Value::Int(1), &[]).unwrap();
    let projected = cache.retrieve(&ctx, "users", &Value::Int(1), &name).unwrap();
    assert_eq!(projected.fields.len(), 1);
    assert_eq!(counting.retrieve_count(), 2);
}

#[test]
fn test_writes_invalidate_cached_records() {
    let (counting, cache) = cached();
    seed_users(&cache, 2);
    let ctx = Context::background();

    cache.retrieve(&ctx, "users", &Value::Int(1), &[]).unwrap();
    cache
        .update(&ctx, "users", &[Record::new(1).set("name", "renamed")], &["name".to_string()])
        .unwrap();

    let fresh = cache.retrieve(&ctx, "users", &Value::Int(1), &[]).unwrap();
    assert_eq!(fresh.get_str("name"), Some("renamed"));
    assert_eq!(fresh.get_i64("age"), Some(21));
    assert_eq!(counting.retrieve_count(), 2);

    cache.delete(&ctx, "users", &[Value::Int(1)]).unwrap();
    assert!(cache.retrieve(&ctx, "users", &Value::Int(1), &[]).is_err());
}

#[test]
fn test_writes_with_string_identities_invalidate_typed_entries() {
    let (counting, cache) = cached();
    seed_users(&cache, 2);
    let ctx = Context::background();

    cache.retrieve(&ctx, "users", &Value::Int(1), &[]).unwrap();
    cache
        .update(&ctx, "users", &[Record::new("1").set("name", "renamed")], &["name".to_string()])
        .unwrap();

    let fresh = cache.retrieve(&ctx, "users", &Value::Int(1), &[]).unwrap();
    assert_eq!(fresh.get_str("name"), Some("renamed"));
    assert_eq!(counting.retrieve_count(), 2);

    // "2" and 2 share one entry
    cache.retrieve(&ctx, "users", &Value::from("2"), &[]).unwrap();
    cache.retrieve(&ctx, "users", &Value::Int(2), &[]).unwrap();
    assert_eq!(counting.retrieve_count(), 3);

    cache.delete(&ctx, "users", &[Value::from("2")]).unwrap();
    assert!(cache.retrieve(&ctx, "users", &Value::Int(2), &[]).unwrap_err().is_not_found());
}

#[test]
fn test_delete_collection_drops_its_entries() {
    let (_, cache) = cached();
    seed_users(&cache, 2);
    let ctx = Context::background();

    cache.retrieve(&ctx, "users", &Value::Int(1), &[]).unwrap();
    assert_eq!(cache.stats().item_count, 1);

    cache.delete_collection(&ctx, "users").unwrap();
    assert_eq!(cache.stats().item_count, 0);
}

#[test]
fn test_concurrent_misses_are_safe() {
    let (counting, cache) = cached();
    seed_users(&cache, 50);
    let cache = Arc::new(cache);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                let ctx = Context::background();
                for id in 1..=50 {
                    let record = cache.retrieve(&ctx, "users", &Value::Int(id), &[]).unwrap();
                    assert_eq!(record.id, Value::Int(id));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = cache.stats();
    assert_eq!(stats.item_count, 50);
    assert_eq!(stats.hit_count + stats.miss_count, 400);
    assert!(counting.retrieve_count() >= 50);
    assert!(counting.retrieve_count() <= 400);
}
