//! Integration tests for `ensure_objects` and object leases.

mod common;

use async_trait::async_trait;
use common::{TestEnv, TestRemote, table};
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use strata_cache::{
    CacheError, CacheResult, EnsureRequest, ExternalObjectHandler, HandlerRegistry, ObjectLease,
};
use strata_core::{ColumnRange, ObjectId, ObjectIndex, ObjectLocation, Qual, QualOp, Quals};
use strata_metadata::ObjectRepo;
use strata_storage::ObjectStore;

fn id_range(min: i64, max: i64) -> ObjectIndex {
    let mut index = ObjectIndex::default();
    index.insert(
        "id",
        ColumnRange {
            min: json!(min),
            max: json!(max),
        },
    );
    index
}

/// Handler whose remote end is always unreachable.
struct UnreachableHandler;

#[async_trait]
impl ExternalObjectHandler for UnreachableHandler {
    async fn upload_objects(
        &self,
        _ids: &[ObjectId],
        _source: &dyn ObjectStore,
    ) -> CacheResult<Vec<String>> {
        Err(CacheError::transport("FAIL", "connection refused"))
    }

    async fn download_objects(
        &self,
        _objects: &[(ObjectId, String)],
        _target: &dyn ObjectStore,
    ) -> CacheResult<()> {
        Err(CacheError::transport("FAIL", "connection refused"))
    }
}

#[tokio::test]
async fn test_ensure_fetches_from_upstream_and_pins() {
    let env = TestEnv::new().await;
    let upstream = TestRemote::new("origin").await;
    let a = upstream.add_object(&env, "a", 100).await;
    let b = upstream.add_object(&env, "b", 200).await;
    let manager = env.manager(10_000);
    let t = table("people", vec![a.clone(), b.clone()]);

    let lease = manager
        .ensure_objects(EnsureRequest::new(&t).upstream(&upstream.remote))
        .await
        .unwrap();

    assert_eq!(lease.objects().to_vec(), vec![a.clone(), b.clone()]);
    assert!(env.has_local(&a).await);
    assert!(env.has_local(&b).await);
    assert_eq!(env.refcount(&a).await, Some(1));
    assert_eq!(env.is_ready(&b).await, Some(true));
    assert_eq!(manager.get_cache_occupancy().await.unwrap(), 300);

    lease.release().await.unwrap();
    assert!(lease.is_released());
    assert_eq!(env.refcount(&a).await, Some(0));

    // Releasing again changes nothing.
    lease.release().await.unwrap();
    assert_eq!(env.refcount(&a).await, Some(0));
    assert_eq!(manager.recalculate_cache_occupancy().await.unwrap(), 300);
}

#[tokio::test]
async fn test_second_ensure_reuses_cached_objects() {
    let env = TestEnv::new().await;
    let upstream = TestRemote::new("origin").await;
    let a = upstream.add_object(&env, "a", 100).await;
    let manager = env.manager(10_000);
    let t = table("people", vec![a.clone()]);

    let first = manager
        .ensure_objects(EnsureRequest::new(&t).upstream(&upstream.remote))
        .await
        .unwrap();
    first.release().await.unwrap();
    assert_eq!(env.objects.puts(), 1);

    // No upstream needed the second time.
    let second = manager.ensure_objects(EnsureRequest::new(&t)).await.unwrap();
    assert_eq!(env.objects.puts(), 1);
    assert_eq!(second.claimed().to_vec(), vec![a.clone()]);
    assert_eq!(env.refcount(&a).await, Some(1));
    assert_eq!(manager.get_cache_occupancy().await.unwrap(), 100);
    second.release().await.unwrap();
}

#[tokio::test]
async fn test_empty_table_returns_empty_lease() {
    let env = TestEnv::new().await;
    let manager = env.manager(10_000);
    let t = table("empty", Vec::new());

    let lease = manager.ensure_objects(EnsureRequest::new(&t)).await.unwrap();
    assert!(lease.objects().is_empty());
    assert!(lease.claimed().is_empty());
    lease.release().await.unwrap();
}

#[tokio::test]
async fn test_explicit_object_list_is_deduplicated() {
    let env = TestEnv::new().await;
    let upstream = TestRemote::new("origin").await;
    let a = upstream.add_object(&env, "a", 100).await;
    let b = upstream.add_object(&env, "b", 100).await;
    let manager = env.manager(10_000);
    let t = table("people", vec![a.clone(), b.clone()]);

    let lease = manager
        .ensure_objects(
            EnsureRequest::new(&t)
                .objects(vec![b.clone(), b.clone()])
                .upstream(&upstream.remote),
        )
        .await
        .unwrap();

    assert_eq!(lease.objects().to_vec(), vec![b.clone()]);
    assert_eq!(env.refcount(&b).await, Some(1));
    assert!(!env.has_local(&a).await);
    lease.release().await.unwrap();
}

#[tokio::test]
async fn test_quals_skip_objects_outside_range() {
    let env = TestEnv::new().await;
    let upstream = TestRemote::new("origin").await;
    let low = upstream.add_object(&env, "low", 100).await;
    let high = upstream.add_object(&env, "high", 100).await;
    env.metadata
        .upsert_objects(&[
            common::meta("low", 100).with_index(id_range(1, 50)),
            common::meta("high", 100).with_index(id_range(51, 100)),
        ])
        .await
        .unwrap();

    let manager = env.manager(10_000);
    let t = table("people", vec![low.clone(), high.clone()]);
    let lease = manager
        .ensure_objects(
            EnsureRequest::new(&t)
                .quals(Quals::all([Qual::new("id", QualOp::Gt, 60)]))
                .upstream(&upstream.remote),
        )
        .await
        .unwrap();

    assert_eq!(lease.objects().to_vec(), vec![high.clone()]);
    assert!(env.has_local(&high).await);
    assert!(!env.has_local(&low).await);
    assert_eq!(env.refcount(&low).await, None);
    lease.release().await.unwrap();
}

#[tokio::test]
async fn test_quals_do_not_narrow_explicit_object_list() {
    let env = TestEnv::new().await;
    let upstream = TestRemote::new("origin").await;
    let low = upstream.add_object(&env, "low", 100).await;
    let high = upstream.add_object(&env, "high", 100).await;
    env.metadata
        .upsert_objects(&[
            common::meta("low", 100).with_index(id_range(1, 50)),
            common::meta("high", 100).with_index(id_range(51, 100)),
        ])
        .await
        .unwrap();

    let manager = env.manager(10_000);
    let t = table("people", vec![low.clone(), high.clone()]);
    let lease = manager
        .ensure_objects(
            EnsureRequest::new(&t)
                .objects(vec![low.clone(), high.clone()])
                .quals(Quals::all([Qual::new("id", QualOp::Gt, 60)]))
                .upstream(&upstream.remote),
        )
        .await
        .unwrap();

    assert_eq!(lease.objects().to_vec(), vec![low.clone(), high.clone()]);
    assert!(env.has_local(&low).await);
    assert!(env.has_local(&high).await);
    assert_eq!(env.refcount(&low).await, Some(1));
    lease.release().await.unwrap();
}

#[tokio::test]
async fn test_objects_stored_outside_cache_are_not_claimed() {
    let env = TestEnv::new().await;
    let x = env.store_local("x", 50).await;
    let manager = env.manager(10_000);
    let t = table("local", vec![x.clone()]);

    let lease = manager.ensure_objects(EnsureRequest::new(&t)).await.unwrap();
    assert_eq!(lease.objects().to_vec(), vec![x.clone()]);
    assert!(lease.claimed().is_empty());
    assert_eq!(env.refcount(&x).await, None);
    assert_eq!(manager.get_cache_occupancy().await.unwrap(), 0);
    lease.release().await.unwrap();
}

#[tokio::test]
async fn test_missing_object_is_integrity_error() {
    let env = TestEnv::new().await;
    let upstream = TestRemote::new("origin").await;
    let a = upstream.add_object(&env, "a", 100).await;
    // Known locally, but upstream never received it.
    let gone = env.register("gone", 10).await;
    let manager = env.manager(10_000);
    let t = table("people", vec![a.clone(), gone.clone()]);

    let err = manager
        .ensure_objects(EnsureRequest::new(&t).upstream(&upstream.remote))
        .await
        .unwrap_err();

    match err {
        CacheError::Integrity { missing, .. } => assert_eq!(missing, vec![gone.clone()]),
        other => panic!("expected integrity error, got {other:?}"),
    }

    // The object that did arrive is cached and released; the missing one
    // leaves no entry behind.
    assert_eq!(env.is_ready(&a).await, Some(true));
    assert_eq!(env.refcount(&a).await, Some(0));
    assert_eq!(env.refcount(&gone).await, None);
    assert_eq!(manager.get_cache_occupancy().await.unwrap(), 100);
}

#[tokio::test]
async fn test_no_source_is_integrity_error() {
    let env = TestEnv::new().await;
    let a = env.register("a", 100).await;
    let manager = env.manager(10_000);
    let t = table("people", vec![a.clone()]);

    let err = manager
        .ensure_objects(EnsureRequest::new(&t))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "integrity");
    assert!(err.to_string().contains(a.as_str()));
    assert_eq!(env.refcount(&a).await, None);
}

#[tokio::test]
async fn test_object_larger_than_capacity_fails_cleanly() {
    let env = TestEnv::new().await;
    let upstream = TestRemote::new("origin").await;
    let big = upstream.add_object(&env, "big", 600).await;
    let manager = env.manager(500);
    let t = table("big", vec![big.clone()]);

    let err = manager
        .ensure_objects(EnsureRequest::new(&t).upstream(&upstream.remote))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CacheError::Capacity {
            required: 600,
            available: 500
        }
    ));
    assert_eq!(env.refcount(&big).await, None);
    assert!(!env.has_local(&big).await);
    assert_eq!(manager.get_cache_occupancy().await.unwrap(), 0);
}

#[tokio::test]
async fn test_pinned_objects_are_not_evicted_for_room() {
    let env = TestEnv::new().await;
    let upstream = TestRemote::new("origin").await;
    let a = upstream.add_object(&env, "a", 600).await;
    let b = upstream.add_object(&env, "b", 600).await;
    let manager = env.manager(1000);

    let held = manager
        .ensure_objects(EnsureRequest::new(&table("a", vec![a.clone()])).upstream(&upstream.remote))
        .await
        .unwrap();

    let err = manager
        .ensure_objects(EnsureRequest::new(&table("b", vec![b.clone()])).upstream(&upstream.remote))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Capacity { .. }));

    assert!(env.has_local(&a).await);
    assert_eq!(env.refcount(&a).await, Some(1));
    assert_eq!(env.refcount(&b).await, None);
    held.release().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_ensures_fetch_once() {
    let env = TestEnv::new().await;
    let upstream = TestRemote::new("origin").await;
    let a = upstream.add_object(&env, "a", 100).await;
    let manager = env.manager(10_000);
    let t = table("people", vec![a.clone()]);

    let results = join_all((0..8).map(|_| {
        manager.ensure_objects(EnsureRequest::new(&t).upstream(&upstream.remote))
    }))
    .await;
    let leases: Vec<ObjectLease> = results.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(env.objects.puts(), 1);
    assert_eq!(env.refcount(&a).await, Some(8));
    assert_eq!(manager.get_cache_occupancy().await.unwrap(), 100);

    for lease in &leases {
        lease.release().await.unwrap();
    }
    assert_eq!(env.refcount(&a).await, Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_managers_on_separate_connections_share_entries() {
    let env = TestEnv::new().await;
    let upstream = TestRemote::new("origin").await;
    let a = upstream.add_object(&env, "a", 100).await;
    let b = upstream.add_object(&env, "b", 100).await;
    let first = env.manager(10_000);
    let second = env.second_manager(10_000).await;
    let t = table("people", vec![a.clone(), b.clone()]);

    let (one, two) = tokio::join!(
        first.ensure_objects(EnsureRequest::new(&t).upstream(&upstream.remote)),
        second.ensure_objects(EnsureRequest::new(&t).upstream(&upstream.remote)),
    );
    let (one, two) = (one.unwrap(), two.unwrap());

    assert_eq!(env.refcount(&a).await, Some(2));
    assert_eq!(env.refcount(&b).await, Some(2));
    assert_eq!(first.get_cache_occupancy().await.unwrap(), 200);
    assert_eq!(second.recalculate_cache_occupancy().await.unwrap(), 200);

    one.release().await.unwrap();
    two.release().await.unwrap();
    assert_eq!(env.refcount(&a).await, Some(0));
}

#[tokio::test]
async fn test_dropped_lease_releases_in_background() {
    let env = TestEnv::new().await;
    let upstream = TestRemote::new("origin").await;
    let a = upstream.add_object(&env, "a", 100).await;
    let manager = env.manager(10_000);
    let t = table("people", vec![a.clone()]);

    let lease = manager
        .ensure_objects(EnsureRequest::new(&t).upstream(&upstream.remote))
        .await
        .unwrap();
    assert_eq!(env.refcount(&a).await, Some(1));
    drop(lease);

    let mut refcount = env.refcount(&a).await;
    for _ in 0..100 {
        if refcount == Some(0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        refcount = env.refcount(&a).await;
    }
    assert_eq!(refcount, Some(0));
}

#[tokio::test]
async fn test_with_objects_releases_after_closure() {
    let env = TestEnv::new().await;
    let upstream = TestRemote::new("origin").await;
    let a = upstream.add_object(&env, "a", 100).await;
    let b = upstream.add_object(&env, "b", 100).await;
    let manager = env.manager(10_000);
    let t = table("people", vec![a.clone(), b.clone()]);

    let seen = manager
        .with_objects(
            EnsureRequest::new(&t).upstream(&upstream.remote),
            |ids| async move { ids },
        )
        .await
        .unwrap();

    assert_eq!(seen, vec![a.clone(), b.clone()]);
    assert_eq!(env.refcount(&a).await, Some(0));
    assert_eq!(env.refcount(&b).await, Some(0));
}

#[tokio::test]
async fn test_transport_failure_leaves_entries_pending() {
    let env = TestEnv::new().await;
    let upstream = TestRemote::new("origin").await;
    let a = upstream.add_object(&env, "a", 100).await;
    let t = table("people", vec![a.clone()]);

    let mut handlers = HandlerRegistry::new();
    handlers.register("FAIL", Arc::new(UnreachableHandler)).unwrap();
    let failing = env.manager(10_000).with_handlers(handlers);
    failing
        .register_object_locations(&[ObjectLocation {
            object_id: a.clone(),
            location: "fail://nowhere/a".to_string(),
            protocol: "FAIL".to_string(),
        }])
        .await
        .unwrap();

    let err = failing
        .ensure_objects(EnsureRequest::new(&t).upstream(&upstream.remote))
        .await
        .unwrap_err();
    match err {
        CacheError::Transport { handler, message } => {
            assert_eq!(handler, "FAIL");
            assert!(message.contains("connection refused"));
        }
        other => panic!("expected transport error, got {other:?}"),
    }
    assert!(!env.has_local(&a).await);
    assert_eq!(env.refcount(&a).await, Some(0));
    assert_eq!(env.is_ready(&a).await, Some(false));
    assert_eq!(failing.get_cache_occupancy().await.unwrap(), 0);

    // Without the broken handler the location is skipped and the peer
    // supplies the object.
    let manager = env.manager(10_000);
    let lease = manager
        .ensure_objects(EnsureRequest::new(&t).upstream(&upstream.remote))
        .await
        .unwrap();
    assert!(env.has_local(&a).await);
    assert_eq!(env.refcount(&a).await, Some(1));
    assert_eq!(env.is_ready(&a).await, Some(true));
    assert_eq!(manager.get_cache_occupancy().await.unwrap(), 100);
    lease.release().await.unwrap();
}
