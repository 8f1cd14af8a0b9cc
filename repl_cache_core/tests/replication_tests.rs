mod common;

use common::{ids, TestCluster};
use repl_cache_core::cache::{Cache, WriteOptions};
use repl_cache_core::events::CacheEvent;
use repl_cache_core::{CacheError, NodeId, TopologyInfo};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn batch(prefix: &str, n: usize) -> BTreeMap<String, String> {
    (0..n).map(|i| (format!("{}-{}", prefix, i), format!("v{}", i))).collect()
}

#[tokio::test]
async fn test_sync_put_survives_owner_crash_with_partial_failure() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    let (a, b, c) = (cluster.node("a"), cluster.node("b"), cluster.node("c"));

    a.put("x", "1".into(), WriteOptions::sync()).await.unwrap();
    for node in [a, b, c] {
        assert_eq!(node.get("x").await.unwrap().as_deref(), Some("1"));
    }

    cluster.kill("c").await;
    match a.put("x", "2".into(), WriteOptions::sync()).await {
        Err(CacheError::PartialReplicationFailure { unreachable, key, .. }) => {
            assert_eq!(key, "x");
            assert_eq!(unreachable, ids(&["c"]));
        }
        other => panic!("expected partial replication failure, got {:?}", other),
    }
    assert_eq!(a.get("x").await.unwrap().as_deref(), Some("2"));
    assert_eq!(b.get("x").await.unwrap().as_deref(), Some("2"));
}

#[tokio::test]
async fn test_successful_sync_put_reaches_every_owner() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    let a = cluster.node("a");

    for i in 0..20 {
        let key = format!("key-{}", i);
        a.put(&key, format!("v{}", i), WriteOptions::sync()).await.unwrap();
        let owners = a.owners_for(&key);
        assert_eq!(owners.len(), 3);
        for owner in owners.owners() {
            let value = cluster.node(owner.id.as_str()).store().local_get(&key).await.unwrap();
            assert_eq!(value, Some(format!("v{}", i)));
        }
    }
}

#[tokio::test]
async fn test_partial_replication_places_on_owners_only() {
    let cluster = TestCluster::start_with(
        &[("a", TopologyInfo::new()), ("b", TopologyInfo::new()), ("c", TopologyInfo::new())],
        |config| config.replication.owner_count = Some(2),
    )
    .await;

    for i in 0..10 {
        let key = format!("p-{}", i);
        cluster.node("b").put(&key, "v".into(), WriteOptions::sync()).await.unwrap();

        let owners = cluster.node("a").owners_for(&key);
        assert_eq!(owners.len(), 2);
        for node in &cluster.nodes {
            let held = node.store().local_get(&key).await.unwrap().is_some();
            assert_eq!(held, owners.contains(&node.local().id), "key {} on {}", key, node.local().id);
            // Non-owners read through an owner
            assert_eq!(node.get(&key).await.unwrap().as_deref(), Some("v"));
        }
    }
}

#[tokio::test]
async fn test_async_put_returns_before_remote_owners_apply() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    for id in ["b", "c"] {
        cluster.network.set_latency(&NodeId::from(id), Duration::from_millis(100)).await;
    }

    let a = cluster.node("a");
    let start = Instant::now();
    for i in 0..5 {
        a.put(&format!("async-{}", i), format!("v{}", i), WriteOptions::asynchronous())
            .await
            .unwrap();
    }
    assert!(start.elapsed() < Duration::from_millis(90), "async puts waited on remote owners");
    assert_eq!(a.store().local_get("async-4").await.unwrap().as_deref(), Some("v4"));

    assert!(a.flush_replication(Duration::from_secs(5)).await);
    for id in ["b", "c"] {
        for i in 0..5 {
            let value = cluster.node(id).store().local_get(&format!("async-{}", i)).await.unwrap();
            assert_eq!(value, Some(format!("v{}", i)));
        }
    }
}

#[tokio::test]
async fn test_repeated_conditional_remove_reports_condition_not_met() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    let b = cluster.node("b");

    b.put("k", "v".into(), WriteOptions::sync()).await.unwrap();
    assert!(b.remove_if("k", "v", WriteOptions::sync()).await.unwrap());
    assert!(!b.remove_if("k", "v", WriteOptions::sync()).await.unwrap());
    assert!(!cluster.node("c").remove_if("k", "v", WriteOptions::sync()).await.unwrap());
    for node in &cluster.nodes {
        assert_eq!(node.store().local_get("k").await.unwrap(), None);
    }
}

#[tokio::test]
async fn test_concurrent_put_if_absent_has_one_winner() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;

    let mut tasks = Vec::new();
    for node in &cluster.nodes {
        let node = node.clone();
        tasks.push(tokio::spawn(async move {
            let value = format!("from-{}", node.local().id);
            let previous = node.put_if_absent("lock", value.clone(), WriteOptions::sync()).await.unwrap();
            (value, previous)
        }));
    }

    let mut winners = Vec::new();
    let mut observed = Vec::new();
    for task in tasks {
        let (value, previous) = task.await.unwrap();
        match previous {
            None => winners.push(value),
            Some(existing) => observed.push(existing),
        }
    }
    assert_eq!(winners.len(), 1);
    assert!(observed.iter().all(|v| *v == winners[0]));
    for node in &cluster.nodes {
        assert_eq!(node.store().local_get("lock").await.unwrap(), Some(winners[0].clone()));
    }
}

#[tokio::test]
async fn test_write_events_reach_listeners_on_every_owner() {
    use repl_cache_core::events::EventOrigin;

    let cluster = TestCluster::start(&["a", "b"]).await;
    let seen: Arc<Mutex<Vec<(String, EventOrigin)>>> = Arc::default();
    for node in &cluster.nodes {
        let seen = Arc::clone(&seen);
        node.subscribe(move |event: &CacheEvent| {
            if let CacheEvent::EntryWritten { key, origin, .. } = event {
                seen.lock().unwrap().push((key.clone(), *origin));
            }
        });
    }

    cluster.node("a").put("evt", "1".into(), WriteOptions::sync()).await.unwrap();
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|(key, _)| key == "evt"));
    assert!(seen.iter().any(|(_, origin)| *origin == EventOrigin::Local));
    assert!(seen.iter().any(|(_, origin)| *origin == EventOrigin::Replica));
}

#[tokio::test]
async fn test_slow_sync_write_does_not_hold_up_other_keys() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    cluster.network.set_latency(&NodeId::from("c"), Duration::from_millis(120)).await;

    let a = Arc::clone(cluster.node("a"));
    let keys: Vec<String> = (0..500)
        .map(|i| format!("k{}", i))
        .filter(|key| a.owners_for(key).is_primary(&a.local().id))
        .take(2)
        .collect();
    let (slow_key, other_key) = (keys[0].clone(), keys[1].clone());

    let slow = {
        let a = Arc::clone(&a);
        tokio::spawn(async move { a.put(&slow_key, "slow".into(), WriteOptions::sync()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let start = Instant::now();
    a.put(&other_key, "fast".into(), WriteOptions::asynchronous()).await.unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(50), "async put of {} waited {:?}", other_key, elapsed);

    slow.await.unwrap().unwrap();
    assert!(a.flush_replication(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_put_all_replicates_every_entry() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    let entries = batch("bulk", 10);

    cluster.node("b").put_all(entries.clone(), WriteOptions::sync()).await.unwrap();
    for node in &cluster.nodes {
        for (key, value) in &entries {
            assert_eq!(node.store().local_get(key).await.unwrap().as_ref(), Some(value));
        }
    }
    assert!(cluster.node("c").contains_key("bulk-3").await.unwrap());
    assert!(!cluster.node("c").contains_key("bulk-10").await.unwrap());
}

#[tokio::test]
async fn test_put_all_reports_unreachable_owner_after_writing_rest() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    cluster.kill("c").await;

    let entries = batch("most", 4);
    match cluster.node("a").put_all(entries.clone(), WriteOptions::sync()).await {
        Err(CacheError::PartialReplicationFailure { unreachable, .. }) => assert_eq!(unreachable, ids(&["c"])),
        other => panic!("expected partial replication failure, got {:?}", other),
    }
    for key in entries.keys() {
        assert!(cluster.node("b").store().local_get(key).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_size_and_key_set_count_each_key_once() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    cluster.node("a").put_all(batch("s", 5), WriteOptions::sync()).await.unwrap();

    let c = cluster.node("c");
    assert_eq!(c.size().await.unwrap(), 5);
    assert!(!c.is_empty().await.unwrap());
    let expected: BTreeSet<String> = batch("s", 5).into_keys().collect();
    assert_eq!(c.key_set().await.unwrap(), expected);

    cluster.kill("b").await;
    assert!(matches!(c.size().await, Err(CacheError::QueryPartial { failed }) if failed == ids(&["b"])));
}

#[tokio::test]
async fn test_clear_removes_every_copy() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    let b = cluster.node("b");
    assert!(b.is_empty().await.unwrap());

    b.put_all(batch("gone", 4), WriteOptions::sync()).await.unwrap();
    assert_eq!(cluster.node("c").clear(WriteOptions::sync()).await.unwrap(), 4);

    for node in &cluster.nodes {
        assert_eq!(node.store().local_len().await, 0);
    }
    assert!(b.is_empty().await.unwrap());
    assert_eq!(b.size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_evict_drops_only_the_local_copy() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    let evicted: Arc<Mutex<Vec<String>>> = Arc::default();
    {
        let evicted = Arc::clone(&evicted);
        cluster.node("b").subscribe(move |event: &CacheEvent| {
            if let CacheEvent::EntryEvicted { key } = event {
                evicted.lock().unwrap().push(key.clone());
            }
        });
    }

    cluster.node("a").put("hot", "1".into(), WriteOptions::sync()).await.unwrap();
    assert!(cluster.node("b").evict("hot").await.unwrap());
    assert!(!cluster.node("b").evict("hot").await.unwrap());

    assert_eq!(cluster.node("b").store().local_get("hot").await.unwrap(), None);
    for id in ["a", "c"] {
        assert_eq!(cluster.node(id).store().local_get("hot").await.unwrap().as_deref(), Some("1"));
    }
    assert_eq!(*evicted.lock().unwrap(), vec!["hot".to_string()]);
    // Still listed by the members that hold it
    assert!(cluster.node("b").key_set().await.unwrap().contains("hot"));
}
