mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use common::TestCluster;
use repl_cache_core::cache::{Cache, StatsCache, WriteOptions};
use repl_cache_core::config::{CacheConfig, SeedNode};
use repl_cache_core::query::QueryDescriptor;
use repl_cache_core::replication::ReplicationMode;
use repl_cache_core::server::AdminServer;
use repl_cache_core::Predicate;
use std::sync::Arc;
use tempfile::tempdir;
use tower::ServiceExt;

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_admin_reports_cluster_state() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    let server = AdminServer::new(Arc::clone(cluster.node("b")), None);

    let (status, health) = get_json(server.create_router(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["node_id"], "b");
    assert_eq!(health["members"], 3);
    assert_eq!(health["peers"].as_array().unwrap().len(), 2);

    let (_, topology) = get_json(server.create_router(), "/topology").await;
    assert_eq!(topology["members"].as_array().unwrap().len(), 3);

    let (_, owners) = get_json(server.create_router(), "/owners/user:1").await;
    let expected = cluster.node("a").owners_for("user:1");
    assert_eq!(owners["primary"], expected.primary().unwrap().id.as_str());
    assert_eq!(owners["owners"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_admin_health_unavailable_when_degraded() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    cluster.kill("b").await;
    cluster.kill("c").await;
    assert!(cluster.node("a").leave().await.is_err());

    let server = AdminServer::new(Arc::clone(cluster.node("a")), None);
    let (status, health) = get_json(server.create_router(), "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["degraded"]["required"], 2);
}

#[tokio::test]
async fn test_stats_decorator_over_cluster_node() {
    let cluster = TestCluster::start(&["a", "b"]).await;
    let cache = StatsCache::new(Arc::clone(cluster.node("a")));

    cache.put("k", "v".into(), WriteOptions::sync()).await.unwrap();
    assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
    assert_eq!(cache.get("missing").await.unwrap(), None);
    assert!(!cache.replace_if("k", "nope", "w".into(), WriteOptions::sync()).await.unwrap());
    cache.run_query(QueryDescriptor::new(Predicate::All)).await;

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.writes, 2);
    assert_eq!(stats.conditions_not_met, 1);
    assert_eq!(stats.queries, 1);
    assert_eq!(stats.partial_queries, 0);
    assert_eq!(cache.current_topology().len(), 2);
}

#[test]
fn test_config_file_roundtrip() {
    let dir = tempdir().unwrap();

    let mut config = CacheConfig::default();
    config.cluster.node_id = "n7".to_string();
    config.cluster.site_id = Some("east".to_string());
    config.cluster.seed_nodes = vec![SeedNode::parse("n1@10.0.0.1:7000").unwrap()];
    config.replication.mode = ReplicationMode::Async;
    config.replication.owner_count = Some(2);

    let toml_path = dir.path().join("node.toml");
    config.save_to_file(&toml_path).unwrap();
    let loaded = CacheConfig::load(&toml_path).unwrap();
    assert_eq!(loaded.cluster.node_id, "n7");
    assert_eq!(loaded.cluster.seed_nodes, config.cluster.seed_nodes);
    assert_eq!(loaded.replication.mode, ReplicationMode::Async);
    assert_eq!(loaded.replication.owner_count, Some(2));

    let yaml_path = dir.path().join("node.yaml");
    config.save_to_yaml_file(&yaml_path).unwrap();
    let loaded = CacheConfig::load(&yaml_path).unwrap();
    assert_eq!(loaded.cluster.site_id.as_deref(), Some("east"));
    assert!(loaded.validate().is_ok());
}

#[test]
fn test_partial_config_file_uses_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("minimal.toml");
    std::fs::write(&path, "[cluster]\nnode_id = \"solo\"\nrack_id = \"r9\"\n").unwrap();

    let config = CacheConfig::load(&path).unwrap();
    assert_eq!(config.cluster.node_id, "solo");
    assert_eq!(config.cluster.rack_id.as_deref(), Some("r9"));
    assert_eq!(config.server.port, CacheConfig::default().server.port);
    assert_eq!(config.replication.mode, ReplicationMode::Sync);
    assert!(config.validate().is_ok());
}
