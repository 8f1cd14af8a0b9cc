#![allow(dead_code)]

use repl_cache_core::config::CacheConfig;
use repl_cache_core::metrics::MetricsCollector;
use repl_cache_core::transport::{LocalNetwork, MessageHandler};
use repl_cache_core::{ClusterNode, MemoryStore, NodeId, TopologyInfo};
use std::sync::Arc;

/// In-process cluster of full nodes over a [`LocalNetwork`]
pub struct TestCluster {
    pub network: LocalNetwork,
    pub nodes: Vec<Arc<ClusterNode>>,
}

/// Configuration with timeouts short enough for tests
pub fn test_config(id: &str, topology: &TopologyInfo) -> CacheConfig {
    let mut config = CacheConfig::default();
    config.cluster.node_id = id.to_string();
    config.cluster.site_id = topology.site_id.clone();
    config.cluster.rack_id = topology.rack_id.clone();
    config.cluster.machine_id = topology.machine_id.clone();
    config.cluster.heartbeat_interval_ms = 20;
    config.cluster.suspect_timeout_ms = 60;
    config.cluster.failure_timeout_ms = 150;
    config.cluster.prepare_timeout_ms = 150;
    config.cluster.request_timeout_ms = 150;
    config.replication.sync_timeout_ms = 150;
    config.replication.async_backoff_base_ms = 10;
    config.replication.async_backoff_max_ms = 50;
    config.replication.view_change_wait_ms = 500;
    config.query.per_node_timeout_ms = 150;
    config.storage.enable_expiry_cleanup = false;
    config
}

impl TestCluster {
    /// Nodes without topology information, joined in order through the first
    pub async fn start(ids: &[&str]) -> Self {
        let specs: Vec<(&str, TopologyInfo)> = ids.iter().map(|id| (*id, TopologyInfo::new())).collect();
        Self::start_with(&specs, |_| {}).await
    }

    pub async fn start_with<F>(specs: &[(&str, TopologyInfo)], tweak: F) -> Self
    where
        F: Fn(&mut CacheConfig),
    {
        let network = LocalNetwork::new();
        let mut nodes = Vec::new();
        for (id, topology) in specs {
            let mut config = test_config(id, topology);
            tweak(&mut config);
            let node = ClusterNode::new(
                config,
                Arc::new(MemoryStore::new()),
                Arc::new(network.transport_for(NodeId::from(*id))),
                Arc::new(MetricsCollector::default()),
            )
            .expect("valid test config");
            let handler: Arc<dyn MessageHandler> = node.clone();
            network.register(NodeId::from(*id), handler).await;
            nodes.push(node);
        }

        let seed = vec![nodes[0].local().clone()];
        for node in &nodes[1..] {
            node.join_via(&seed).await.expect("join");
        }
        Self { network, nodes }
    }

    pub fn node(&self, id: &str) -> &Arc<ClusterNode> {
        self.nodes
            .iter()
            .find(|n| n.local().id.as_str() == id)
            .expect("unknown node")
    }

    pub async fn kill(&self, id: &str) {
        self.network.kill(&NodeId::from(id)).await;
    }

    pub async fn revive(&self, id: &str) {
        self.network.revive(&NodeId::from(id)).await;
    }

    /// The member ids of `id`'s installed view
    pub fn members_seen_by(&self, id: &str) -> Vec<String> {
        self.node(id)
            .membership()
            .current_view()
            .members()
            .iter()
            .map(|m| m.id.to_string())
            .collect()
    }
}

pub fn ids(names: &[&str]) -> Vec<NodeId> {
    names.iter().map(|n| NodeId::from(*n)).collect()
}
