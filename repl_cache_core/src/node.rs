//! A cache node: membership, replication and queries over one local store

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{Cache, WriteOptions};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEvent, ListenerRegistry, SubscriptionId};
use crate::log::log_cluster_operation;
use crate::membership::{FailureMonitor, MembershipManager, MembershipSettings};
use crate::metrics::MetricsCollector;
use crate::placement::{OwnerList, Placement};
use crate::query::{QueryCoordinator, QueryDescriptor, QueryResult};
use crate::replication::{ReplicationCoordinator, WriteOp, WriteOutcome};
use crate::store::LocalStore;
use crate::topology::NodeDescriptor;
use crate::transport::{ClusterMessage, ClusterResponse, ClusterTransport, MessageHandler};
use crate::view::{ClusterView, ViewHandle};

pub struct ClusterNode {
    config: CacheConfig,
    local: NodeDescriptor,
    store: Arc<dyn LocalStore>,
    views: Arc<ViewHandle>,
    membership: Arc<MembershipManager>,
    replication: ReplicationCoordinator,
    queries: QueryCoordinator,
    events: Arc<ListenerRegistry<CacheEvent>>,
    metrics: Arc<MetricsCollector>,
    monitor: tokio::sync::Mutex<FailureMonitor>,
}

impl ClusterNode {
    /// Build a node that starts out alone in view 1
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn ClusterTransport>,
        metrics: Arc<MetricsCollector>,
    ) -> CacheResult<Arc<Self>> {
        config
            .validate()
            .map_err(|errors| CacheError::Config(errors.join("; ")))?;

        let local = config.local_descriptor();
        let views = Arc::new(ViewHandle::new(ClusterView::new(1, vec![local.clone()])));
        let placement = Arc::new(
            Placement::new(config.cluster.virtual_nodes).with_owner_count(config.replication.owner_count),
        );
        let events = Arc::new(ListenerRegistry::new());

        let membership = Arc::new(MembershipManager::new(
            local.clone(),
            Arc::clone(&views),
            Arc::clone(&transport),
            MembershipSettings::from_config(&config),
            Arc::clone(&metrics),
        ));
        let replication = ReplicationCoordinator::new(
            local.clone(),
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&views),
            Arc::clone(&placement),
            config.replication.clone(),
            Arc::clone(&metrics),
            Arc::clone(&events),
        );
        let queries = QueryCoordinator::new(
            local.id.clone(),
            Arc::clone(&store),
            transport,
            Arc::clone(&views),
            placement,
            config.query.clone(),
            Arc::clone(&metrics),
        );
        let replicator = replication.replicator().clone();
        membership.on_view_change(move |view| {
            replicator.retire_departed(view);
        });
        let monitor = FailureMonitor::new(Arc::clone(&membership), config.heartbeat_duration());
        metrics.record_view_installed(1, 1);

        Ok(Arc::new(Self {
            config,
            local,
            store,
            views,
            membership,
            replication,
            queries,
            events,
            metrics,
            monitor: tokio::sync::Mutex::new(monitor),
        }))
    }

    /// Start failure detection
    pub async fn start(&self) {
        tracing::info!("Starting node {} ({})", self.local.id, self.local.topology);
        self.monitor.lock().await.start();
    }

    /// Stop background work. Queued asynchronous updates are still delivered.
    pub async fn stop(&self) {
        self.monitor.lock().await.stop().await;
        self.replication.shutdown().await;
        tracing::info!("Node {} stopped", self.local.id);
    }

    /// Join through the seed nodes named in the configuration
    pub async fn join_cluster(&self) -> CacheResult<Arc<ClusterView>> {
        let seeds: Vec<NodeDescriptor> = self
            .config
            .cluster
            .seed_nodes
            .iter()
            .map(|seed| seed.descriptor())
            .collect();
        self.join_via(&seeds).await
    }

    pub async fn join_via(&self, seeds: &[NodeDescriptor]) -> CacheResult<Arc<ClusterView>> {
        self.membership.join_cluster(seeds).await
    }

    /// Add another node to the cluster
    pub async fn add_member(&self, node: NodeDescriptor) -> CacheResult<Arc<ClusterView>> {
        self.membership.join(node).await
    }

    /// Leave the cluster
    pub async fn leave(&self) -> CacheResult<Arc<ClusterView>> {
        let start = Instant::now();
        let result = self.membership.leave(self.local.id.clone()).await;
        log_cluster_operation("leave", self.local.id.as_str(), result.is_ok(), start.elapsed(), None);
        result
    }

    pub fn local(&self) -> &NodeDescriptor {
        &self.local
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn membership(&self) -> &Arc<MembershipManager> {
        &self.membership
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn replication(&self) -> &ReplicationCoordinator {
        &self.replication
    }

    pub fn owners_for(&self, key: &str) -> OwnerList {
        self.replication.owners_for(key)
    }

    /// Observe changes to this node's local entries
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Wait for queued asynchronous updates. Returns false on timeout.
    pub async fn flush_replication(&self, timeout: Duration) -> bool {
        self.replication.replicator().flush(timeout).await
    }

    /// Write with full outcome details
    pub async fn write(&self, key: &str, op: WriteOp, options: WriteOptions) -> CacheResult<WriteOutcome> {
        let mode = options.mode.unwrap_or_else(|| self.replication.default_mode());
        self.replication.write(key, op, mode, options.expiry).await
    }
}

#[async_trait]
impl MessageHandler for ClusterNode {
    async fn handle(&self, message: ClusterMessage) -> ClusterResponse {
        tracing::trace!("{} handling {}", self.local.id, message.name());
        match message {
            ClusterMessage::PrimaryWrite { view_id, key, op, mode, expiry } => {
                self.replication
                    .handle_primary_write(view_id, &key, &op, mode, expiry)
                    .await
            }
            ClusterMessage::ApplyWrite { key, mutation, .. } => self.replication.handle_apply(&key, &mutation).await,
            ClusterMessage::Read { key } => match self.store.local_get(&key).await {
                Ok(value) => ClusterResponse::Value(value),
                Err(e) => ClusterResponse::Error(e.to_string()),
            },
            ClusterMessage::EvaluateQuery { predicate, limit } => self.queries.handle_evaluate(&predicate, limit).await,
            ClusterMessage::ViewPrepare { candidate } => self.membership.handle_prepare(&candidate),
            ClusterMessage::ViewCommit { view } => self.membership.handle_commit(view),
            ClusterMessage::ViewAbort { candidate_id } => self.membership.handle_abort(candidate_id),
            ClusterMessage::Join { node } => self.membership.handle_join(node).await,
            ClusterMessage::Leave { node } => self.membership.handle_leave(node).await,
            ClusterMessage::Ping { from, .. } => self.membership.handle_ping(&from),
        }
    }
}

#[async_trait]
impl Cache for ClusterNode {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.replication.read(key).await
    }

    async fn put(&self, key: &str, value: String, options: WriteOptions) -> CacheResult<Option<String>> {
        Ok(self.write(key, WriteOp::Put { value }, options).await?.previous)
    }

    async fn put_if_absent(&self, key: &str, value: String, options: WriteOptions) -> CacheResult<Option<String>> {
        let outcome = self.write(key, WriteOp::PutIfAbsent { value }, options).await?;
        Ok(if outcome.applied { None } else { outcome.previous })
    }

    async fn replace(&self, key: &str, value: String, options: WriteOptions) -> CacheResult<Option<String>> {
        Ok(self.write(key, WriteOp::Replace { value }, options).await?.previous)
    }

    async fn replace_if(&self, key: &str, expected: &str, value: String, options: WriteOptions) -> CacheResult<bool> {
        let op = WriteOp::ReplaceIf {
            expected: expected.to_string(),
            value,
        };
        Ok(self.write(key, op, options).await?.applied)
    }

    async fn remove(&self, key: &str, options: WriteOptions) -> CacheResult<Option<String>> {
        Ok(self.write(key, WriteOp::Remove, options).await?.previous)
    }

    async fn remove_if(&self, key: &str, expected: &str, options: WriteOptions) -> CacheResult<bool> {
        let op = WriteOp::RemoveIf {
            expected: expected.to_string(),
        };
        Ok(self.write(key, op, options).await?.applied)
    }

    async fn run_query(&self, descriptor: QueryDescriptor) -> QueryResult {
        self.queries.query(&descriptor).await
    }

    fn current_topology(&self) -> Arc<ClusterView> {
        self.views.current()
    }

    async fn evict(&self, key: &str) -> CacheResult<bool> {
        let evicted = self.store.local_remove(key).await?.is_some();
        if evicted {
            tracing::debug!("Evicted '{}' from {}", key, self.local.id);
            self.events.notify(&CacheEvent::EntryEvicted { key: key.to_string() });
        }
        Ok(evicted)
    }

    /// Entries are written concurrently, each through its own primary
    async fn put_all(&self, entries: BTreeMap<String, String>, options: WriteOptions) -> CacheResult<()> {
        let writes = entries
            .into_iter()
            .map(|(key, value)| async move { self.put(&key, value, options).await });
        join_all(writes)
            .await
            .into_iter()
            .find_map(Result::err)
            .map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::LocalNetwork;

    #[tokio::test]
    async fn test_standalone_node() {
        let mut config = CacheConfig::default();
        config.cluster.node_id = "solo".to_string();
        let network = LocalNetwork::new();
        let node = ClusterNode::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(network.transport_for("solo".into())),
            Arc::new(MetricsCollector::default()),
        )
        .unwrap();

        assert_eq!(node.current_topology().len(), 1);
        assert_eq!(node.put("k", "v1".into(), WriteOptions::sync()).await.unwrap(), None);
        assert_eq!(node.put_if_absent("k", "v2".into(), WriteOptions::sync()).await.unwrap().as_deref(), Some("v1"));
        assert!(node.replace_if("k", "v1", "v3".into(), WriteOptions::sync()).await.unwrap());
        assert_eq!(node.get("k").await.unwrap().as_deref(), Some("v3"));
        assert_eq!(node.replace("missing", "x".into(), WriteOptions::sync()).await.unwrap(), None);
        assert_eq!(node.get("missing").await.unwrap(), None);
        assert_eq!(node.remove("k", WriteOptions::sync()).await.unwrap().as_deref(), Some("v3"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = CacheConfig::default();
        config.cluster.virtual_nodes = 0;
        let result = ClusterNode::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(LocalNetwork::new().transport_for("x".into())),
            Arc::new(MetricsCollector::default()),
        );
        assert!(matches!(result, Err(CacheError::Config(_))));
    }
}
