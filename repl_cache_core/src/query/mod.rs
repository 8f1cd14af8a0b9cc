//! Distributed query scatter-gather
//!
//! A query is dispatched in parallel to every node that may own matching
//! entries. Each node evaluates the predicate against its local store and
//! answers within a per-node timeout. Partial results are merged in node id
//! order and de-duplicated by key, so when several owners hold a key the
//! copy from the lowest node id wins.
//!
//! A slow or failed node never fails the whole query: the merged result is
//! returned with [`QueryStatus::Partial`] and the nodes that did not answer.
//! A node removed from the view while the query is in flight is marked
//! failed instead of being waited on.

pub mod predicate;

pub use predicate::Predicate;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::QueryConfig;
use crate::error::{CacheError, CacheResult, TransportError};
use crate::log::log_query_operation;
use crate::metrics::MetricsCollector;
use crate::placement::Placement;
use crate::store::{Entry, LocalStore};
use crate::topology::{NodeDescriptor, NodeId};
use crate::transport::{send_with_timeout, ClusterMessage, ClusterResponse, ClusterTransport};
use crate::view::ViewHandle;

/// Order of the merged result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum QueryOrdering {
    /// Node id order, then each node's own order
    #[default]
    Unordered,
    ByKey,
}

/// What to run and how long to wait for each node
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    pub predicate: Predicate,
    pub limit: Option<usize>,
    pub per_node_timeout: Option<Duration>,
    pub ordering: QueryOrdering,
    /// Stop waiting once an unordered query has `limit` distinct entries
    pub early_termination: bool,
}

impl QueryDescriptor {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            limit: None,
            per_node_timeout: None,
            ordering: QueryOrdering::Unordered,
            early_termination: false,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_node_timeout = Some(timeout);
        self
    }

    pub fn ordered_by_key(mut self) -> Self {
        self.ordering = QueryOrdering::ByKey;
        self
    }

    pub fn with_early_termination(mut self) -> Self {
        self.early_termination = true;
        self
    }

    /// With a key ordering any pending node could still hold a smaller key
    fn may_stop_early(&self) -> bool {
        self.early_termination && self.ordering == QueryOrdering::Unordered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PartialStatus {
    Complete,
    TimedOut,
    Failed,
}

/// One node's answer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialResult {
    pub node: NodeId,
    pub entries: Vec<Entry>,
    pub status: PartialStatus,
    pub error: Option<String>,
}

impl PartialResult {
    fn complete(node: NodeId, entries: Vec<Entry>) -> Self {
        Self {
            node,
            entries,
            status: PartialStatus::Complete,
            error: None,
        }
    }

    fn unanswered(node: NodeId, status: PartialStatus, error: impl Into<String>) -> Self {
        Self {
            node,
            entries: Vec::new(),
            status,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueryStatus {
    Complete,
    Partial,
}

/// Merged result of a distributed query
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub entries: Vec<Entry>,
    pub status: QueryStatus,
    /// Per-node answers in node id order
    pub node_results: Vec<PartialResult>,
    /// Nodes that timed out or failed
    pub failed: Vec<NodeId>,
    /// Nodes not waited on after the limit was reached
    pub skipped: Vec<NodeId>,
    pub view_id: u64,
}

impl QueryResult {
    pub fn is_complete(&self) -> bool {
        self.status == QueryStatus::Complete
    }

    /// The merged entries, or [`CacheError::QueryPartial`] if any node did
    /// not answer
    pub fn into_complete(self) -> CacheResult<Vec<Entry>> {
        match self.status {
            QueryStatus::Complete => Ok(self.entries),
            QueryStatus::Partial => Err(CacheError::QueryPartial { failed: self.failed }),
        }
    }
}

/// Dispatches queries and merges their partial results
pub struct QueryCoordinator {
    local: NodeId,
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn ClusterTransport>,
    views: Arc<ViewHandle>,
    placement: Arc<Placement>,
    config: QueryConfig,
    metrics: Arc<MetricsCollector>,
    next_query_id: AtomicU64,
}

impl QueryCoordinator {
    pub fn new(
        local: NodeId,
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn ClusterTransport>,
        views: Arc<ViewHandle>,
        placement: Arc<Placement>,
        config: QueryConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            local,
            store,
            transport,
            views,
            placement,
            config,
            metrics,
            next_query_id: AtomicU64::new(1),
        }
    }

    pub async fn query(&self, descriptor: &QueryDescriptor) -> QueryResult {
        let start = Instant::now();
        let query_id = self.next_query_id.fetch_add(1, Ordering::Relaxed);

        let mut view_rx = self.views.subscribe();
        let view = view_rx.borrow_and_update().clone();
        let candidates: Vec<NodeDescriptor> = match descriptor.predicate.exact_key() {
            Some(key) => self.placement.owners_for(key, &view).owners().to_vec(),
            None => view.members().to_vec(),
        };
        let timeout = descriptor
            .per_node_timeout
            .unwrap_or_else(|| self.config.per_node_timeout());
        let limit = descriptor.limit.or(self.config.default_limit);

        tracing::debug!(
            "Query {} dispatched to {} nodes under view {}",
            query_id,
            candidates.len(),
            view.view_id()
        );

        let (tx, mut rx) = mpsc::channel::<PartialResult>(candidates.len().max(1));
        let mut in_flight: HashMap<NodeId, JoinHandle<()>> = HashMap::new();
        for candidate in &candidates {
            let task = NodeQuery {
                node: candidate.clone(),
                is_local: candidate.id == self.local,
                predicate: descriptor.predicate.clone(),
                limit,
                timeout,
                store: Arc::clone(&self.store),
                transport: Arc::clone(&self.transport),
            };
            let tx = tx.clone();
            let handle = tokio::spawn(async move {
                let _ = tx.send(task.run().await).await;
            });
            in_flight.insert(candidate.id.clone(), handle);
        }
        drop(tx);

        let mut results: BTreeMap<NodeId, PartialResult> = BTreeMap::new();
        let mut skipped: Vec<NodeId> = Vec::new();
        let mut view_open = true;
        let mut stopped_early = false;

        while results.len() + skipped.len() < candidates.len() {
            tokio::select! {
                received = rx.recv() => {
                    let partial = match received {
                        Some(partial) => partial,
                        None => break,
                    };
                    // Already marked failed by a view change
                    if results.contains_key(&partial.node) {
                        continue;
                    }
                    in_flight.remove(&partial.node);
                    results.insert(partial.node.clone(), partial);

                    if let Some(limit) = limit {
                        if descriptor.may_stop_early() && !in_flight.is_empty() && distinct_keys(&results) >= limit {
                            for (node, handle) in in_flight.drain() {
                                handle.abort();
                                skipped.push(node);
                            }
                            stopped_early = true;
                        }
                    }
                }
                changed = view_rx.changed(), if view_open => {
                    if changed.is_err() {
                        view_open = false;
                        continue;
                    }
                    let latest = view_rx.borrow_and_update().clone();
                    let removed: Vec<NodeId> = in_flight
                        .keys()
                        .filter(|id| !latest.contains(id))
                        .cloned()
                        .collect();
                    for node in removed {
                        if let Some(handle) = in_flight.remove(&node) {
                            handle.abort();
                        }
                        tracing::info!("Query {}: {} left in view {}, marking failed", query_id, node, latest.view_id());
                        let reason = format!("removed from view {}", latest.view_id());
                        results.insert(node.clone(), PartialResult::unanswered(node, PartialStatus::Failed, reason));
                    }
                }
            }
        }

        // Candidates whose task ended without reporting
        for (node, handle) in in_flight.drain() {
            handle.abort();
            results
                .entry(node.clone())
                .or_insert_with(|| PartialResult::unanswered(node, PartialStatus::Failed, "no response"));
        }
        skipped.sort();

        let result = merge(results, skipped, descriptor.ordering, limit, view.view_id());

        let timed_out = result
            .node_results
            .iter()
            .filter(|r| r.status == PartialStatus::TimedOut)
            .count();
        let failed = result.failed.len() - timed_out;
        let elapsed = start.elapsed();
        self.metrics
            .record_query(result.is_complete(), timed_out, failed, stopped_early, elapsed);
        log_query_operation(query_id, candidates.len(), result.is_complete(), result.entries.len(), elapsed);
        if !result.is_complete() {
            tracing::warn!("Query {} partial, no result from {:?}", query_id, result.failed);
        }
        result
    }

    /// Serve an `EvaluateQuery` request against the local store
    pub async fn handle_evaluate(&self, predicate: &Predicate, limit: Option<usize>) -> ClusterResponse {
        match self.store.local_scan(predicate, limit).await {
            Ok(entries) => ClusterResponse::Entries(entries),
            Err(e) => ClusterResponse::Error(e.to_string()),
        }
    }
}

/// Evaluation of one query on one node
struct NodeQuery {
    node: NodeDescriptor,
    is_local: bool,
    predicate: Predicate,
    limit: Option<usize>,
    timeout: Duration,
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn ClusterTransport>,
}

impl NodeQuery {
    async fn run(self) -> PartialResult {
        let id = self.node.id.clone();
        if self.is_local {
            return match tokio::time::timeout(self.timeout, self.store.local_scan(&self.predicate, self.limit)).await {
                Ok(Ok(entries)) => PartialResult::complete(id, entries),
                Ok(Err(e)) => PartialResult::unanswered(id, PartialStatus::Failed, e.to_string()),
                Err(_) => PartialResult::unanswered(id, PartialStatus::TimedOut, "local scan timed out"),
            };
        }

        let message = ClusterMessage::EvaluateQuery {
            predicate: self.predicate,
            limit: self.limit,
        };
        match send_with_timeout(self.transport.as_ref(), &self.node, message, self.timeout).await {
            Ok(ClusterResponse::Entries(entries)) => PartialResult::complete(id, entries),
            Ok(ClusterResponse::Error(reason)) => PartialResult::unanswered(id, PartialStatus::Failed, reason),
            Ok(other) => PartialResult::unanswered(id, PartialStatus::Failed, format!("unexpected response {:?}", other)),
            Err(e @ TransportError::Timeout { .. }) => PartialResult::unanswered(id, PartialStatus::TimedOut, e.to_string()),
            Err(e) => PartialResult::unanswered(id, PartialStatus::Failed, e.to_string()),
        }
    }
}

fn distinct_keys(results: &BTreeMap<NodeId, PartialResult>) -> usize {
    results
        .values()
        .flat_map(|r| r.entries.iter().map(|e| e.key.as_str()))
        .collect::<HashSet<_>>()
        .len()
}

fn merge(
    results: BTreeMap<NodeId, PartialResult>,
    skipped: Vec<NodeId>,
    ordering: QueryOrdering,
    limit: Option<usize>,
    view_id: u64,
) -> QueryResult {
    let mut seen: HashSet<String> = HashSet::new();
    let mut entries = Vec::new();
    let mut failed = Vec::new();

    for partial in results.values() {
        if partial.status != PartialStatus::Complete {
            failed.push(partial.node.clone());
        }
        for entry in &partial.entries {
            if seen.insert(entry.key.clone()) {
                entries.push(entry.clone());
            }
        }
    }

    if ordering == QueryOrdering::ByKey {
        entries.sort_by(|a, b| a.key.cmp(&b.key));
    }
    if let Some(limit) = limit {
        entries.truncate(limit);
    }

    QueryResult {
        entries,
        status: if failed.is_empty() {
            QueryStatus::Complete
        } else {
            QueryStatus::Partial
        },
        node_results: results.into_values().collect(),
        failed,
        skipped,
        view_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::topology::TopologyInfo;
    use crate::transport::{LocalNetwork, MessageHandler};
    use crate::view::ClusterView;
    use async_trait::async_trait;

    struct StoreHandler(Arc<MemoryStore>);

    #[async_trait]
    impl MessageHandler for StoreHandler {
        async fn handle(&self, message: ClusterMessage) -> ClusterResponse {
            match message {
                ClusterMessage::EvaluateQuery { predicate, limit } => match self.0.local_scan(&predicate, limit).await {
                    Ok(entries) => ClusterResponse::Entries(entries),
                    Err(e) => ClusterResponse::Error(e.to_string()),
                },
                _ => ClusterResponse::Error("unsupported".into()),
            }
        }
    }

    struct Fixture {
        network: LocalNetwork,
        views: Arc<ViewHandle>,
        coordinator: QueryCoordinator,
        _handlers: Vec<Arc<dyn MessageHandler>>,
    }

    /// Nodes "a", "b", "c"; the coordinator runs on "a"
    async fn fixture(contents: [&[(&str, &str)]; 3]) -> Fixture {
        let network = LocalNetwork::new();
        let ids = ["a", "b", "c"];
        let members: Vec<NodeDescriptor> = ids
            .iter()
            .map(|id| NodeDescriptor::new(*id, TopologyInfo::new(), "local"))
            .collect();
        let views = Arc::new(ViewHandle::new(ClusterView::new(1, members)));

        let mut stores = Vec::new();
        let mut handlers: Vec<Arc<dyn MessageHandler>> = Vec::new();
        for (id, entries) in ids.iter().zip(contents) {
            let store = Arc::new(MemoryStore::new());
            for (k, v) in entries {
                store.local_put(k.to_string(), v.to_string(), None).await.unwrap();
            }
            let handler: Arc<dyn MessageHandler> = Arc::new(StoreHandler(Arc::clone(&store)));
            network.register(NodeId::from(*id), Arc::clone(&handler)).await;
            handlers.push(handler);
            stores.push(store);
        }

        let coordinator = QueryCoordinator::new(
            NodeId::from("a"),
            stores[0].clone(),
            Arc::new(network.transport_for(NodeId::from("a"))),
            Arc::clone(&views),
            Arc::new(Placement::default()),
            QueryConfig::default(),
            Arc::new(MetricsCollector::default()),
        );
        Fixture {
            network,
            views,
            coordinator,
            _handlers: handlers,
        }
    }

    fn value_prefix(prefix: &str) -> QueryDescriptor {
        QueryDescriptor::new(Predicate::ValuePrefix(prefix.into())).with_timeout(Duration::from_millis(200))
    }

    fn keys(result: &QueryResult) -> Vec<&str> {
        result.entries.iter().map(|e| e.key.as_str()).collect()
    }

    #[tokio::test]
    async fn test_merge_across_nodes() {
        let f = fixture([&[("k1", "a1")], &[("k2", "a2")], &[("k3", "b1")]]).await;
        let result = f.coordinator.query(&value_prefix("a").ordered_by_key()).await;
        assert_eq!(result.status, QueryStatus::Complete);
        assert_eq!(keys(&result), vec!["k1", "k2"]);
        assert_eq!(result.node_results.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_keys_keep_lowest_node_copy() {
        let f = fixture([&[], &[("k", "a-from-b")], &[("k", "a-from-c")]]).await;
        let result = f.coordinator.query(&value_prefix("a")).await;
        assert_eq!(result.entries, vec![Entry::new("k", "a-from-b")]);
    }

    #[tokio::test]
    async fn test_dead_node_makes_result_partial() {
        let f = fixture([&[("k1", "a1")], &[("k2", "a2")], &[("k3", "b1")]]).await;
        f.network.kill(&NodeId::from("b")).await;

        let result = f.coordinator.query(&value_prefix("a")).await;
        assert_eq!(result.status, QueryStatus::Partial);
        assert_eq!(keys(&result), vec!["k1"]);
        assert_eq!(result.failed, vec![NodeId::from("b")]);

        match result.into_complete() {
            Err(CacheError::QueryPartial { failed }) => assert_eq!(failed, vec![NodeId::from("b")]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_node_times_out() {
        let f = fixture([&[("k1", "a1")], &[("k2", "a2")], &[]]).await;
        f.network.set_latency(&NodeId::from("c"), Duration::from_secs(5)).await;

        let started = Instant::now();
        let result = f.coordinator.query(&value_prefix("a")).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.failed, vec![NodeId::from("c")]);
        let c = result.node_results.iter().find(|r| r.node == NodeId::from("c")).unwrap();
        assert_eq!(c.status, PartialStatus::TimedOut);
        assert_eq!(keys(&result), vec!["k1", "k2"]);
    }

    #[tokio::test]
    async fn test_removed_node_marked_failed() {
        let f = fixture([&[("k1", "a1")], &[("k2", "a2")], &[]]).await;
        f.network.set_latency(&NodeId::from("c"), Duration::from_secs(5)).await;

        let views = Arc::clone(&f.views);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let current = views.current();
            views.install(current.without(&[NodeId::from("c")]));
        });

        let descriptor = value_prefix("a").with_timeout(Duration::from_secs(10));
        let started = Instant::now();
        let result = f.coordinator.query(&descriptor).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        let c = result.node_results.iter().find(|r| r.node == NodeId::from("c")).unwrap();
        assert_eq!(c.status, PartialStatus::Failed);
        assert_eq!(result.status, QueryStatus::Partial);
    }

    #[tokio::test]
    async fn test_early_termination_skips_slow_node() {
        let f = fixture([&[("k1", "a1"), ("k2", "a2")], &[("k3", "a3")], &[("k4", "a4")]]).await;
        f.network.set_latency(&NodeId::from("c"), Duration::from_secs(5)).await;

        let descriptor = value_prefix("a")
            .with_timeout(Duration::from_secs(10))
            .with_limit(2)
            .with_early_termination();
        let result = f.coordinator.query(&descriptor).await;
        assert_eq!(result.entries.len(), 2);
        assert!(result.skipped.contains(&NodeId::from("c")));
        assert!(result.is_complete());
    }

    #[tokio::test]
    async fn test_exact_key_queries_only_owners() {
        let f = fixture([&[("k", "a1")], &[("k", "a1")], &[("k", "a1")]]).await;
        let result = f
            .coordinator
            .query(&QueryDescriptor::new(Predicate::KeyEquals("k".into())))
            .await;
        // Default placement replicates to every member
        assert_eq!(result.node_results.len(), 3);
        assert_eq!(result.entries.len(), 1);
    }
}
