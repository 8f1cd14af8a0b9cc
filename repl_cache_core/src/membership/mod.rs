//! Cluster membership and view changes
//!
//! Membership changes are installed with a two-phase view change run by the
//! acting coordinator, the first reachable member of the current view:
//!
//! 1. *prepare*: the candidate view is sent to each of its members, which
//!    pause new writes and acknowledge. A member that does not acknowledge
//!    within the prepare timeout is dropped from the candidate and the round
//!    is repeated.
//! 2. *commit*: the candidate is sent to every member (and to departing
//!    nodes) and installed, which un-pauses writers.
//!
//! A view is only installed when a quorum of the current members
//! acknowledged it. Otherwise the change is aborted and the manager reports
//! [`CacheError::ClusterDegraded`] while operations continue against the
//! last installed view.

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult, TransportError};
use crate::events::{ListenerRegistry, SubscriptionId};
use crate::log::{log_cluster_operation, log_view_change};
use crate::metrics::MetricsCollector;
use crate::topology::{NodeDescriptor, NodeId};
use crate::transport::{send_with_timeout, ClusterMessage, ClusterResponse, ClusterTransport};
use crate::view::{ClusterView, ViewHandle};

pub mod detector;

pub use detector::{FailureDetector, FailureMonitor, NodeHealth, Transition};

/// Timing and quorum settings for view changes
#[derive(Debug, Clone)]
pub struct MembershipSettings {
    pub prepare_timeout: Duration,
    pub request_timeout: Duration,
    pub suspect_after: Duration,
    pub fail_after: Duration,
    pub max_rounds: usize,
    pub min_quorum: Option<usize>,
}

impl MembershipSettings {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            prepare_timeout: config.prepare_duration(),
            request_timeout: config.request_duration(),
            suspect_after: config.suspect_duration(),
            fail_after: config.failure_duration(),
            max_rounds: config.cluster.max_view_change_rounds.max(1),
            min_quorum: config.cluster.min_quorum,
        }
    }

    /// Upper bound on a complete view change
    fn change_timeout(&self) -> Duration {
        self.prepare_timeout * self.max_rounds as u32 + self.request_timeout * 2
    }
}

impl Default for MembershipSettings {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// Requested membership change
#[derive(Debug, Clone)]
enum ViewChange {
    Join(NodeDescriptor),
    /// `voluntary` leavers do not count towards the quorum
    Remove { nodes: Vec<NodeId>, voluntary: bool },
}

impl ViewChange {
    fn name(&self) -> &'static str {
        match self {
            ViewChange::Join(_) => "join",
            ViewChange::Remove { voluntary: true, .. } => "leave",
            ViewChange::Remove { voluntary: false, .. } => "remove_failed",
        }
    }

    /// Candidate view plus the nodes excused from voting, or `None` when
    /// the change is already reflected in `current`
    fn candidate(&self, current: &ClusterView) -> Option<(ClusterView, Vec<NodeId>)> {
        match self {
            ViewChange::Join(node) => {
                if current.get(&node.id) == Some(node) {
                    return None;
                }
                let base = current.without(&[node.id.clone()]);
                let members = base.members().iter().cloned().chain(std::iter::once(node.clone())).collect();
                Some((ClusterView::new(current.view_id() + 1, members), Vec::new()))
            }
            ViewChange::Remove { nodes, voluntary } => {
                let present: Vec<NodeId> = nodes.iter().filter(|id| current.contains(id)).cloned().collect();
                if present.is_empty() {
                    return None;
                }
                let excused = if *voluntary { present.clone() } else { Vec::new() };
                Some((current.without(&present), excused))
            }
        }
    }
}

pub struct MembershipManager {
    local: NodeDescriptor,
    views: Arc<ViewHandle>,
    transport: Arc<dyn ClusterTransport>,
    settings: MembershipSettings,
    listeners: ListenerRegistry<Arc<ClusterView>>,
    detector: Mutex<FailureDetector>,
    degraded: Mutex<Option<(usize, usize)>>,
    change_lock: tokio::sync::Mutex<()>,
    metrics: Arc<MetricsCollector>,
}

impl MembershipManager {
    pub fn new(
        local: NodeDescriptor,
        views: Arc<ViewHandle>,
        transport: Arc<dyn ClusterTransport>,
        settings: MembershipSettings,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let detector = FailureDetector::new(settings.suspect_after, settings.fail_after);
        Self {
            local,
            views,
            transport,
            settings,
            listeners: ListenerRegistry::new(),
            detector: Mutex::new(detector),
            degraded: Mutex::new(None),
            change_lock: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    pub fn local(&self) -> &NodeDescriptor {
        &self.local
    }

    pub fn current_view(&self) -> Arc<ClusterView> {
        self.views.current()
    }

    /// Register a callback run with every newly installed view
    pub fn on_view_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Arc<ClusterView>) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    pub fn remove_view_listener(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Last failed quorum as (reachable, required), cleared by the next
    /// installed view
    pub fn degraded(&self) -> Option<(usize, usize)> {
        *lock(&self.degraded)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded().is_some()
    }

    /// Failure detector state of every other member
    pub fn member_health(&self) -> Vec<(NodeId, NodeHealth)> {
        let view = self.views.current();
        let detector = lock(&self.detector);
        view.members()
            .iter()
            .filter(|m| m.id != self.local.id)
            .map(|m| (m.id.clone(), detector.health(&m.id).unwrap_or(NodeHealth::Alive)))
            .collect()
    }

    /// Add `node` to the cluster
    pub async fn join(&self, node: NodeDescriptor) -> CacheResult<Arc<ClusterView>> {
        let message = ClusterMessage::Join { node: node.clone() };
        self.route(message, ViewChange::Join(node)).await
    }

    /// Remove `node` from the cluster at its own request
    pub async fn leave(&self, node: NodeId) -> CacheResult<Arc<ClusterView>> {
        let message = ClusterMessage::Leave { node: node.clone() };
        let change = ViewChange::Remove {
            nodes: vec![node],
            voluntary: true,
        };
        self.route(message, change).await
    }

    /// Remove members presumed failed. Only run by the acting coordinator.
    pub async fn remove_failed(&self, nodes: Vec<NodeId>) -> CacheResult<Arc<ClusterView>> {
        self.coordinate(ViewChange::Remove { nodes, voluntary: false }).await
    }

    /// Ask the first seed that answers to add this node
    pub async fn join_cluster(&self, seeds: &[NodeDescriptor]) -> CacheResult<Arc<ClusterView>> {
        let start = Instant::now();
        let mut last_error = None;

        for seed in seeds.iter().filter(|s| s.id != self.local.id) {
            let message = ClusterMessage::Join { node: self.local.clone() };
            let timeout = self.settings.change_timeout() * 2;
            let error = match send_with_timeout(self.transport.as_ref(), seed, message, timeout).await {
                Ok(ClusterResponse::View(view)) => {
                    self.install(view);
                    let view = self.views.current();
                    log_cluster_operation(
                        "join_cluster",
                        self.local.id.as_str(),
                        true,
                        start.elapsed(),
                        Some(vec![("seed", seed.id.to_string()), ("view_id", view.view_id().to_string())]),
                    );
                    return Ok(view);
                }
                Ok(ClusterResponse::Degraded { reachable, required }) => {
                    CacheError::ClusterDegraded { reachable, required }
                }
                Ok(ClusterResponse::Error(reason)) => CacheError::OwnerUnavailable {
                    node: seed.id.clone(),
                    reason,
                },
                Ok(other) => CacheError::Protocol(format!("{:?}", other)),
                Err(e) => CacheError::owner_unavailable(&seed.id, e),
            };
            tracing::warn!("Join through seed {} failed: {}", seed.id, error);
            last_error = Some(error);
        }

        match last_error {
            Some(error) => {
                log_cluster_operation("join_cluster", self.local.id.as_str(), false, start.elapsed(), None);
                Err(error)
            }
            None => Ok(self.views.current()),
        }
    }

    /// Walk the view in order and hand the change to the first member that
    /// answers. Reaching this node means it is the acting coordinator.
    async fn route(&self, message: ClusterMessage, change: ViewChange) -> CacheResult<Arc<ClusterView>> {
        let view = self.views.current();
        for member in view.members() {
            if member.id == self.local.id {
                return self.coordinate(change).await;
            }
            match send_with_timeout(self.transport.as_ref(), member, message.clone(), self.settings.change_timeout()).await {
                Ok(ClusterResponse::View(new_view)) => {
                    self.install(new_view.clone());
                    return Ok(Arc::new(new_view));
                }
                Ok(ClusterResponse::Degraded { reachable, required }) => {
                    return Err(CacheError::ClusterDegraded { reachable, required })
                }
                Ok(ClusterResponse::Error(reason)) => {
                    return Err(CacheError::OwnerUnavailable {
                        node: member.id.clone(),
                        reason,
                    })
                }
                Ok(other) => return Err(CacheError::Protocol(format!("{:?}", other))),
                Err(TransportError::Unreachable(_)) => {
                    tracing::debug!("Coordinator candidate {} unreachable, trying next member", member.id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CacheError::NotMember(self.local.id.clone()))
    }

    /// Run a view change with this node as coordinator
    async fn coordinate(&self, change: ViewChange) -> CacheResult<Arc<ClusterView>> {
        let _guard = self.change_lock.lock().await;
        let current = self.views.current();
        let (mut candidate, excused) = match change.candidate(&current) {
            Some(candidate) => candidate,
            None => return Ok(current),
        };

        let voters: Vec<NodeId> = current
            .member_ids()
            .into_iter()
            .filter(|id| !excused.contains(id))
            .collect();
        let required = self.settings.min_quorum.unwrap_or(voters.len() / 2 + 1);
        let mut excluded: Vec<NodeId> = Vec::new();

        tracing::info!("Coordinating {} towards view {}", change.name(), candidate.view_id());

        for round in 1..=self.settings.max_rounds {
            let started = Instant::now();
            let (acked, missing) = self.prepare(&candidate).await;
            let votes = voters.iter().filter(|id| acked.contains(id)).count();

            if votes < required {
                self.abort(&candidate, &acked).await;
                *lock(&self.degraded) = Some((votes, required));
                self.metrics.record_degraded();
                self.metrics.record_view_change_round("degraded", started.elapsed());
                log_view_change(
                    self.local.id.as_str(),
                    candidate.view_id(),
                    round,
                    candidate.len(),
                    "degraded",
                    started.elapsed(),
                );
                tracing::error!(
                    "Refusing view {}: {} of {} required members reachable",
                    candidate.view_id(),
                    votes,
                    required
                );
                return Err(CacheError::ClusterDegraded {
                    reachable: votes,
                    required,
                });
            }

            if missing.is_empty() {
                self.commit(&candidate, &current, &excluded).await;
                self.install(candidate.clone());
                *lock(&self.degraded) = None;
                self.metrics.record_view_change_round("committed", started.elapsed());
                log_view_change(
                    self.local.id.as_str(),
                    candidate.view_id(),
                    round,
                    candidate.len(),
                    "committed",
                    started.elapsed(),
                );
                return Ok(self.views.current());
            }

            self.metrics.record_view_change_round("retry", started.elapsed());
            log_view_change(
                self.local.id.as_str(),
                candidate.view_id(),
                round,
                candidate.len(),
                "retry",
                started.elapsed(),
            );
            if round == self.settings.max_rounds {
                self.abort(&candidate, &acked).await;
                return Err(CacheError::ClusterDegraded {
                    reachable: votes,
                    required: voters.len(),
                });
            }

            tracing::warn!("Members {:?} did not acknowledge view {}, excluding them", missing, candidate.view_id());
            let remaining: Vec<NodeDescriptor> = candidate
                .members()
                .iter()
                .filter(|m| !missing.contains(&m.id))
                .cloned()
                .collect();
            excluded.extend(missing);
            candidate = ClusterView::new(candidate.view_id(), remaining);
        }

        Err(CacheError::ClusterDegraded {
            reachable: 0,
            required,
        })
    }

    /// Send the candidate to its members. Returns (acknowledged, missing).
    async fn prepare(&self, candidate: &ClusterView) -> (Vec<NodeId>, Vec<NodeId>) {
        self.views.pause(candidate.view_id());

        let mut acked = Vec::new();
        if candidate.contains(&self.local.id) {
            acked.push(self.local.id.clone());
        }

        let timeout = self.settings.prepare_timeout;
        let mut pending: FuturesUnordered<_> = candidate
            .members()
            .iter()
            .filter(|m| m.id != self.local.id)
            .map(|member| {
                let message = ClusterMessage::ViewPrepare {
                    candidate: candidate.clone(),
                };
                async move {
                    let result = send_with_timeout(self.transport.as_ref(), member, message, timeout).await;
                    (member.id.clone(), result)
                }
            })
            .collect();

        let mut missing = Vec::new();
        while let Some((node, result)) = pending.next().await {
            match result {
                Ok(ClusterResponse::PrepareAck { candidate_id }) if candidate_id == candidate.view_id() => {
                    acked.push(node)
                }
                Ok(other) => {
                    tracing::warn!("{} refused view {}: {:?}", node, candidate.view_id(), other);
                    missing.push(node);
                }
                Err(e) => {
                    tracing::warn!("{} did not acknowledge view {}: {}", node, candidate.view_id(), e);
                    missing.push(node);
                }
            }
        }
        missing.sort();
        (acked, missing)
    }

    async fn commit(&self, candidate: &ClusterView, previous: &ClusterView, excluded: &[NodeId]) {
        let departing = previous.members().iter().filter(|m| !candidate.contains(&m.id));
        let targets: Vec<&NodeDescriptor> = candidate
            .members()
            .iter()
            .chain(departing)
            .filter(|m| m.id != self.local.id && !excluded.contains(&m.id))
            .collect();
        self.broadcast(&targets, ClusterMessage::ViewCommit { view: candidate.clone() })
            .await;
    }

    async fn abort(&self, candidate: &ClusterView, acked: &[NodeId]) {
        let targets: Vec<&NodeDescriptor> = candidate
            .members()
            .iter()
            .filter(|m| m.id != self.local.id && acked.contains(&m.id))
            .collect();
        self.broadcast(&targets, ClusterMessage::ViewAbort { candidate_id: candidate.view_id() })
            .await;
        self.views.resume();
    }

    /// Best-effort parallel send
    async fn broadcast(&self, targets: &[&NodeDescriptor], message: ClusterMessage) {
        let timeout = self.settings.request_timeout;
        let mut pending: FuturesUnordered<_> = targets
            .iter()
            .map(|target| {
                let message = message.clone();
                async move { (target.id.clone(), send_with_timeout(self.transport.as_ref(), target, message, timeout).await) }
            })
            .collect();
        while let Some((node, result)) = pending.next().await {
            if let Err(e) = result {
                tracing::debug!("{} not delivered to {}: {}", message.name(), node, e);
            }
        }
    }

    /// Install `view` if it is newer than the current one and notify
    /// listeners. Returns whether it was installed.
    pub fn install(&self, view: ClusterView) -> bool {
        let (view_id, members) = (view.view_id(), view.len());
        if !self.views.install(view) {
            return false;
        }
        let installed = self.views.current();
        let others: Vec<NodeId> = installed
            .member_ids()
            .into_iter()
            .filter(|id| *id != self.local.id)
            .collect();
        lock(&self.detector).track(&others, Instant::now());
        *lock(&self.degraded) = None;

        self.metrics.record_view_installed(view_id, members);
        tracing::info!("Installed {}", installed);
        self.listeners.notify(&installed);
        true
    }

    pub fn handle_prepare(&self, candidate: &ClusterView) -> ClusterResponse {
        let current = self.views.current();
        if candidate.view_id() <= current.view_id() {
            return ClusterResponse::StaleView {
                current: current.view_id(),
            };
        }
        self.views.pause(candidate.view_id());
        ClusterResponse::PrepareAck {
            candidate_id: candidate.view_id(),
        }
    }

    pub fn handle_commit(&self, view: ClusterView) -> ClusterResponse {
        self.install(view);
        ClusterResponse::Committed
    }

    pub fn handle_abort(&self, candidate_id: u64) -> ClusterResponse {
        tracing::debug!("View {} aborted by coordinator", candidate_id);
        self.views.resume();
        ClusterResponse::Aborted
    }

    pub async fn handle_join(&self, node: NodeDescriptor) -> ClusterResponse {
        membership_response(self.join(node).await)
    }

    pub async fn handle_leave(&self, node: NodeId) -> ClusterResponse {
        membership_response(self.leave(node).await)
    }

    pub fn handle_ping(&self, from: &NodeId) -> ClusterResponse {
        lock(&self.detector).record_ack(from, Instant::now());
        ClusterResponse::Pong {
            view_id: self.views.current().view_id(),
        }
    }

    /// Ping every other member once, advance the failure detector and, as
    /// acting coordinator, remove members that have failed.
    pub async fn heartbeat_round(&self) -> Vec<Transition> {
        let view = self.views.current();
        let view_id = view.view_id();
        let peers: Vec<&NodeDescriptor> = view.members().iter().filter(|m| m.id != self.local.id).collect();
        let peer_ids: Vec<NodeId> = peers.iter().map(|p| p.id.clone()).collect();
        lock(&self.detector).track(&peer_ids, Instant::now());

        let timeout = self.settings.suspect_after.min(self.settings.request_timeout);
        let mut pings: FuturesUnordered<_> = peers
            .iter()
            .map(|peer| {
                let message = ClusterMessage::Ping {
                    from: self.local.id.clone(),
                    view_id,
                };
                async move { (*peer, send_with_timeout(self.transport.as_ref(), peer, message, timeout).await) }
            })
            .collect();

        let mut transitions = Vec::new();
        let mut behind: Vec<&NodeDescriptor> = Vec::new();
        while let Some((peer, result)) = pings.next().await {
            if let Ok(ClusterResponse::Pong { view_id: peer_view }) = result {
                let recovered = lock(&self.detector).record_ack(&peer.id, Instant::now());
                transitions.extend(recovered);
                if peer_view < view_id {
                    behind.push(peer);
                }
            }
        }
        drop(pings);

        // A member that missed a commit catches up from whoever pings it
        if !behind.is_empty() {
            self.broadcast(&behind, ClusterMessage::ViewCommit { view: (*view).clone() })
                .await;
        }

        let (suspected, failed) = {
            let mut detector = lock(&self.detector);
            transitions.extend(detector.evaluate(Instant::now()));
            (detector.suspected(), detector.failed())
        };
        for transition in &transitions {
            match transition.to {
                NodeHealth::Alive => tracing::info!("{} recovered", transition.node),
                NodeHealth::Suspected => tracing::warn!("{} suspected", transition.node),
                NodeHealth::Failed => tracing::warn!("{} presumed failed", transition.node),
            }
        }
        self.metrics.update_member_health(suspected.len(), failed.len());

        if !failed.is_empty() && self.is_acting_coordinator(&view, &suspected, &failed) {
            if let Err(e) = self.remove_failed(failed).await {
                tracing::warn!("Could not remove failed members: {}", e);
            }
        }
        transitions
    }

    /// Whether every member ahead of this node in view order is unhealthy
    fn is_acting_coordinator(&self, view: &ClusterView, suspected: &[NodeId], failed: &[NodeId]) -> bool {
        view.members()
            .iter()
            .find(|m| m.id == self.local.id || !(suspected.contains(&m.id) || failed.contains(&m.id)))
            .map(|m| m.id == self.local.id)
            .unwrap_or(false)
    }
}

fn membership_response(result: CacheResult<Arc<ClusterView>>) -> ClusterResponse {
    match result {
        Ok(view) => ClusterResponse::View((*view).clone()),
        Err(CacheError::ClusterDegraded { reachable, required }) => ClusterResponse::Degraded { reachable, required },
        Err(e) => ClusterResponse::Error(e.to_string()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyInfo;
    use crate::transport::{LocalNetwork, MessageHandler};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Member(Arc<MembershipManager>);

    #[async_trait]
    impl MessageHandler for Member {
        async fn handle(&self, message: ClusterMessage) -> ClusterResponse {
            match message {
                ClusterMessage::ViewPrepare { candidate } => self.0.handle_prepare(&candidate),
                ClusterMessage::ViewCommit { view } => self.0.handle_commit(view),
                ClusterMessage::ViewAbort { candidate_id } => self.0.handle_abort(candidate_id),
                ClusterMessage::Join { node } => self.0.handle_join(node).await,
                ClusterMessage::Leave { node } => self.0.handle_leave(node).await,
                ClusterMessage::Ping { from, .. } => self.0.handle_ping(&from),
                _ => ClusterResponse::Error("unsupported".into()),
            }
        }
    }

    struct Cluster {
        network: LocalNetwork,
        managers: Vec<Arc<MembershipManager>>,
        _handlers: Vec<Arc<dyn MessageHandler>>,
    }

    fn settings() -> MembershipSettings {
        MembershipSettings {
            prepare_timeout: Duration::from_millis(100),
            request_timeout: Duration::from_millis(100),
            suspect_after: Duration::from_millis(50),
            fail_after: Duration::from_millis(120),
            max_rounds: 3,
            min_quorum: None,
        }
    }

    /// Standalone managers for `ids`, each starting with a singleton view
    async fn standalone(ids: &[&str]) -> Cluster {
        let network = LocalNetwork::new();
        let mut managers = Vec::new();
        let mut handlers: Vec<Arc<dyn MessageHandler>> = Vec::new();
        for id in ids {
            let local = NodeDescriptor::new(*id, TopologyInfo::new(), "local");
            let manager = Arc::new(MembershipManager::new(
                local.clone(),
                Arc::new(ViewHandle::new(ClusterView::new(1, vec![local]))),
                Arc::new(network.transport_for(NodeId::from(*id))),
                settings(),
                Arc::new(MetricsCollector::default()),
            ));
            let handler: Arc<dyn MessageHandler> = Arc::new(Member(Arc::clone(&manager)));
            network.register(NodeId::from(*id), Arc::clone(&handler)).await;
            managers.push(manager);
            handlers.push(handler);
        }
        Cluster {
            network,
            managers,
            _handlers: handlers,
        }
    }

    async fn formed(ids: &[&str]) -> Cluster {
        let cluster = standalone(ids).await;
        let seed = vec![cluster.managers[0].local().clone()];
        for manager in &cluster.managers[1..] {
            manager.join_cluster(&seed).await.unwrap();
        }
        cluster
    }

    fn member_ids(view: &ClusterView) -> Vec<&str> {
        view.members().iter().map(|m| m.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_join_installs_same_view_everywhere() {
        let cluster = formed(&["a", "b", "c"]).await;
        let first = cluster.managers[0].current_view();
        assert_eq!(member_ids(&first), vec!["a", "b", "c"]);
        for manager in &cluster.managers {
            assert_eq!(*manager.current_view(), *first);
        }
    }

    #[tokio::test]
    async fn test_join_through_non_coordinator_seed() {
        let cluster = formed(&["a", "b", "c"]).await;
        let late = NodeDescriptor::new("d", TopologyInfo::new(), "local");
        let manager = Arc::new(MembershipManager::new(
            late.clone(),
            Arc::new(ViewHandle::new(ClusterView::new(1, vec![late.clone()]))),
            Arc::new(cluster.network.transport_for(NodeId::from("d"))),
            settings(),
            Arc::new(MetricsCollector::default()),
        ));
        let handler: Arc<dyn MessageHandler> = Arc::new(Member(Arc::clone(&manager)));
        cluster.network.register(NodeId::from("d"), Arc::clone(&handler)).await;

        let seed = cluster.managers[2].local().clone();
        let view = manager.join_cluster(&[seed]).await.unwrap();
        assert_eq!(member_ids(&view), vec!["a", "b", "c", "d"]);
        assert_eq!(cluster.managers[0].current_view().view_id(), view.view_id());
    }

    #[tokio::test]
    async fn test_unresponsive_member_excluded_from_candidate() {
        let cluster = formed(&["a", "b", "c", "d"]).await;
        cluster.network.kill(&NodeId::from("d")).await;

        let view = cluster.managers[0].leave(NodeId::from("b")).await.unwrap();
        // b left voluntarily, d never acknowledged the prepare
        assert_eq!(member_ids(&view), vec!["a", "c"]);
        assert_eq!(member_ids(&cluster.managers[2].current_view()), vec!["a", "c"]);
        assert_eq!(member_ids(&cluster.managers[1].current_view()), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_lost_quorum_reports_degraded() {
        let cluster = formed(&["a", "b", "c"]).await;
        let before = cluster.managers[0].current_view();
        cluster.network.kill(&NodeId::from("b")).await;
        cluster.network.kill(&NodeId::from("c")).await;

        let err = cluster.managers[0]
            .remove_failed(vec![NodeId::from("b")])
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::ClusterDegraded { reachable: 1, required: 2 }));
        assert!(cluster.managers[0].is_degraded());
        // The last good view stays in force and writers are not left paused
        assert_eq!(*cluster.managers[0].current_view(), *before);
        assert!(!cluster.managers[0].views.is_paused());
    }

    #[tokio::test]
    async fn test_listeners_see_each_view() {
        let cluster = standalone(&["a", "b"]).await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = cluster.managers[0].on_view_change(move |view| {
            counter.store(view.len(), Ordering::SeqCst);
        });

        cluster.managers[1]
            .join_cluster(&[cluster.managers[0].local().clone()])
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(cluster.managers[0].remove_view_listener(id));
    }

    #[tokio::test]
    async fn test_heartbeats_remove_failed_member() {
        let cluster = formed(&["a", "b", "c"]).await;
        cluster.network.kill(&NodeId::from("c")).await;

        let coordinator = &cluster.managers[0];
        for _ in 0..10 {
            coordinator.heartbeat_round().await;
            if !coordinator.current_view().contains(&NodeId::from("c")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        assert_eq!(member_ids(&coordinator.current_view()), vec!["a", "b"]);
        assert_eq!(member_ids(&cluster.managers[1].current_view()), vec!["a", "b"]);
    }

    #[test]
    fn test_acting_coordinator_skips_unhealthy_predecessors() {
        let nodes: Vec<NodeDescriptor> = ["a", "b", "c"]
            .iter()
            .map(|id| NodeDescriptor::new(*id, TopologyInfo::new(), "local"))
            .collect();
        let view = ClusterView::new(4, nodes.clone());
        let manager = MembershipManager::new(
            nodes[1].clone(),
            Arc::new(ViewHandle::new(view.clone())),
            Arc::new(LocalNetwork::new().transport_for(NodeId::from("b"))),
            settings(),
            Arc::new(MetricsCollector::default()),
        );
        assert!(!manager.is_acting_coordinator(&view, &[], &[]));
        assert!(manager.is_acting_coordinator(&view, &[], &[NodeId::from("a")]));
        assert!(manager.is_acting_coordinator(&view, &[NodeId::from("a")], &[NodeId::from("c")]));
    }
}
