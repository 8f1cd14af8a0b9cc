//! Write replication across a key's owners
//!
//! Every write is decided by the key's primary owner: it serializes writes
//! per key, evaluates any condition against its own copy and applies the
//! result locally before sending the decided [`Mutation`] to the remaining
//! owners. Replicas apply what the primary decided and never re-evaluate a
//! condition.
//!
//! In [`ReplicationMode::Sync`] the caller returns once every owner has
//! acknowledged, or fails with [`CacheError::PartialReplicationFailure`]
//! naming the owners that did not. In [`ReplicationMode::Async`] the caller
//! returns after the local apply and delivery continues in the background.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ReplicationConfig;
use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEvent, EventOrigin, ListenerRegistry};
use crate::log::log_replication_operation;
use crate::metrics::MetricsCollector;
use crate::placement::{OwnerList, Placement};
use crate::store::LocalStore;
use crate::topology::{NodeDescriptor, NodeId};
use crate::transport::{send_with_timeout, ClusterMessage, ClusterResponse, ClusterTransport};
use crate::view::{ClusterView, ViewHandle};

mod async_queue;
mod locks;

pub use async_queue::AsyncReplicator;
pub use locks::KeyLocks;

/// How a write waits for the other owners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationMode {
    /// Wait for every owner to acknowledge
    Sync,
    /// Return after the local apply, deliver in the background
    Async,
}

impl Default for ReplicationMode {
    fn default() -> Self {
        ReplicationMode::Sync
    }
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationMode::Sync => write!(f, "sync"),
            ReplicationMode::Async => write!(f, "async"),
        }
    }
}

impl FromStr for ReplicationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(ReplicationMode::Sync),
            "async" => Ok(ReplicationMode::Async),
            other => Err(format!("unknown replication mode '{}'", other)),
        }
    }
}

/// Write requested by a caller, evaluated by the primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Put { value: String },
    PutIfAbsent { value: String },
    Replace { value: String },
    ReplaceIf { expected: String, value: String },
    Remove,
    RemoveIf { expected: String },
}

/// Result of evaluating a [`WriteOp`] against the primary's copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub previous: Option<String>,
    pub applied: bool,
    /// `None` when the operation leaves the entry untouched
    pub mutation: Option<Mutation>,
}

impl WriteOp {
    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::Put { .. } => "put",
            WriteOp::PutIfAbsent { .. } => "put_if_absent",
            WriteOp::Replace { .. } => "replace",
            WriteOp::ReplaceIf { .. } => "replace_if",
            WriteOp::Remove => "remove",
            WriteOp::RemoveIf { .. } => "remove_if",
        }
    }

    /// Whether the outcome depends on the current value
    pub fn is_conditional(&self) -> bool {
        !matches!(self, WriteOp::Put { .. } | WriteOp::Remove)
    }

    pub fn decide(&self, current: Option<String>, expiry: Option<Duration>) -> Decision {
        let put = |value: &String| Mutation::Put {
            value: value.clone(),
            expiry,
        };
        let (applied, mutation) = match self {
            WriteOp::Put { value } => (true, Some(put(value))),
            WriteOp::PutIfAbsent { value } => match current {
                None => (true, Some(put(value))),
                Some(_) => (false, None),
            },
            WriteOp::Replace { value } => match current {
                Some(_) => (true, Some(put(value))),
                None => (false, None),
            },
            WriteOp::ReplaceIf { expected, value } => {
                if current.as_deref() == Some(expected.as_str()) {
                    (true, Some(put(value)))
                } else {
                    (false, None)
                }
            }
            WriteOp::Remove => (current.is_some(), Some(Mutation::Remove)),
            WriteOp::RemoveIf { expected } => {
                if current.as_deref() == Some(expected.as_str()) {
                    (true, Some(Mutation::Remove))
                } else {
                    (false, None)
                }
            }
        };
        Decision {
            previous: current,
            applied,
            mutation,
        }
    }
}

/// Change decided by a primary and applied verbatim by the other owners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Put { value: String, expiry: Option<Duration> },
    Remove,
}

/// Primary's answer to a forwarded write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReply {
    pub previous: Option<String>,
    pub applied: bool,
    /// Whether a mutation was applied and sent to the other owners
    pub mutated: bool,
    pub view_id: u64,
    pub owners: Vec<NodeId>,
    /// Owners that did not acknowledge a synchronous write
    pub unreachable: Vec<NodeId>,
}

/// Outcome reported to the caller of a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Value before the write, as seen by the primary
    pub previous: Option<String>,
    /// False when a condition was not met
    pub applied: bool,
    pub view_id: u64,
    pub owners: Vec<NodeId>,
}

/// Routes writes to primaries and replicates decided mutations
pub struct ReplicationCoordinator {
    local: NodeDescriptor,
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn ClusterTransport>,
    views: Arc<ViewHandle>,
    placement: Arc<Placement>,
    locks: KeyLocks,
    replicator: AsyncReplicator,
    config: ReplicationConfig,
    metrics: Arc<MetricsCollector>,
    events: Arc<ListenerRegistry<CacheEvent>>,
}

impl ReplicationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: NodeDescriptor,
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn ClusterTransport>,
        views: Arc<ViewHandle>,
        placement: Arc<Placement>,
        config: ReplicationConfig,
        metrics: Arc<MetricsCollector>,
        events: Arc<ListenerRegistry<CacheEvent>>,
    ) -> Self {
        let replicator = AsyncReplicator::new(
            Arc::clone(&transport),
            Arc::clone(&views),
            &config,
            Arc::clone(&metrics),
        );
        Self {
            local,
            store,
            transport,
            views,
            placement,
            locks: KeyLocks::default(),
            replicator,
            config,
            metrics,
            events,
        }
    }

    pub fn default_mode(&self) -> ReplicationMode {
        self.config.mode
    }

    pub fn replicator(&self) -> &AsyncReplicator {
        &self.replicator
    }

    pub fn owners_for(&self, key: &str) -> OwnerList {
        self.placement.owners_for(key, &self.views.current())
    }

    /// Perform a write from this node, wherever the primary lives
    pub async fn write(
        &self,
        key: &str,
        op: WriteOp,
        mode: ReplicationMode,
        expiry: Option<Duration>,
    ) -> CacheResult<WriteOutcome> {
        let start = Instant::now();
        let result = self.write_with_restarts(key, &op, mode, expiry).await;
        let elapsed = start.elapsed();

        let (success, applied) = match &result {
            Ok(outcome) => (true, outcome.applied),
            Err(_) => (false, false),
        };
        self.metrics.record_write(op.name(), success, applied, elapsed);

        let view_id = match &result {
            Ok(outcome) => outcome.view_id,
            Err(CacheError::PartialReplicationFailure { view_id, unreachable, .. }) => {
                self.metrics.record_partial_replication(unreachable.len());
                *view_id
            }
            Err(_) => self.views.current().view_id(),
        };
        let mut fields = vec![("mode", mode.to_string()), ("applied", applied.to_string())];
        if let Err(e) = &result {
            fields.push(("error", e.to_string()));
        }
        log_replication_operation(op.name(), key, view_id, success, elapsed, Some(fields));

        result
    }

    async fn write_with_restarts(
        &self,
        key: &str,
        op: &WriteOp,
        mode: ReplicationMode,
        expiry: Option<Duration>,
    ) -> CacheResult<WriteOutcome> {
        let mut restarts = 0;
        loop {
            let view = self.views.wait_writable(self.config.view_change_wait()).await;
            if !view.contains(&self.local.id) {
                return Err(CacheError::NotMember(self.local.id.clone()));
            }
            let owners = self.placement.owners_for(key, &view);

            let attempt = if mode == ReplicationMode::Async
                && !op.is_conditional()
                && owners.contains(&self.local.id)
                && !owners.is_primary(&self.local.id)
            {
                self.write_as_async_owner(key, op, expiry, &owners).await
            } else {
                self.route_to_primary(key, op, mode, expiry, &view, &owners).await
            };

            match attempt {
                Err(CacheError::StaleView { seen, current }) if restarts < self.config.max_write_restarts => {
                    restarts += 1;
                    self.metrics.record_write_restart();
                    tracing::debug!(
                        "Write of '{}' issued under view {} but primary holds view {}, restarting",
                        key,
                        seen,
                        current
                    );
                    if current > view.view_id() {
                        self.views
                            .wait_for_newer(view.view_id(), self.config.view_change_wait())
                            .await;
                    } else {
                        // The primary has not installed our view yet
                        tokio::time::sleep(Duration::from_millis(10 * restarts as u64)).await;
                    }
                }
                other => return other,
            }
        }
    }

    /// Unconditional asynchronous write on a non-primary owner: apply here
    /// and let the background queue inform the other owners.
    async fn write_as_async_owner(
        &self,
        key: &str,
        op: &WriteOp,
        expiry: Option<Duration>,
        owners: &OwnerList,
    ) -> CacheResult<WriteOutcome> {
        let _guard = self.locks.lock(key).await;
        let current = self.store.local_get(key).await?;
        let decision = op.decide(current, expiry);

        if let Some(mutation) = &decision.mutation {
            self.apply_local(key, mutation, EventOrigin::Local).await?;
            let others = self.other_owners(owners);
            self.replicator.enqueue(&others, key, mutation, owners.view_id()).await;
        }

        Ok(WriteOutcome {
            previous: decision.previous,
            applied: decision.applied,
            view_id: owners.view_id(),
            owners: owners.ids(),
        })
    }

    /// Send the write to the first reachable owner in placement order. A
    /// dead primary is skipped and the next owner decides in its place.
    async fn route_to_primary(
        &self,
        key: &str,
        op: &WriteOp,
        mode: ReplicationMode,
        expiry: Option<Duration>,
        view: &ClusterView,
        owners: &OwnerList,
    ) -> CacheResult<WriteOutcome> {
        let mut skipped: Vec<NodeId> = Vec::new();

        for owner in owners.owners() {
            let reply = if owner.id == self.local.id {
                self.execute_as_primary(key, op, mode, expiry, view.view_id()).await?
            } else {
                let message = ClusterMessage::PrimaryWrite {
                    view_id: view.view_id(),
                    key: key.to_string(),
                    op: op.clone(),
                    mode,
                    expiry,
                };
                match send_with_timeout(self.transport.as_ref(), owner, message, self.primary_timeout()).await {
                    Ok(ClusterResponse::Write(reply)) => reply,
                    Ok(ClusterResponse::StaleView { current }) => {
                        return Err(CacheError::StaleView {
                            seen: view.view_id(),
                            current,
                        })
                    }
                    Ok(ClusterResponse::Error(reason)) => {
                        return Err(CacheError::OwnerUnavailable {
                            node: owner.id.clone(),
                            reason,
                        })
                    }
                    Ok(other) => return Err(CacheError::Protocol(format!("{:?}", other))),
                    Err(e) => {
                        tracing::warn!("Owner {} of '{}' unreachable, trying next owner: {}", owner.id, key, e);
                        skipped.push(owner.id.clone());
                        continue;
                    }
                }
            };
            return self.finish(key, mode, reply, skipped);
        }

        let node = owners
            .primary()
            .map(|p| p.id.clone())
            .unwrap_or_else(|| self.local.id.clone());
        Err(CacheError::owner_unavailable(&node, "no owner reachable"))
    }

    fn finish(
        &self,
        key: &str,
        mode: ReplicationMode,
        reply: WriteReply,
        skipped: Vec<NodeId>,
    ) -> CacheResult<WriteOutcome> {
        let mut unreachable = if reply.mutated { skipped } else { Vec::new() };
        for node in reply.unreachable {
            if !unreachable.contains(&node) {
                unreachable.push(node);
            }
        }

        if mode == ReplicationMode::Sync && !unreachable.is_empty() {
            unreachable.sort();
            return Err(CacheError::PartialReplicationFailure {
                key: key.to_string(),
                unreachable,
                previous: reply.previous,
                view_id: reply.view_id,
            });
        }

        Ok(WriteOutcome {
            previous: reply.previous,
            applied: reply.applied,
            view_id: reply.view_id,
            owners: reply.owners,
        })
    }

    /// Decide and replicate a write with this node as primary.
    /// Fails with [`CacheError::StaleView`] if the caller routed the write
    /// under a different view than the one installed here.
    pub async fn execute_as_primary(
        &self,
        key: &str,
        op: &WriteOp,
        mode: ReplicationMode,
        expiry: Option<Duration>,
        view_id: u64,
    ) -> CacheResult<WriteReply> {
        let view = self.views.current();
        if view.view_id() != view_id {
            return Err(CacheError::StaleView {
                seen: view_id,
                current: view.view_id(),
            });
        }

        let _guard = self.locks.lock(key).await;
        let current = self.store.local_get(key).await?;
        let decision = op.decide(current, expiry);
        let owners = self.placement.owners_for(key, &view);

        let mut reply = WriteReply {
            previous: decision.previous,
            applied: decision.applied,
            mutated: decision.mutation.is_some(),
            view_id,
            owners: owners.ids(),
            unreachable: Vec::new(),
        };
        let mutation = match decision.mutation {
            Some(mutation) => mutation,
            None => return Ok(reply),
        };

        self.apply_local(key, &mutation, EventOrigin::Local).await?;
        let others = self.other_owners(&owners);
        match mode {
            ReplicationMode::Async => {
                self.replicator.enqueue(&others, key, &mutation, view_id).await;
            }
            ReplicationMode::Sync => {
                reply.unreachable = self.propagate(&others, key, &mutation, view_id).await;
                self.reconcile_after_view_change(key, &mutation, &mut reply).await;
            }
        }
        Ok(reply)
    }

    /// A view installed while a synchronous write was propagating may have
    /// changed the key's owners. A fully acknowledged write is copied to
    /// the newly added owners on a best-effort basis; an incomplete one is
    /// re-propagated against the new owner list, which then decides the
    /// outcome.
    async fn reconcile_after_view_change(&self, key: &str, mutation: &Mutation, reply: &mut WriteReply) {
        let latest = self.views.current();
        if latest.view_id() == reply.view_id {
            return;
        }

        let new_owners = self.placement.owners_for(key, &latest);
        let acknowledged: Vec<&NodeId> = reply
            .owners
            .iter()
            .filter(|id| !reply.unreachable.contains(id))
            .collect();
        let pending: Vec<NodeDescriptor> = new_owners
            .owners()
            .iter()
            .filter(|o| o.id != self.local.id && !acknowledged.contains(&&o.id))
            .cloned()
            .collect();

        if reply.unreachable.is_empty() {
            if !pending.is_empty() {
                let missed = self.propagate(&pending, key, mutation, latest.view_id()).await;
                if !missed.is_empty() {
                    tracing::debug!("New owners {:?} of '{}' missed a completed write", missed, key);
                }
            }
            return;
        }

        tracing::info!(
            "Owners of '{}' changed from view {} to {} during replication, re-propagating",
            key,
            reply.view_id,
            latest.view_id()
        );
        reply.unreachable = self.propagate(&pending, key, mutation, latest.view_id()).await;
        reply.owners = new_owners.ids();
        reply.view_id = latest.view_id();
    }

    /// Send `mutation` to every target in parallel. Returns the targets
    /// that did not acknowledge within the synchronous timeout.
    async fn propagate(
        &self,
        targets: &[NodeDescriptor],
        key: &str,
        mutation: &Mutation,
        view_id: u64,
    ) -> Vec<NodeId> {
        let timeout = self.config.sync_timeout();
        let mut in_flight: FuturesUnordered<_> = targets
            .iter()
            .map(|target| {
                let message = ClusterMessage::ApplyWrite {
                    view_id,
                    key: key.to_string(),
                    mutation: mutation.clone(),
                };
                async move {
                    let result = send_with_timeout(self.transport.as_ref(), target, message, timeout).await;
                    (target.id.clone(), result)
                }
            })
            .collect();

        let mut unreachable = Vec::new();
        while let Some((node, result)) = in_flight.next().await {
            match result {
                Ok(ClusterResponse::Applied) => {}
                Ok(other) => {
                    tracing::warn!("Owner {} rejected update of '{}': {:?}", node, key, other);
                    unreachable.push(node);
                }
                Err(e) => {
                    tracing::warn!("Owner {} did not acknowledge update of '{}': {}", node, key, e);
                    unreachable.push(node);
                }
            }
        }
        unreachable.sort();
        unreachable
    }

    /// Apply a mutation decided by another node
    pub async fn apply_replica(&self, key: &str, mutation: &Mutation) -> CacheResult<()> {
        self.apply_local(key, mutation, EventOrigin::Replica).await
    }

    async fn apply_local(&self, key: &str, mutation: &Mutation, origin: EventOrigin) -> CacheResult<()> {
        match mutation {
            Mutation::Put { value, expiry } => {
                self.store
                    .local_put(key.to_string(), value.clone(), *expiry)
                    .await?;
                self.events.notify(&CacheEvent::EntryWritten {
                    key: key.to_string(),
                    value: value.clone(),
                    origin,
                });
            }
            Mutation::Remove => {
                if self.store.local_remove(key).await?.is_some() {
                    self.events.notify(&CacheEvent::EntryRemoved {
                        key: key.to_string(),
                        origin,
                    });
                }
            }
        }
        Ok(())
    }

    /// Read `key` from this node if it is an owner, otherwise from the
    /// first owner that answers.
    pub async fn read(&self, key: &str) -> CacheResult<Option<String>> {
        let view = self.views.current();
        let owners = self.placement.owners_for(key, &view);
        if owners.is_empty() || owners.contains(&self.local.id) {
            self.metrics.record_read(false);
            return Ok(self.store.local_get(key).await?);
        }

        let mut last_error = None;
        for owner in owners.owners() {
            let message = ClusterMessage::Read { key: key.to_string() };
            match send_with_timeout(self.transport.as_ref(), owner, message, self.config.sync_timeout()).await {
                Ok(ClusterResponse::Value(value)) => {
                    self.metrics.record_read(true);
                    return Ok(value);
                }
                Ok(ClusterResponse::Error(reason)) => {
                    last_error = Some(CacheError::OwnerUnavailable {
                        node: owner.id.clone(),
                        reason,
                    })
                }
                Ok(other) => last_error = Some(CacheError::Protocol(format!("{:?}", other))),
                Err(e) => last_error = Some(CacheError::owner_unavailable(&owner.id, e)),
            }
        }
        Err(last_error.unwrap_or_else(|| CacheError::owner_unavailable(&self.local.id, "no owners")))
    }

    /// Serve a `PrimaryWrite` request
    pub async fn handle_primary_write(
        &self,
        view_id: u64,
        key: &str,
        op: &WriteOp,
        mode: ReplicationMode,
        expiry: Option<Duration>,
    ) -> ClusterResponse {
        match self.execute_as_primary(key, op, mode, expiry, view_id).await {
            Ok(reply) => ClusterResponse::Write(reply),
            Err(CacheError::StaleView { current, .. }) => ClusterResponse::StaleView { current },
            Err(e) => ClusterResponse::Error(e.to_string()),
        }
    }

    /// Serve an `ApplyWrite` request
    pub async fn handle_apply(&self, key: &str, mutation: &Mutation) -> ClusterResponse {
        match self.apply_replica(key, mutation).await {
            Ok(()) => ClusterResponse::Applied,
            Err(e) => ClusterResponse::Error(e.to_string()),
        }
    }

    fn other_owners(&self, owners: &OwnerList) -> Vec<NodeDescriptor> {
        owners
            .owners()
            .iter()
            .filter(|o| o.id != self.local.id)
            .cloned()
            .collect()
    }

    fn primary_timeout(&self) -> Duration {
        // The primary itself may wait a full sync timeout per propagation pass
        self.config.sync_timeout() * 3
    }

    pub async fn shutdown(&self) {
        self.replicator.shutdown().await;
    }
}
