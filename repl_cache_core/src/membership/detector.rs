//! Heartbeat-based failure detection
//!
//! [`FailureDetector`] is a per-member state machine
//! (`Alive -> Suspected -> Failed`) advanced only by explicit acks and
//! evaluations, so it can be driven from one scheduler loop and tested
//! without timers. [`FailureMonitor`] is that loop.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

use super::MembershipManager;
use crate::topology::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeHealth {
    Alive,
    Suspected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub node: NodeId,
    pub from: NodeHealth,
    pub to: NodeHealth,
}

#[derive(Debug, Clone)]
struct Tracked {
    last_ack: Instant,
    health: NodeHealth,
}

#[derive(Debug)]
pub struct FailureDetector {
    suspect_after: Duration,
    fail_after: Duration,
    nodes: HashMap<NodeId, Tracked>,
}

impl FailureDetector {
    pub fn new(suspect_after: Duration, fail_after: Duration) -> Self {
        Self {
            suspect_after,
            fail_after: fail_after.max(suspect_after),
            nodes: HashMap::new(),
        }
    }

    /// Track exactly `members`. New members start alive as of `now`.
    pub fn track(&mut self, members: &[NodeId], now: Instant) {
        self.nodes.retain(|id, _| members.contains(id));
        for id in members {
            self.nodes.entry(id.clone()).or_insert(Tracked {
                last_ack: now,
                health: NodeHealth::Alive,
            });
        }
    }

    /// A message from `node` arrived. Returns the recovery transition, if any.
    pub fn record_ack(&mut self, node: &NodeId, now: Instant) -> Option<Transition> {
        let tracked = self.nodes.get_mut(node)?;
        tracked.last_ack = now;
        if tracked.health == NodeHealth::Alive {
            return None;
        }
        let from = tracked.health;
        tracked.health = NodeHealth::Alive;
        Some(Transition {
            node: node.clone(),
            from,
            to: NodeHealth::Alive,
        })
    }

    /// Advance every member by its silence since the last ack
    pub fn evaluate(&mut self, now: Instant) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for (id, tracked) in self.nodes.iter_mut() {
            let silence = now.saturating_duration_since(tracked.last_ack);
            let target = if silence >= self.fail_after {
                NodeHealth::Failed
            } else if silence >= self.suspect_after {
                NodeHealth::Suspected
            } else {
                continue;
            };
            if rank(target) > rank(tracked.health) {
                transitions.push(Transition {
                    node: id.clone(),
                    from: tracked.health,
                    to: target,
                });
                tracked.health = target;
            }
        }
        transitions.sort_by(|a, b| a.node.cmp(&b.node));
        transitions
    }

    pub fn health(&self, node: &NodeId) -> Option<NodeHealth> {
        self.nodes.get(node).map(|t| t.health)
    }

    pub fn suspected(&self) -> Vec<NodeId> {
        self.with_health(NodeHealth::Suspected)
    }

    pub fn failed(&self) -> Vec<NodeId> {
        self.with_health(NodeHealth::Failed)
    }

    fn with_health(&self, health: NodeHealth) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, t)| t.health == health)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

fn rank(health: NodeHealth) -> u8 {
    match health {
        NodeHealth::Alive => 0,
        NodeHealth::Suspected => 1,
        NodeHealth::Failed => 2,
    }
}

/// Periodic heartbeat loop driving a node's [`FailureDetector`]
pub struct FailureMonitor {
    membership: Arc<MembershipManager>,
    heartbeat_interval: Duration,
    stop_tx: Option<mpsc::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl FailureMonitor {
    pub fn new(membership: Arc<MembershipManager>, heartbeat_interval: Duration) -> Self {
        Self {
            membership,
            heartbeat_interval,
            stop_tx: None,
            task_handle: None,
        }
    }

    pub fn start(&mut self) {
        if self.task_handle.is_some() {
            return;
        }
        tracing::info!("Starting failure detection every {:?}", self.heartbeat_interval);

        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        self.stop_tx = Some(stop_tx);

        let membership = Arc::clone(&self.membership);
        let heartbeat_interval = self.heartbeat_interval;
        self.task_handle = Some(tokio::spawn(async move {
            let mut timer = interval(heartbeat_interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        membership.heartbeat_round().await;
                    }
                    _ = stop_rx.recv() => {
                        tracing::info!("Failure detection stopped");
                        break;
                    }
                }
            }
        }));
    }

    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(()).await;
        }
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task_handle.is_some()
    }
}
