//! Cluster views and their publication on a node
//!
//! A [`ClusterView`] is an immutable, ordered member list tagged with a
//! strictly increasing id. Each node publishes its current view through a
//! [`ViewHandle`]: readers take an `Arc` snapshot without blocking, and the
//! membership protocol swaps in newer views atomically.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::topology::{NodeDescriptor, NodeId};

/// An ordered set of live members. The first member coordinates view changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    view_id: u64,
    members: Vec<NodeDescriptor>,
}

impl ClusterView {
    pub fn new(view_id: u64, members: Vec<NodeDescriptor>) -> Self {
        let mut unique: Vec<NodeDescriptor> = Vec::with_capacity(members.len());
        for member in members {
            if !unique.contains(&member) {
                unique.push(member);
            }
        }
        Self { view_id, members: unique }
    }

    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    pub fn members(&self) -> &[NodeDescriptor] {
        &self.members
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.iter().any(|m| &m.id == id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeDescriptor> {
        self.members.iter().find(|m| &m.id == id)
    }

    pub fn coordinator(&self) -> Option<&NodeDescriptor> {
        self.members.first()
    }

    /// Successor view with `node` appended
    pub fn with_member(&self, node: NodeDescriptor) -> ClusterView {
        let mut members = self.members.clone();
        members.retain(|m| m.id != node.id);
        members.push(node);
        ClusterView::new(self.view_id + 1, members)
    }

    /// Successor view without the given nodes
    pub fn without(&self, removed: &[NodeId]) -> ClusterView {
        let members = self
            .members
            .iter()
            .filter(|m| !removed.contains(&m.id))
            .cloned()
            .collect();
        ClusterView::new(self.view_id + 1, members)
    }
}

impl std::fmt::Display for ClusterView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.members.iter().map(|m| m.id.as_str()).collect();
        write!(f, "view {} [{}]", self.view_id, ids.join(", "))
    }
}

/// Per-node publication point for the current view.
///
/// Between a prepare and its commit (or abort) the handle is paused:
/// writers wait in [`ViewHandle::wait_writable`] instead of issuing
/// operations under a view that is about to be replaced.
#[derive(Debug)]
pub struct ViewHandle {
    current: watch::Sender<Arc<ClusterView>>,
    paused: watch::Sender<Option<u64>>,
}

impl ViewHandle {
    pub fn new(initial: ClusterView) -> Self {
        let (current, _) = watch::channel(Arc::new(initial));
        let (paused, _) = watch::channel(None);
        Self { current, paused }
    }

    pub fn current(&self) -> Arc<ClusterView> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterView>> {
        self.current.subscribe()
    }

    /// Install `view` if it is strictly newer than the current one. Always
    /// lifts a pause taken for a candidate up to that id.
    pub fn install(&self, view: ClusterView) -> bool {
        let new_id = view.view_id();
        let installed = self.current.send_if_modified(|current| {
            if new_id > current.view_id() {
                *current = Arc::new(view);
                true
            } else {
                false
            }
        });
        self.paused.send_if_modified(|paused| match *paused {
            Some(candidate) if candidate <= new_id => {
                *paused = None;
                true
            }
            _ => false,
        });
        installed
    }

    pub fn pause(&self, candidate_id: u64) {
        self.paused.send_replace(Some(candidate_id));
    }

    pub fn resume(&self) {
        self.paused.send_if_modified(|paused| paused.take().is_some());
    }

    pub fn is_paused(&self) -> bool {
        self.paused.borrow().is_some()
    }

    /// Wait until no view change is being prepared, then return the current
    /// view. A pause that outlives `max_wait` is treated as abandoned.
    pub async fn wait_writable(&self, max_wait: Duration) -> Arc<ClusterView> {
        let deadline = Instant::now() + max_wait;
        let mut paused = self.paused.subscribe();
        loop {
            if paused.borrow_and_update().is_none() {
                break;
            }
            match tokio::time::timeout_at(deadline, paused.changed()).await {
                Ok(Ok(())) => continue,
                _ => {
                    tracing::warn!("view change still pending after {:?}, proceeding", max_wait);
                    break;
                }
            }
        }
        self.current()
    }

    /// Wait for a view newer than `seen`. Returns `None` on timeout.
    pub async fn wait_for_newer(&self, seen: u64, max_wait: Duration) -> Option<Arc<ClusterView>> {
        let deadline = Instant::now() + max_wait;
        let mut rx = self.current.subscribe();
        loop {
            {
                let view = rx.borrow_and_update();
                if view.view_id() > seen {
                    return Some(view.clone());
                }
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return None,
            }
        }
    }
}
