//! In-process transport with failure injection
//!
//! Nodes living in one process register their handler with a shared
//! [`LocalNetwork`]. A killed node neither receives nor sends; a node with
//! injected latency answers only after the delay.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;

use super::{ClusterMessage, ClusterResponse, ClusterTransport, MessageHandler};
use crate::error::TransportError;
use crate::topology::{NodeDescriptor, NodeId};

#[derive(Default)]
struct NetworkState {
    handlers: HashMap<NodeId, Weak<dyn MessageHandler>>,
    down: HashSet<NodeId>,
    latency: HashMap<NodeId, Duration>,
}

/// Shared registry of in-process nodes
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the receiving end of `id`. Only a weak reference is kept.
    pub async fn register(&self, id: NodeId, handler: Arc<dyn MessageHandler>) {
        let mut state = self.state.write().await;
        state.down.remove(&id);
        state.handlers.insert(id, Arc::downgrade(&handler));
    }

    pub async fn unregister(&self, id: &NodeId) {
        self.state.write().await.handlers.remove(id);
    }

    /// Crash-stop `id`: requests to and from it fail as unreachable
    pub async fn kill(&self, id: &NodeId) {
        self.state.write().await.down.insert(id.clone());
    }

    pub async fn revive(&self, id: &NodeId) {
        self.state.write().await.down.remove(id);
    }

    pub async fn is_down(&self, id: &NodeId) -> bool {
        self.state.read().await.down.contains(id)
    }

    /// Delay every request delivered to `id`
    pub async fn set_latency(&self, id: &NodeId, latency: Duration) {
        self.state.write().await.latency.insert(id.clone(), latency);
    }

    pub async fn clear_latency(&self, id: &NodeId) {
        self.state.write().await.latency.remove(id);
    }

    /// Transport used by node `local` to reach the others
    pub fn transport_for(&self, local: NodeId) -> LocalTransport {
        LocalTransport {
            network: self.clone(),
            local,
        }
    }
}

/// One node's view of a [`LocalNetwork`]
#[derive(Clone)]
pub struct LocalTransport {
    network: LocalNetwork,
    local: NodeId,
}

#[async_trait]
impl ClusterTransport for LocalTransport {
    async fn send(
        &self,
        target: &NodeDescriptor,
        message: ClusterMessage,
    ) -> Result<ClusterResponse, TransportError> {
        let (handler, latency) = {
            let state = self.network.state.read().await;
            if state.down.contains(&self.local) || state.down.contains(&target.id) {
                return Err(TransportError::Unreachable(target.id.clone()));
            }
            let handler = state.handlers.get(&target.id).and_then(|h| h.upgrade());
            (handler, state.latency.get(&target.id).copied())
        };

        let handler = handler.ok_or_else(|| TransportError::Unreachable(target.id.clone()))?;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        // The target may have been killed while the request was in flight
        if self.network.is_down(&target.id).await {
            return Err(TransportError::Unreachable(target.id.clone()));
        }
        Ok(handler.handle(message).await)
    }
}
