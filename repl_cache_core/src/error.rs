//! Error taxonomy for cache, store and transport operations

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::topology::NodeId;

/// Result alias used by every cluster-facing operation
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced to callers of the cache
#[derive(Debug, Error)]
pub enum CacheError {
    /// A synchronous write could not reach every owner. Owners that already
    /// applied the write keep it.
    #[error("write to '{key}' not acknowledged by {}", format_nodes(.unreachable))]
    PartialReplicationFailure {
        key: String,
        unreachable: Vec<NodeId>,
        previous: Option<String>,
        view_id: u64,
    },

    /// Too few members answered to install a new view
    #[error("cluster degraded: {reachable} members reachable, {required} required")]
    ClusterDegraded { reachable: usize, required: usize },

    #[error("owner {node} unavailable: {reason}")]
    OwnerUnavailable { node: NodeId, reason: String },

    /// Raised only when a caller asks for a complete query result
    #[error("query incomplete, no result from {}", format_nodes(.failed))]
    QueryPartial { failed: Vec<NodeId> },

    #[error("operation issued under view {seen}, current view is {current}")]
    StaleView { seen: u64, current: u64 },

    #[error("node {0} is not a member of the current view")]
    NotMember(NodeId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unexpected response: {0}")]
    Protocol(String),
}

/// Errors raised by a local store implementation
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum StoreError {
    #[error("store capacity of {limit} entries exceeded")]
    CapacityExceeded { limit: usize },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while talking to a remote node
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("request to {node} timed out after {timeout:?}")]
    Timeout { node: NodeId, timeout: Duration },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(String),
}

impl TransportError {
    /// The node a failed request was addressed to, when known
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            TransportError::Unreachable(node) => Some(node),
            TransportError::Timeout { node, .. } => Some(node),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<bincode::Error> for TransportError {
    fn from(err: bincode::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}

impl CacheError {
    pub fn owner_unavailable(node: &NodeId, err: impl std::fmt::Display) -> Self {
        CacheError::OwnerUnavailable {
            node: node.clone(),
            reason: err.to_string(),
        }
    }

    /// Short machine-readable label, used for metrics and the client protocol
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::PartialReplicationFailure { .. } => "PARTIAL",
            CacheError::ClusterDegraded { .. } => "DEGRADED",
            CacheError::OwnerUnavailable { .. } => "UNAVAILABLE",
            CacheError::QueryPartial { .. } => "QUERYPARTIAL",
            CacheError::StaleView { .. } => "STALEVIEW",
            CacheError::NotMember(_) => "NOTMEMBER",
            CacheError::Store(_) => "STORE",
            CacheError::Transport(_) => "TRANSPORT",
            CacheError::Config(_) => "CONFIG",
            CacheError::Protocol(_) => "PROTOCOL",
        }
    }
}

fn format_nodes(nodes: &[NodeId]) -> String {
    let names: Vec<&str> = nodes.iter().map(|n| n.as_str()).collect();
    format!("[{}]", names.join(", "))
}
