//! Inter-node communication
//!
//! Every cluster interaction is a single request/response exchange between
//! two nodes. [`ClusterTransport`] sends a [`ClusterMessage`] to a node and
//! returns its [`ClusterResponse`]; [`MessageHandler`] is the receiving end
//! implemented by a node. Two transports are provided: [`LocalNetwork`]
//! connects nodes in one process (with failure injection), and
//! [`TcpTransport`] frames bincode messages over TCP.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::TransportError;
use crate::query::Predicate;
use crate::replication::{Mutation, ReplicationMode, WriteOp, WriteReply};
use crate::store::Entry;
use crate::topology::{NodeDescriptor, NodeId};
use crate::view::ClusterView;

mod local;
mod tcp;

pub use local::{LocalNetwork, LocalTransport};
pub use tcp::{TcpTransport, TransportServer};

/// Requests exchanged between nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterMessage {
    /// Ask the receiver to act as primary for a write decided under `view_id`
    PrimaryWrite {
        view_id: u64,
        key: String,
        op: WriteOp,
        mode: ReplicationMode,
        expiry: Option<Duration>,
    },
    /// Apply an already decided mutation
    ApplyWrite { view_id: u64, key: String, mutation: Mutation },
    Read { key: String },
    EvaluateQuery { predicate: Predicate, limit: Option<usize> },
    ViewPrepare { candidate: ClusterView },
    ViewCommit { view: ClusterView },
    ViewAbort { candidate_id: u64 },
    Join { node: NodeDescriptor },
    Leave { node: NodeId },
    Ping { from: NodeId, view_id: u64 },
}

impl ClusterMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterMessage::PrimaryWrite { .. } => "primary_write",
            ClusterMessage::ApplyWrite { .. } => "apply_write",
            ClusterMessage::Read { .. } => "read",
            ClusterMessage::EvaluateQuery { .. } => "evaluate_query",
            ClusterMessage::ViewPrepare { .. } => "view_prepare",
            ClusterMessage::ViewCommit { .. } => "view_commit",
            ClusterMessage::ViewAbort { .. } => "view_abort",
            ClusterMessage::Join { .. } => "join",
            ClusterMessage::Leave { .. } => "leave",
            ClusterMessage::Ping { .. } => "ping",
        }
    }
}

/// Responses to [`ClusterMessage`]s
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterResponse {
    Write(WriteReply),
    Applied,
    Value(Option<String>),
    Entries(Vec<Entry>),
    PrepareAck { candidate_id: u64 },
    Committed,
    Aborted,
    View(ClusterView),
    Pong { view_id: u64 },
    /// The receiver holds a different view than the request was issued under
    StaleView { current: u64 },
    Degraded { reachable: usize, required: usize },
    Error(String),
}

/// Client side of the cluster transport
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    async fn send(
        &self,
        target: &NodeDescriptor,
        message: ClusterMessage,
    ) -> Result<ClusterResponse, TransportError>;
}

/// Server side of the cluster transport
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ClusterMessage) -> ClusterResponse;
}

/// Send with a deadline, mapping expiry to [`TransportError::Timeout`]
pub async fn send_with_timeout(
    transport: &dyn ClusterTransport,
    target: &NodeDescriptor,
    message: ClusterMessage,
    timeout: Duration,
) -> Result<ClusterResponse, TransportError> {
    match tokio::time::timeout(timeout, transport.send(target, message)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            node: target.id.clone(),
            timeout,
        }),
    }
}
