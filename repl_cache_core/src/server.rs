//! Admin HTTP endpoints
//!
//! Read-only observability for one node: health, the installed view, key
//! placement and metrics.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cache::Cache;
use crate::membership::NodeHealth;
use crate::metrics::MetricsSummary;
use crate::node::ClusterNode;
use crate::topology::NodeDescriptor;

/// HTTP server exposing a node's admin endpoints
pub struct AdminServer {
    node: Arc<ClusterNode>,
    prometheus: Option<PrometheusHandle>,
}

#[derive(Clone)]
struct AdminState {
    node: Arc<ClusterNode>,
    prometheus: Option<PrometheusHandle>,
}

impl AdminServer {
    pub fn new(node: Arc<ClusterNode>, prometheus: Option<PrometheusHandle>) -> Self {
        Self { node, prometheus }
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(&self, addr: SocketAddr, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.create_router();
        tracing::info!("Admin HTTP server listening on {}", addr);

        axum::Server::bind(&addr)
            .serve(app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    pub fn create_router(&self) -> Router {
        let state = Arc::new(AdminState {
            node: Arc::clone(&self.node),
            prometheus: self.prometheus.clone(),
        });

        Router::new()
            .route("/health", get(health_handler))
            .route("/topology", get(topology_handler))
            .route("/owners/:key", get(owners_handler))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

#[derive(Debug, Serialize)]
struct QuorumShortfall {
    reachable: usize,
    required: usize,
}

#[derive(Debug, Serialize)]
struct MemberHealth {
    node_id: String,
    health: NodeHealth,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    view_id: u64,
    members: usize,
    member_of_view: bool,
    degraded: Option<QuorumShortfall>,
    peers: Vec<MemberHealth>,
    uptime_seconds: u64,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct MemberResponse {
    node_id: String,
    address: String,
    site: Option<String>,
    rack: Option<String>,
    machine: Option<String>,
}

impl From<&NodeDescriptor> for MemberResponse {
    fn from(node: &NodeDescriptor) -> Self {
        Self {
            node_id: node.id.to_string(),
            address: node.address.clone(),
            site: node.topology.site_id.clone(),
            rack: node.topology.rack_id.clone(),
            machine: node.topology.machine_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct TopologyResponse {
    view_id: u64,
    coordinator: Option<String>,
    members: Vec<MemberResponse>,
}

#[derive(Debug, Serialize)]
struct OwnersResponse {
    key: String,
    view_id: u64,
    primary: Option<String>,
    owners: Vec<String>,
}

async fn health_handler(State(state): State<Arc<AdminState>>) -> (StatusCode, Json<HealthResponse>) {
    let node = &state.node;
    let view = node.current_topology();
    let membership = node.membership();
    let degraded = membership
        .degraded()
        .map(|(reachable, required)| QuorumShortfall { reachable, required });
    let peers: Vec<MemberHealth> = membership
        .member_health()
        .into_iter()
        .map(|(id, health)| MemberHealth {
            node_id: id.to_string(),
            health,
        })
        .collect();
    let member_of_view = view.contains(&node.local().id);

    let healthy = degraded.is_none() && member_of_view;
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        node_id: node.local().id.to_string(),
        view_id: view.view_id(),
        members: view.len(),
        member_of_view,
        degraded,
        peers,
        uptime_seconds: node.metrics().uptime().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

async fn topology_handler(State(state): State<Arc<AdminState>>) -> Json<TopologyResponse> {
    let view = state.node.current_topology();
    Json(TopologyResponse {
        view_id: view.view_id(),
        coordinator: view.coordinator().map(|c| c.id.to_string()),
        members: view.members().iter().map(MemberResponse::from).collect(),
    })
}

async fn owners_handler(State(state): State<Arc<AdminState>>, Path(key): Path<String>) -> Json<OwnersResponse> {
    let owners = state.node.owners_for(&key);
    Json(OwnersResponse {
        view_id: owners.view_id(),
        primary: owners.primary().map(|p| p.id.to_string()),
        owners: owners.ids().iter().map(|id| id.to_string()).collect(),
        key,
    })
}

async fn stats_handler(State(state): State<Arc<AdminState>>) -> Json<MetricsSummary> {
    Json(state.node.metrics().get_metrics_summary())
}

async fn metrics_handler(State(state): State<Arc<AdminState>>) -> (StatusCode, String) {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::OK, state.node.metrics().get_metrics_summary().to_string()),
    }
}
