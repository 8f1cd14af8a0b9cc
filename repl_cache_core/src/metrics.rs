//! Metrics collection for the replicated cache
//!
//! Counters are kept in atomics for cheap local inspection (the admin
//! endpoint and tests read them) and mirrored to the `metrics` facade.
//! When the Prometheus recorder is installed the facade values are served
//! in text exposition format.

use crate::config::MetricsConfig;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static PROMETHEUS: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the process-wide Prometheus recorder. Returns `None` if another
/// recorder was installed first.
pub fn install_prometheus() -> Option<PrometheusHandle> {
    PROMETHEUS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("Prometheus recorder not installed: {}", e);
                None
            }
        })
        .clone()
}

/// Metrics collector for one cache node
#[derive(Debug)]
pub struct MetricsCollector {
    config: MetricsConfig,
    startup_time: Instant,
    writes: WriteMetrics,
    cluster: ClusterMetrics,
    queries: QueryMetrics,
}

/// Write and replication counters
#[derive(Debug, Default)]
pub struct WriteMetrics {
    pub writes_total: AtomicU64,
    pub writes_failed: AtomicU64,
    pub conditions_not_met: AtomicU64,
    pub partial_replication_failures: AtomicU64,
    pub write_restarts: AtomicU64,
    pub async_enqueued: AtomicU64,
    pub async_retries: AtomicU64,
    pub async_dropped: AtomicU64,
    pub async_delivered: AtomicU64,
    pub reads_total: AtomicU64,
    pub remote_reads: AtomicU64,
    pub last_write_latency_ms: AtomicU64,
}

/// Membership counters
#[derive(Debug, Default)]
pub struct ClusterMetrics {
    pub members: AtomicUsize,
    pub view_id: AtomicU64,
    pub view_changes: AtomicU64,
    pub view_change_rounds: AtomicU64,
    pub degraded_events: AtomicU64,
    pub suspected_nodes: AtomicUsize,
    pub failed_nodes: AtomicUsize,
}

/// Query counters
#[derive(Debug, Default)]
pub struct QueryMetrics {
    pub queries_total: AtomicU64,
    pub partial_queries: AtomicU64,
    pub node_timeouts: AtomicU64,
    pub node_failures: AtomicU64,
    pub early_terminations: AtomicU64,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new(config: MetricsConfig) -> Self {
        let collector = Self {
            config,
            startup_time: Instant::now(),
            writes: WriteMetrics::default(),
            cluster: ClusterMetrics::default(),
            queries: QueryMetrics::default(),
        };
        collector.initialize_metrics();
        collector
    }

    fn initialize_metrics(&self) {
        if !self.config.enabled {
            return;
        }
        for (key, value) in &self.config.labels {
            metrics::gauge!("cache_labels", 1.0, "key" => key.clone(), "value" => value.clone());
        }
    }

    pub fn uptime(&self) -> Duration {
        self.startup_time.elapsed()
    }

    /// Record a completed or failed write
    pub fn record_write(&self, operation: &str, success: bool, applied: bool, duration: Duration) {
        let duration_ms = duration.as_millis() as u64;
        self.writes.writes_total.fetch_add(1, Ordering::Relaxed);
        self.writes.last_write_latency_ms.store(duration_ms, Ordering::Relaxed);
        if !success {
            self.writes.writes_failed.fetch_add(1, Ordering::Relaxed);
        } else if !applied {
            self.writes.conditions_not_met.fetch_add(1, Ordering::Relaxed);
        }

        if !self.config.enabled {
            return;
        }
        metrics::counter!("cache_writes_total", 1, "operation" => operation.to_string());
        if !success {
            metrics::counter!("cache_write_errors_total", 1, "operation" => operation.to_string());
        }
        metrics::histogram!("cache_write_duration_ms", duration_ms as f64);
    }

    pub fn record_partial_replication(&self, unreachable: usize) {
        self.writes.partial_replication_failures.fetch_add(1, Ordering::Relaxed);
        if self.config.enabled {
            metrics::counter!("cache_partial_replication_total", 1);
            metrics::gauge!("cache_last_unreachable_owners", unreachable as f64);
        }
    }

    pub fn record_write_restart(&self) {
        self.writes.write_restarts.fetch_add(1, Ordering::Relaxed);
        if self.config.enabled {
            metrics::counter!("cache_write_restarts_total", 1);
        }
    }

    pub fn record_read(&self, remote: bool) {
        self.writes.reads_total.fetch_add(1, Ordering::Relaxed);
        if remote {
            self.writes.remote_reads.fetch_add(1, Ordering::Relaxed);
        }
        if self.config.enabled {
            metrics::counter!("cache_reads_total", 1, "remote" => remote.to_string());
        }
    }

    /// Record an asynchronous replication event: "enqueued", "retry",
    /// "delivered" or "dropped"
    pub fn record_async_event(&self, event: &str) {
        let counter = match event {
            "enqueued" => &self.writes.async_enqueued,
            "retry" => &self.writes.async_retries,
            "delivered" => &self.writes.async_delivered,
            "dropped" => &self.writes.async_dropped,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if self.config.enabled {
            metrics::counter!("cache_async_replication_total", 1, "event" => event.to_string());
        }
    }

    /// Record a newly installed view
    pub fn record_view_installed(&self, view_id: u64, members: usize) {
        self.cluster.view_changes.fetch_add(1, Ordering::Relaxed);
        self.cluster.view_id.store(view_id, Ordering::Relaxed);
        self.cluster.members.store(members, Ordering::Relaxed);
        if self.config.enabled {
            metrics::counter!("cache_view_changes_total", 1);
            metrics::gauge!("cache_view_id", view_id as f64);
            metrics::gauge!("cache_cluster_members", members as f64);
        }
    }

    pub fn record_view_change_round(&self, outcome: &str, duration: Duration) {
        self.cluster.view_change_rounds.fetch_add(1, Ordering::Relaxed);
        if self.config.enabled {
            metrics::counter!("cache_view_change_rounds_total", 1, "outcome" => outcome.to_string());
            metrics::histogram!("cache_view_change_duration_ms", duration.as_millis() as f64);
        }
    }

    pub fn record_degraded(&self) {
        self.cluster.degraded_events.fetch_add(1, Ordering::Relaxed);
        if self.config.enabled {
            metrics::counter!("cache_cluster_degraded_total", 1);
        }
    }

    /// Update failure detector counts
    pub fn update_member_health(&self, suspected: usize, failed: usize) {
        self.cluster.suspected_nodes.store(suspected, Ordering::Relaxed);
        self.cluster.failed_nodes.store(failed, Ordering::Relaxed);
        if self.config.enabled {
            metrics::gauge!("cache_suspected_members", suspected as f64);
            metrics::gauge!("cache_failed_members", failed as f64);
        }
    }

    /// Record a finished distributed query
    pub fn record_query(&self, complete: bool, timed_out: usize, failed: usize, early: bool, duration: Duration) {
        self.queries.queries_total.fetch_add(1, Ordering::Relaxed);
        if !complete {
            self.queries.partial_queries.fetch_add(1, Ordering::Relaxed);
        }
        self.queries.node_timeouts.fetch_add(timed_out as u64, Ordering::Relaxed);
        self.queries.node_failures.fetch_add(failed as u64, Ordering::Relaxed);
        if early {
            self.queries.early_terminations.fetch_add(1, Ordering::Relaxed);
        }
        if self.config.enabled {
            metrics::counter!("cache_queries_total", 1, "complete" => complete.to_string());
            metrics::histogram!("cache_query_duration_ms", duration.as_millis() as f64);
        }
    }

    /// Get all metrics as a structured summary
    pub fn get_metrics_summary(&self) -> MetricsSummary {
        MetricsSummary {
            uptime_seconds: self.uptime().as_secs(),
            writes_total: self.writes.writes_total.load(Ordering::Relaxed),
            writes_failed: self.writes.writes_failed.load(Ordering::Relaxed),
            conditions_not_met: self.writes.conditions_not_met.load(Ordering::Relaxed),
            partial_replication_failures: self.writes.partial_replication_failures.load(Ordering::Relaxed),
            write_restarts: self.writes.write_restarts.load(Ordering::Relaxed),
            async_enqueued: self.writes.async_enqueued.load(Ordering::Relaxed),
            async_retries: self.writes.async_retries.load(Ordering::Relaxed),
            async_delivered: self.writes.async_delivered.load(Ordering::Relaxed),
            async_dropped: self.writes.async_dropped.load(Ordering::Relaxed),
            reads_total: self.writes.reads_total.load(Ordering::Relaxed),
            remote_reads: self.writes.remote_reads.load(Ordering::Relaxed),
            members: self.cluster.members.load(Ordering::Relaxed),
            view_id: self.cluster.view_id.load(Ordering::Relaxed),
            view_changes: self.cluster.view_changes.load(Ordering::Relaxed),
            degraded_events: self.cluster.degraded_events.load(Ordering::Relaxed),
            suspected_nodes: self.cluster.suspected_nodes.load(Ordering::Relaxed),
            failed_nodes: self.cluster.failed_nodes.load(Ordering::Relaxed),
            queries_total: self.queries.queries_total.load(Ordering::Relaxed),
            partial_queries: self.queries.partial_queries.load(Ordering::Relaxed),
            query_node_timeouts: self.queries.node_timeouts.load(Ordering::Relaxed),
            early_terminations: self.queries.early_terminations.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

/// Point-in-time copy of a node's counters
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub uptime_seconds: u64,
    pub writes_total: u64,
    pub writes_failed: u64,
    pub conditions_not_met: u64,
    pub partial_replication_failures: u64,
    pub write_restarts: u64,
    pub async_enqueued: u64,
    pub async_retries: u64,
    pub async_delivered: u64,
    pub async_dropped: u64,
    pub reads_total: u64,
    pub remote_reads: u64,
    pub members: usize,
    pub view_id: u64,
    pub view_changes: u64,
    pub degraded_events: u64,
    pub suspected_nodes: usize,
    pub failed_nodes: usize,
    pub queries_total: u64,
    pub partial_queries: u64,
    pub query_node_timeouts: u64,
    pub early_terminations: u64,
}

impl fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Node Metrics:")?;
        writeln!(f, "  Uptime: {}s", self.uptime_seconds)?;
        writeln!(f, "  View: {} ({} members, {} changes)", self.view_id, self.members, self.view_changes)?;
        writeln!(f, "  Writes: {} ({} failed, {} not applied)", self.writes_total, self.writes_failed, self.conditions_not_met)?;
        writeln!(f, "  Partial Replication Failures: {}", self.partial_replication_failures)?;
        writeln!(
            f,
            "  Async: {} enqueued, {} delivered, {} retried, {} dropped",
            self.async_enqueued, self.async_delivered, self.async_retries, self.async_dropped
        )?;
        writeln!(f, "  Reads: {} ({} remote)", self.reads_total, self.remote_reads)?;
        write!(f, "  Queries: {} ({} partial)", self.queries_total, self.partial_queries)
    }
}
