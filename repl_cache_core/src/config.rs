//! Configuration management for the replicated cache
//!
//! Node configuration is read from TOML or YAML files with serde. Every
//! section has defaults, so a file only needs the settings it changes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::replication::ReplicationMode;
use crate::topology::{NodeDescriptor, NodeId, TopologyInfo};

/// Main configuration structure for a cache node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Client-facing server configuration
    pub server: ServerConfig,
    /// Local store configuration
    pub storage: StorageConfig,
    /// Cluster membership configuration
    pub cluster: ClusterConfig,
    /// Replication configuration
    pub replication: ReplicationConfig,
    /// Distributed query configuration
    pub query: QueryConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Client-facing server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: String,
    /// Text protocol port
    pub port: u16,
    /// Admin HTTP port (health, topology, metrics)
    pub admin_port: u16,
    /// Maximum number of concurrent client connections
    pub max_connections: usize,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
}

/// Local store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Maximum number of entries held locally
    pub max_entries: Option<usize>,
    /// Periodically drop expired entries
    pub enable_expiry_cleanup: bool,
    /// Expiry cleanup interval in milliseconds
    pub expiry_cleanup_interval_ms: u64,
    /// Entries sampled per cleanup cycle
    pub expiry_cleanup_sample_size: usize,
}

/// Cluster membership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Node ID
    pub node_id: String,
    /// Machine the node runs on
    pub machine_id: Option<String>,
    /// Rack the node is mounted in
    pub rack_id: Option<String>,
    /// Site (data center) hosting the node
    pub site_id: Option<String>,
    /// Cluster transport bind address
    pub bind_address: String,
    /// Cluster transport port
    pub port: u16,
    /// Existing members contacted when joining
    pub seed_nodes: Vec<SeedNode>,
    /// Interval between failure detector heartbeats in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Silence after which a member is suspected, in milliseconds
    pub suspect_timeout_ms: u64,
    /// Silence after which a member is declared failed, in milliseconds
    pub failure_timeout_ms: u64,
    /// Time a member has to acknowledge a prepared view, in milliseconds
    pub prepare_timeout_ms: u64,
    /// Timeout for a single cluster request in milliseconds
    pub request_timeout_ms: u64,
    /// Rounds a view change may restart after excluding silent members
    pub max_view_change_rounds: usize,
    /// Lower bound on the acknowledgements needed to install a view
    pub min_quorum: Option<usize>,
    /// Ring positions per member
    pub virtual_nodes: usize,
}

/// A member to contact when joining
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedNode {
    pub node_id: String,
    pub address: String,
}

impl SeedNode {
    /// Parse `id@host:port`
    pub fn parse(input: &str) -> Result<Self, String> {
        match input.split_once('@') {
            Some((id, address)) if !id.is_empty() && !address.is_empty() => Ok(Self {
                node_id: id.to_string(),
                address: address.to_string(),
            }),
            _ => Err(format!("invalid seed '{}', expected id@host:port", input)),
        }
    }

    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor::new(NodeId::new(&self.node_id), TopologyInfo::default(), &self.address)
    }
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Mode used when a write does not specify one
    pub mode: ReplicationMode,
    /// Owners per key (unset = every member)
    pub owner_count: Option<usize>,
    /// Time a synchronous write waits for each owner, in milliseconds
    pub sync_timeout_ms: u64,
    /// Delivery attempts for an asynchronous update before it is dropped
    pub async_max_retries: u32,
    /// First retry delay in milliseconds
    pub async_backoff_base_ms: u64,
    /// Retry delay ceiling in milliseconds
    pub async_backoff_max_ms: u64,
    /// Restarts allowed when a write races a view change
    pub max_write_restarts: usize,
    /// Longest a write waits for a pending view change, in milliseconds
    pub view_change_wait_ms: u64,
}

/// Distributed query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Per-node timeout when a query does not set one, in milliseconds
    pub per_node_timeout_ms: u64,
    /// Result bound when a query does not set one
    pub default_limit: Option<usize>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Log file path (optional)
    pub file_path: Option<String>,
    /// Enable console output
    pub console: bool,
    /// Rotation of the log file
    pub rotation: LogRotationInterval,
}

/// Log level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Log format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Simple text format
    Simple,
    /// JSON format
    Json,
    /// Pretty format with colors
    Pretty,
}

/// Log rotation interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRotationInterval {
    Daily,
    Hourly,
    Never,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics
    pub enabled: bool,
    /// Install the Prometheus recorder served at /metrics
    pub prometheus: bool,
    /// Custom labels
    pub labels: HashMap<String, String>,
}

impl CacheConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: CacheConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: CacheConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load from a file, picking the format from its extension
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_file(path),
            _ => Self::from_file(path),
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save configuration to a YAML file
    pub fn save_to_yaml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("Server port cannot be 0".to_string());
        }
        if self.server.max_connections == 0 {
            errors.push("Max connections cannot be 0".to_string());
        }

        if let Some(0) = self.storage.max_entries {
            errors.push("Max entries cannot be 0".to_string());
        }

        if self.cluster.node_id.is_empty() {
            errors.push("Node ID cannot be empty".to_string());
        }
        if self.cluster.port == 0 {
            errors.push("Cluster port cannot be 0".to_string());
        }
        if self.cluster.heartbeat_interval_ms == 0 {
            errors.push("Heartbeat interval cannot be 0".to_string());
        }
        if self.cluster.suspect_timeout_ms >= self.cluster.failure_timeout_ms {
            errors.push("Suspect timeout must be shorter than failure timeout".to_string());
        }
        if self.cluster.max_view_change_rounds == 0 {
            errors.push("Max view change rounds cannot be 0".to_string());
        }
        if self.cluster.virtual_nodes == 0 {
            errors.push("Virtual nodes cannot be 0".to_string());
        }
        if let Some(0) = self.cluster.min_quorum {
            errors.push("Minimum quorum cannot be 0".to_string());
        }
        for seed in &self.cluster.seed_nodes {
            if seed.node_id.is_empty() || seed.address.is_empty() {
                errors.push("Seed nodes need both node_id and address".to_string());
            }
        }

        if let Some(0) = self.replication.owner_count {
            errors.push("Owner count cannot be 0".to_string());
        }
        if self.replication.sync_timeout_ms == 0 {
            errors.push("Sync timeout cannot be 0".to_string());
        }
        if self.replication.async_backoff_base_ms > self.replication.async_backoff_max_ms {
            errors.push("Async backoff base cannot exceed the maximum".to_string());
        }

        if self.query.per_node_timeout_ms == 0 {
            errors.push("Query per-node timeout cannot be 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// This node's descriptor, built from the cluster section
    pub fn local_descriptor(&self) -> NodeDescriptor {
        NodeDescriptor::new(
            NodeId::new(&self.cluster.node_id),
            self.cluster.topology(),
            format!("{}:{}", self.cluster.bind_address, self.cluster.port),
        )
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_duration(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get suspect timeout as Duration
    pub fn suspect_duration(&self) -> Duration {
        Duration::from_millis(self.cluster.suspect_timeout_ms)
    }

    /// Get failure timeout as Duration
    pub fn failure_duration(&self) -> Duration {
        Duration::from_millis(self.cluster.failure_timeout_ms)
    }

    /// Get prepare timeout as Duration
    pub fn prepare_duration(&self) -> Duration {
        Duration::from_millis(self.cluster.prepare_timeout_ms)
    }

    /// Get cluster request timeout as Duration
    pub fn request_duration(&self) -> Duration {
        Duration::from_millis(self.cluster.request_timeout_ms)
    }

    /// Get expiry cleanup interval as Duration
    pub fn expiry_cleanup_duration(&self) -> Duration {
        Duration::from_millis(self.storage.expiry_cleanup_interval_ms)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_duration(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout)
    }
}

impl ClusterConfig {
    pub fn topology(&self) -> TopologyInfo {
        TopologyInfo {
            machine_id: self.machine_id.clone(),
            rack_id: self.rack_id.clone(),
            site_id: self.site_id.clone(),
        }
    }
}

impl ReplicationConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.async_backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.async_backoff_max_ms)
    }

    pub fn view_change_wait(&self) -> Duration {
        Duration::from_millis(self.view_change_wait_ms)
    }
}

impl QueryConfig {
    pub fn per_node_timeout(&self) -> Duration {
        Duration::from_millis(self.per_node_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 6379,
            admin_port: 8080,
            max_connections: 1000,
            shutdown_timeout: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_entries: None,
            enable_expiry_cleanup: true,
            expiry_cleanup_interval_ms: 1000,
            expiry_cleanup_sample_size: 20,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            machine_id: None,
            rack_id: None,
            site_id: None,
            bind_address: "127.0.0.1".to_string(),
            port: 7000,
            seed_nodes: Vec::new(),
            heartbeat_interval_ms: 500,
            suspect_timeout_ms: 1500,
            failure_timeout_ms: 5000,
            prepare_timeout_ms: 1000,
            request_timeout_ms: 2000,
            max_view_change_rounds: 3,
            min_quorum: None,
            virtual_nodes: 150,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::Sync,
            owner_count: None,
            sync_timeout_ms: 2000,
            async_max_retries: 5,
            async_backoff_base_ms: 50,
            async_backoff_max_ms: 2000,
            max_write_restarts: 3,
            view_change_wait_ms: 3000,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            per_node_timeout_ms: 2000,
            default_limit: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Simple,
            file_path: None,
            console: true,
            rotation: LogRotationInterval::Daily,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prometheus: true,
            labels: HashMap::new(),
        }
    }
}
