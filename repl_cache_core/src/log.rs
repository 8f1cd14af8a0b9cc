//! Structured logging for the replicated cache
//!
//! Logging goes through the `tracing` crate. `init_logging` installs a
//! subscriber with an env filter (`RUST_LOG` overrides the configured
//! level), console output in simple, pretty or JSON form, and an optional
//! rotating JSON log file written off-thread by `tracing-appender`.

use crate::config::{LogFormat, LogLevel, LogRotationInterval, LoggingConfig};
use std::path::Path;
use std::sync::{Once, OnceLock};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{format::FmtSpan, time::UtcTime};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

static INIT: Once = Once::new();
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize the logging system based on configuration. Only the first
/// call has an effect.
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = init_logging_inner(config);
    });
    result
}

fn init_logging_inner(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(&config.level)));

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.console {
        layers.push(console_layer(&config.format));
    }
    if let Some(file_path) = &config.file_path {
        layers.push(create_file_layer(file_path, &config.rotation)?);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()?;

    tracing::info!("Logging system initialized with level: {:?}", config.level);
    Ok(())
}

fn console_layer(format: &LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_timer(UtcTime::rfc_3339())
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_names(true)
            .with_timer(UtcTime::rfc_3339())
            .boxed(),
        LogFormat::Simple => fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_timer(UtcTime::rfc_3339())
            .boxed(),
    }
}

/// JSON lines into a rotating file. The writer guard lives for the rest of
/// the process so buffered lines are flushed on exit.
fn create_file_layer(
    file_path: &str,
    rotation: &LogRotationInterval,
) -> Result<BoxedLayer, Box<dyn std::error::Error>> {
    let path = Path::new(file_path);
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| format!("log file path '{}' has no file name", file_path))?;

    std::fs::create_dir_all(directory)?;
    let appender = match rotation {
        LogRotationInterval::Daily => tracing_appender::rolling::daily(directory, file_name),
        LogRotationInterval::Hourly => tracing_appender::rolling::hourly(directory, file_name),
        LogRotationInterval::Never => tracing_appender::rolling::never(directory, file_name),
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);

    Ok(fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(writer)
        .with_timer(UtcTime::rfc_3339())
        .boxed())
}

fn level_directive(level: &LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

fn format_fields(fields: &[(&str, String)]) -> String {
    fields
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log a cluster operation with structured fields
pub fn log_cluster_operation(
    operation: &str,
    node_id: &str,
    success: bool,
    duration: Duration,
    additional_fields: Option<Vec<(&str, String)>>,
) {
    let span = tracing::info_span!(
        "cluster_operation",
        operation = operation,
        node_id = node_id,
        success = success,
        duration_ms = duration.as_millis() as u64,
    );
    let _enter = span.enter();

    let details = additional_fields.map(|f| format_fields(&f)).unwrap_or_default();
    if success {
        tracing::info!(details = %details, "Cluster operation completed");
    } else {
        tracing::warn!(details = %details, "Cluster operation failed");
    }
}

/// Log a replicated write with structured fields
pub fn log_replication_operation(
    operation: &str,
    key: &str,
    view_id: u64,
    success: bool,
    duration: Duration,
    additional_fields: Option<Vec<(&str, String)>>,
) {
    let span = tracing::debug_span!(
        "replication_operation",
        operation = operation,
        key = key,
        view_id = view_id,
        success = success,
        duration_ms = duration.as_millis() as u64,
    );
    let _enter = span.enter();

    let details = additional_fields.map(|f| format_fields(&f)).unwrap_or_default();
    if success {
        tracing::debug!(details = %details, "Replication operation completed");
    } else {
        tracing::warn!(details = %details, "Replication operation failed");
    }
}

/// Log a distributed query
pub fn log_query_operation(
    query_id: u64,
    candidates: usize,
    complete: bool,
    results: usize,
    duration: Duration,
) {
    let span = tracing::info_span!(
        "query_operation",
        query_id = query_id,
        candidates = candidates,
        complete = complete,
        results = results,
        duration_ms = duration.as_millis() as u64,
    );
    let _enter = span.enter();

    if complete {
        tracing::debug!("Query completed");
    } else {
        tracing::warn!("Query returned a partial result");
    }
}

/// Log one round of a view change
pub fn log_view_change(
    coordinator: &str,
    candidate_view: u64,
    round: usize,
    members: usize,
    outcome: &str,
    duration: Duration,
) {
    let span = tracing::info_span!(
        "view_change",
        coordinator = coordinator,
        candidate_view = candidate_view,
        round = round,
        members = members,
        duration_ms = duration.as_millis() as u64,
    );
    let _enter = span.enter();
    tracing::info!(outcome = outcome, "View change round finished");
}

/// Log system startup
pub fn log_startup(config: &crate::config::CacheConfig) {
    tracing::info!("Starting replicated cache node {}", config.cluster.node_id);
    tracing::info!(
        "Client protocol on {}:{}, admin on port {}",
        config.server.bind_address,
        config.server.port,
        config.server.admin_port
    );
    tracing::info!(
        "Cluster transport on {}:{} ({})",
        config.cluster.bind_address,
        config.cluster.port,
        config.cluster.topology()
    );
    tracing::info!(
        "Replication mode {:?}, owners per key: {}",
        config.replication.mode,
        config
            .replication
            .owner_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| "all".to_string())
    );
    if !config.cluster.seed_nodes.is_empty() {
        tracing::info!("Joining through {} seed node(s)", config.cluster.seed_nodes.len());
    }
}

/// Log system shutdown
pub fn log_shutdown(reason: &str) {
    tracing::info!("Shutting down replicated cache node: {}", reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive(&LogLevel::Error), "error");
        assert_eq!(level_directive(&LogLevel::Warn), "warn");
        assert_eq!(level_directive(&LogLevel::Info), "info");
        assert_eq!(level_directive(&LogLevel::Debug), "debug");
        assert_eq!(level_directive(&LogLevel::Trace), "trace");
    }

    #[test]
    fn test_format_fields() {
        let fields = vec![("view", "3".to_string()), ("members", "2".to_string())];
        assert_eq!(format_fields(&fields), "view=3 members=2");
    }

    #[test]
    fn test_logging_initialization() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        // Second call is a no-op
        assert!(init_logging(&config).is_ok());
    }

    #[test]
    fn test_log_helpers_without_subscriber() {
        log_cluster_operation("join", "a", true, Duration::from_millis(5), None);
        log_replication_operation("put", "k", 1, false, Duration::from_millis(1), Some(vec![("owners", "3".to_string())]));
        log_query_operation(1, 3, true, 10, Duration::from_millis(2));
        log_view_change("a", 2, 1, 3, "committed", Duration::from_millis(4));
    }
}
