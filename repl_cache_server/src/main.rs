use clap::{Args, Parser, Subcommand};
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};

use repl_cache_core::config::{CacheConfig, SeedNode};
use repl_cache_core::log::{init_logging, log_shutdown, log_startup};
use repl_cache_core::metrics::{install_prometheus, MetricsCollector};
use repl_cache_core::replication::ReplicationMode;
use repl_cache_core::server::AdminServer;
use repl_cache_core::transport::{MessageHandler, TcpTransport, TransportServer};
use repl_cache_core::{ClusterNode, MemoryStore};

mod client;
mod commands;
mod protocol;

#[derive(Parser)]
#[command(name = "repl_cache_server", version, about = "Replicated in-memory cache node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a cache node
    Serve(ServeArgs),
    /// Interactive line client
    Client {
        #[arg(long, default_value = "127.0.0.1:6379")]
        address: String,
    },
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// TOML or YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    node_id: Option<String>,
    /// Client protocol port
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    cluster_port: Option<u16>,
    #[arg(long)]
    admin_port: Option<u16>,
    /// Existing member as `id@host:port`; repeatable
    #[arg(long = "seed")]
    seeds: Vec<String>,
    #[arg(long)]
    site: Option<String>,
    #[arg(long)]
    rack: Option<String>,
    #[arg(long)]
    machine: Option<String>,
    /// Default replication mode (sync or async)
    #[arg(long)]
    mode: Option<ReplicationMode>,
    #[arg(long)]
    owners: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Client { address } => client::run_client(&address).await,
        Command::Serve(args) => {
            let config = load_config(args)?;
            run_node(config).await
        }
    }
}

fn load_config(args: ServeArgs) -> Result<CacheConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::load(path)?,
        None => CacheConfig::default(),
    };

    if let Some(node_id) = args.node_id {
        config.cluster.node_id = node_id;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(port) = args.cluster_port {
        config.cluster.port = port;
    }
    if let Some(port) = args.admin_port {
        config.server.admin_port = port;
    }
    for seed in &args.seeds {
        config.cluster.seed_nodes.push(SeedNode::parse(seed)?);
    }
    if args.site.is_some() {
        config.cluster.site_id = args.site;
    }
    if args.rack.is_some() {
        config.cluster.rack_id = args.rack;
    }
    if args.machine.is_some() {
        config.cluster.machine_id = args.machine;
    }
    if let Some(mode) = args.mode {
        config.replication.mode = mode;
    }
    if args.owners.is_some() {
        config.replication.owner_count = args.owners;
    }

    config
        .validate()
        .map_err(|errors| format!("invalid configuration: {}", errors.join("; ")))?;
    Ok(config)
}

async fn run_node(config: CacheConfig) -> Result<(), Box<dyn Error>> {
    init_logging(&config.logging)?;
    log_startup(&config);

    let prometheus = if config.metrics.enabled && config.metrics.prometheus {
        install_prometheus()
    } else {
        None
    };
    let metrics = Arc::new(MetricsCollector::new(config.metrics.clone()));

    let mut store = MemoryStore::new()
        .with_max_entries(config.storage.max_entries)
        .with_cleanup_config(config.expiry_cleanup_duration(), config.storage.expiry_cleanup_sample_size);
    if config.storage.enable_expiry_cleanup {
        store = store.with_expiration_cleanup();
    }

    let transport = Arc::new(TcpTransport::new(config.request_duration()));
    let node = ClusterNode::new(config.clone(), Arc::new(store), transport, metrics)?;

    let handler: Arc<dyn MessageHandler> = node.clone();
    let mut transport_server = TransportServer::new(
        format!("{}:{}", config.cluster.bind_address, config.cluster.port),
        handler,
    );
    let cluster_addr = transport_server.start().await?;
    tracing::info!("Cluster transport listening on {}", cluster_addr);

    node.start().await;
    if !config.cluster.seed_nodes.is_empty() {
        let view = node.join_cluster().await?;
        tracing::info!("Joined cluster, view {} with {} members", view.view_id(), view.len());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.admin_port).parse()?;
    let admin = AdminServer::new(node.clone(), prometheus);
    let mut admin_shutdown = shutdown_rx.clone();
    let admin_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = admin_shutdown.changed().await;
        };
        if let Err(e) = admin.start(admin_addr, shutdown).await {
            tracing::error!("Admin server failed: {}", e);
        }
    });

    let listener = TcpListener::bind(format!("{}:{}", config.server.bind_address, config.server.port)).await?;
    tracing::info!("Client protocol listening on {}", listener.local_addr()?);
    let connections = Arc::new(Semaphore::new(config.server.max_connections));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                let Ok(permit) = Arc::clone(&connections).try_acquire_owned() else {
                    tracing::warn!("Connection limit reached, rejecting {}", addr);
                    continue;
                };
                let node = Arc::clone(&node);
                tokio::spawn(async move {
                    tracing::debug!("Client connected: {}", addr);
                    if let Err(e) = handle_client(socket, node).await {
                        tracing::warn!("Client {} error: {}", addr, e);
                    }
                    drop(permit);
                });
            }
            _ = tokio::signal::ctrl_c() => {
                log_shutdown("interrupt received");
                break;
            }
        }
    }

    if let Err(e) = node.leave().await {
        tracing::warn!("Leaving the cluster failed: {}", e);
    }
    if !node.flush_replication(config.shutdown_duration()).await {
        tracing::warn!("Asynchronous updates still pending at shutdown");
    }
    node.stop().await;
    transport_server.stop().await;
    let _ = shutdown_tx.send(true);
    let _ = admin_handle.await;

    tracing::info!("Node {} stopped", config.cluster.node_id);
    Ok(())
}

async fn handle_client(mut socket: TcpStream, node: Arc<ClusterNode>) -> Result<(), Box<dyn Error + Send + Sync>> {
    let (reader, mut writer) = socket.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let reply = match protocol::parse_command(&line) {
            Ok(cmd) => commands::process_command(node.as_ref(), cmd).await,
            Err(e) => protocol::RespValue::error(format!("ERR {}", e)),
        };
        writer.write_all(reply.to_string().as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}
