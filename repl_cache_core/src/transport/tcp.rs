//! TCP transport
//!
//! Requests are length-delimited bincode frames, one response frame per
//! request. The client keeps idle connections per peer address and reuses
//! them; a connection carries one request at a time. The server side keeps
//! a connection open for as many frames as the peer sends.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::{ClusterMessage, ClusterResponse, ClusterTransport, MessageHandler};
use crate::error::TransportError;
use crate::topology::NodeDescriptor;

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

const DEFAULT_MAX_IDLE_PER_PEER: usize = 8;

/// Client side of the TCP transport
#[derive(Debug, Clone)]
pub struct TcpTransport {
    request_timeout: Duration,
    max_idle_per_peer: usize,
    idle: Arc<Mutex<HashMap<String, Vec<Connection>>>>,
}

impl TcpTransport {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            max_idle_per_peer: DEFAULT_MAX_IDLE_PER_PEER,
            idle: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_max_idle_per_peer(mut self, max_idle: usize) -> Self {
        self.max_idle_per_peer = max_idle;
        self
    }

    /// Idle pooled connections to `address`
    pub fn idle_connections(&self, address: &str) -> usize {
        self.pool().get(address).map_or(0, Vec::len)
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Connection>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn checkout(&self, address: &str) -> Option<Connection> {
        self.pool().get_mut(address).and_then(Vec::pop)
    }

    fn checkin(&self, address: &str, connection: Connection) {
        let mut pool = self.pool();
        let idle = pool.entry(address.to_string()).or_default();
        if idle.len() < self.max_idle_per_peer {
            idle.push(connection);
        }
    }

    /// Drop every idle connection to `address`
    pub fn forget(&self, address: &str) {
        self.pool().remove(address);
    }

    async fn dial(target: &NodeDescriptor) -> Result<Connection, TransportError> {
        let stream = TcpStream::connect(&target.address)
            .await
            .map_err(|_| TransportError::Unreachable(target.id.clone()))?;
        stream.set_nodelay(true)?;
        Ok(Framed::new(stream, LengthDelimitedCodec::new()))
    }

    /// `None` when the peer closed the connection before answering
    async fn round_trip(connection: &mut Connection, payload: Bytes) -> Result<Option<ClusterResponse>, TransportError> {
        connection.send(payload).await?;
        match connection.next().await {
            Some(frame) => Ok(Some(bincode::deserialize::<ClusterResponse>(&frame?)?)),
            None => Ok(None),
        }
    }

    async fn exchange(
        &self,
        target: &NodeDescriptor,
        message: &ClusterMessage,
    ) -> Result<ClusterResponse, TransportError> {
        let payload = Bytes::from(bincode::serialize(message)?);

        if let Some(mut connection) = self.checkout(&target.address) {
            match Self::round_trip(&mut connection, payload.clone()).await {
                Ok(Some(response)) => {
                    self.checkin(&target.address, connection);
                    return Ok(response);
                }
                // Closed while idle, e.g. the peer restarted
                Ok(None) | Err(TransportError::Io(_)) => {
                    tracing::debug!("Pooled connection to {} went stale, redialing", target.id);
                    self.forget(&target.address);
                }
                Err(e) => return Err(e),
            }
        }

        let mut connection = Self::dial(target).await?;
        match Self::round_trip(&mut connection, payload).await? {
            Some(response) => {
                self.checkin(&target.address, connection);
                Ok(response)
            }
            None => Err(TransportError::Unreachable(target.id.clone())),
        }
    }
}

#[async_trait]
impl ClusterTransport for TcpTransport {
    async fn send(
        &self,
        target: &NodeDescriptor,
        message: ClusterMessage,
    ) -> Result<ClusterResponse, TransportError> {
        match tokio::time::timeout(self.request_timeout, self.exchange(target, &message)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                node: target.id.clone(),
                timeout: self.request_timeout,
            }),
        }
    }
}

/// Accepts cluster connections and dispatches frames to a handler
pub struct TransportServer {
    bind_address: String,
    handler: Arc<dyn MessageHandler>,
    local_addr: Option<SocketAddr>,
    stop_tx: Option<mpsc::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl TransportServer {
    pub fn new(bind_address: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            bind_address: bind_address.into(),
            handler,
            local_addr: None,
            stop_tx: None,
            task_handle: None,
        }
    }

    /// Bind and start accepting. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Cluster transport listening on {}", local_addr);

        let (stop_tx, stop_rx) = mpsc::channel(1);
        self.stop_tx = Some(stop_tx);
        self.local_addr = Some(local_addr);

        let handler = Arc::clone(&self.handler);
        self.task_handle = Some(tokio::spawn(async move {
            Self::run_accept_loop(listener, handler, stop_rx).await;
        }));
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(()).await;
        }
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }

    async fn run_accept_loop(
        listener: TcpListener,
        handler: Arc<dyn MessageHandler>,
        mut stop_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            if let Err(e) = Self::serve_connection(stream, handler).await {
                                tracing::debug!("Cluster connection from {} closed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("Cluster accept failed: {}", e),
                },
                _ = stop_rx.recv() => {
                    tracing::info!("Cluster transport stopping");
                    break;
                }
            }
        }
    }

    async fn serve_connection(stream: TcpStream, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError> {
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        while let Some(frame) = framed.next().await {
            let frame = frame?;
            let response = match bincode::deserialize::<ClusterMessage>(&frame) {
                Ok(message) => handler.handle(message).await,
                Err(e) => ClusterResponse::Error(format!("undecodable request: {}", e)),
            };
            framed.send(Bytes::from(bincode::serialize(&response)?)).await?;
        }
        Ok(())
    }
}
