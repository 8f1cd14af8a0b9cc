//! Background delivery of asynchronously replicated writes
//!
//! Each target node gets its own FIFO worker, so updates to one target are
//! delivered in the order the primary decided them. A failed delivery is
//! retried with exponential backoff plus jitter until it is acknowledged,
//! the retry budget runs out, or the target leaves the view. A worker whose
//! target left the view is retired once its queue drains.

use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use super::Mutation;
use crate::config::ReplicationConfig;
use crate::metrics::MetricsCollector;
use crate::topology::{NodeDescriptor, NodeId};
use crate::transport::{send_with_timeout, ClusterMessage, ClusterResponse, ClusterTransport};
use crate::view::{ClusterView, ViewHandle};

#[derive(Debug, Clone)]
struct PendingUpdate {
    target: NodeDescriptor,
    key: String,
    mutation: Mutation,
    view_id: u64,
}

#[derive(Debug, Clone)]
struct RetrySettings {
    max_retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    request_timeout: Duration,
}

struct ReplicatorInner {
    transport: Arc<dyn ClusterTransport>,
    views: Arc<ViewHandle>,
    settings: RetrySettings,
    workers: Mutex<HashMap<NodeId, mpsc::UnboundedSender<PendingUpdate>>>,
    pending: AtomicUsize,
    idle: Notify,
    metrics: Arc<MetricsCollector>,
}

/// Queues and delivers asynchronous replication traffic
#[derive(Clone)]
pub struct AsyncReplicator {
    inner: Arc<ReplicatorInner>,
}

impl AsyncReplicator {
    pub fn new(
        transport: Arc<dyn ClusterTransport>,
        views: Arc<ViewHandle>,
        config: &ReplicationConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            inner: Arc::new(ReplicatorInner {
                transport,
                views,
                settings: RetrySettings {
                    max_retries: config.async_max_retries,
                    backoff_base: config.backoff_base(),
                    backoff_max: config.backoff_max(),
                    request_timeout: config.sync_timeout(),
                },
                workers: Mutex::new(HashMap::new()),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                metrics,
            }),
        }
    }

    /// Queue `mutation` for every target. Never waits on the network.
    pub async fn enqueue(&self, targets: &[NodeDescriptor], key: &str, mutation: &Mutation, view_id: u64) {
        if targets.is_empty() {
            return;
        }
        let view = self.inner.views.current();
        let mut workers = self.inner.workers();
        for target in targets {
            if !view.contains(&target.id) {
                tracing::debug!("Not queueing update of '{}' for departed member {}", key, target.id);
                self.inner.metrics.record_async_event("dropped");
                continue;
            }
            let update = PendingUpdate {
                target: target.clone(),
                key: key.to_string(),
                mutation: mutation.clone(),
                view_id,
            };
            self.inner.pending.fetch_add(1, Ordering::SeqCst);
            self.inner.metrics.record_async_event("enqueued");

            let sender = workers
                .entry(target.id.clone())
                .or_insert_with(|| self.spawn_worker(target.id.clone()));
            if let Err(mpsc::error::SendError(update)) = sender.send(update) {
                let fresh = self.spawn_worker(target.id.clone());
                if fresh.send(update).is_err() {
                    self.inner.finish_one();
                }
                workers.insert(target.id.clone(), fresh);
            }
        }
    }

    /// Close the queues of targets that are not in `view`. Their workers
    /// work through what is already queued, dropping each update, then exit.
    pub fn retire_departed(&self, view: &ClusterView) -> usize {
        let mut workers = self.inner.workers();
        let before = workers.len();
        workers.retain(|target, _| view.contains(target));
        let retired = before - workers.len();
        if retired > 0 {
            tracing::debug!("Retired {} async replication workers after view {}", retired, view.view_id());
        }
        retired
    }

    /// Targets with an open worker queue
    pub fn workers(&self) -> usize {
        self.inner.workers().len()
    }

    fn spawn_worker(&self, target: NodeId) -> mpsc::UnboundedSender<PendingUpdate> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PendingUpdate>();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tracing::debug!("Async replication worker for {} started", target);
            while let Some(update) = rx.recv().await {
                inner.deliver(update).await;
                inner.finish_one();
            }
            tracing::debug!("Async replication worker for {} stopped", target);
        });
        tx
    }

    /// Updates queued or in flight
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Wait until the queue drains. Returns false on timeout.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            if self.pending() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pending() == 0;
            }
        }
    }

    /// Close every worker queue. Workers finish what is already queued.
    pub async fn shutdown(&self) {
        self.inner.workers().clear();
    }
}

impl ReplicatorInner {
    fn workers(&self) -> MutexGuard<'_, HashMap<NodeId, mpsc::UnboundedSender<PendingUpdate>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn deliver(&self, update: PendingUpdate) {
        let mut attempt: u32 = 0;
        loop {
            if !self.views.current().contains(&update.target.id) {
                tracing::debug!(
                    "Dropping update of '{}' for {}: no longer a member",
                    update.key,
                    update.target.id
                );
                self.metrics.record_async_event("dropped");
                return;
            }

            let message = ClusterMessage::ApplyWrite {
                view_id: update.view_id,
                key: update.key.clone(),
                mutation: update.mutation.clone(),
            };
            match send_with_timeout(self.transport.as_ref(), &update.target, message, self.settings.request_timeout).await {
                Ok(ClusterResponse::Applied) => {
                    self.metrics.record_async_event("delivered");
                    return;
                }
                Ok(other) => tracing::debug!("Unexpected reply from {}: {:?}", update.target.id, other),
                Err(e) => tracing::debug!("Async delivery to {} failed: {}", update.target.id, e),
            }

            if attempt >= self.settings.max_retries {
                tracing::warn!(
                    "Giving up on update of '{}' for {} after {} attempts",
                    update.key,
                    update.target.id,
                    attempt + 1
                );
                self.metrics.record_async_event("dropped");
                return;
            }
            attempt += 1;
            self.metrics.record_async_event("retry");
            tokio::time::sleep(self.backoff(attempt)).await;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .settings
            .backoff_base
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.settings.backoff_max);
        let jitter_cap = (self.settings.backoff_base.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_cap);
        exponential + Duration::from_millis(jitter)
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}
