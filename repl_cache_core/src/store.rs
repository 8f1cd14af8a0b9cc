//! Local per-node storage
//!
//! [`LocalStore`] is the seam between the cluster layer and whatever keeps
//! entries on a node. [`MemoryStore`] is the in-memory implementation: a
//! map of value plus optional expiry instant, with expired entries hidden
//! on read and dropped by a sampled background sweep.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use crate::error::StoreError;
use crate::query::Predicate;

/// A key and its value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: String,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Storage engine operations used by the cluster layer
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn local_get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value`, returning the previous live value
    async fn local_put(
        &self,
        key: String,
        value: String,
        expiry: Option<Duration>,
    ) -> Result<Option<String>, StoreError>;

    /// Remove `key`, returning the previous live value
    async fn local_remove(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Live entries matching `predicate`, sorted by key, at most `limit`
    async fn local_scan(&self, predicate: &Predicate, limit: Option<usize>) -> Result<Vec<Entry>, StoreError>;

    async fn local_len(&self) -> usize;
}

type EntryMap = HashMap<String, (String, Option<Instant>)>;

#[derive(Debug)]
pub struct MemoryStore {
    data: Arc<RwLock<EntryMap>>,
    max_entries: Option<usize>,
    expiration_task: Option<tokio::task::JoinHandle<()>>,
    cleanup_interval: Duration,
    sample_size: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_entries: None,
            expiration_task: None,
            cleanup_interval: Duration::from_secs(1),
            sample_size: 20,
        }
    }

    pub fn with_max_entries(mut self, max_entries: Option<usize>) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_cleanup_config(mut self, interval: Duration, sample_size: usize) -> Self {
        self.cleanup_interval = interval;
        self.sample_size = sample_size.max(1);
        self
    }

    /// Spawn the background sweep. Must be called inside a tokio runtime.
    pub fn with_expiration_cleanup(mut self) -> Self {
        let data = Arc::clone(&self.data);
        let interval = self.cleanup_interval;
        let sample_size = self.sample_size;

        self.expiration_task = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                Self::cleanup_expired_sample(&data, sample_size).await;
            }
        }));
        self
    }

    async fn cleanup_expired_sample(data: &Arc<RwLock<EntryMap>>, sample_size: usize) -> usize {
        let mut data = data.write().await;
        let now = Instant::now();

        let expired: Vec<String> = data
            .iter()
            .filter(|(_, (_, expiry))| matches!(expiry, Some(at) if *at <= now))
            .take(sample_size)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            data.remove(key);
        }
        if !expired.is_empty() {
            tracing::debug!("Dropped {} expired entries", expired.len());
        }
        expired.len()
    }

    fn live(entry: Option<&(String, Option<Instant>)>, now: Instant) -> Option<String> {
        match entry {
            Some((value, None)) => Some(value.clone()),
            Some((value, Some(at))) if *at > now => Some(value.clone()),
            _ => None,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(task) = self.expiration_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn local_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let data = self.data.read().await;
        Ok(Self::live(data.get(key), Instant::now()))
    }

    async fn local_put(
        &self,
        key: String,
        value: String,
        expiry: Option<Duration>,
    ) -> Result<Option<String>, StoreError> {
        let mut data = self.data.write().await;
        let now = Instant::now();

        if let Some(limit) = self.max_entries {
            if !data.contains_key(&key) && data.len() >= limit {
                // Expired entries don't count against the limit
                data.retain(|_, (_, at)| at.map(|at| at > now).unwrap_or(true));
                if data.len() >= limit {
                    return Err(StoreError::CapacityExceeded { limit });
                }
            }
        }

        let expires_at = expiry.map(|ttl| now + ttl);
        let previous = data.insert(key, (value, expires_at));
        Ok(Self::live(previous.as_ref(), now))
    }

    async fn local_remove(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut data = self.data.write().await;
        let previous = data.remove(key);
        Ok(Self::live(previous.as_ref(), Instant::now()))
    }

    async fn local_scan(&self, predicate: &Predicate, limit: Option<usize>) -> Result<Vec<Entry>, StoreError> {
        let data = self.data.read().await;
        let now = Instant::now();

        let mut entries: Vec<Entry> = match predicate.exact_key() {
            Some(key) => Self::live(data.get(key), now)
                .filter(|value| predicate.matches(key, value))
                .map(|value| Entry::new(key, value))
                .into_iter()
                .collect(),
            None => data
                .iter()
                .filter_map(|(key, entry)| {
                    Self::live(Some(entry), now)
                        .filter(|value| predicate.matches(key, value))
                        .map(|value| Entry::new(key.clone(), value))
                })
                .collect(),
        };

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn local_len(&self) -> usize {
        let data = self.data.read().await;
        let now = Instant::now();
        data.values().filter(|(_, at)| at.map(|at| at > now).unwrap_or(true)).count()
    }
}
