//! Caller-facing cache interface and decorators
//!
//! [`Cache`] is the capability every front end talks to. Cross-cutting
//! behavior is layered by wrapping one implementation in another, as
//! [`StatsCache`] does for operation counters.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CacheError, CacheResult};
use crate::query::{Predicate, QueryDescriptor, QueryResult};
use crate::replication::ReplicationMode;
use crate::view::ClusterView;

/// Per-write overrides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Replication mode; the configured default when unset
    pub mode: Option<ReplicationMode>,
    /// Entry lifetime; no expiry when unset
    pub expiry: Option<Duration>,
}

impl WriteOptions {
    pub fn sync() -> Self {
        Self::default().with_mode(ReplicationMode::Sync)
    }

    pub fn asynchronous() -> Self {
        Self::default().with_mode(ReplicationMode::Async)
    }

    pub fn with_mode(mut self, mode: ReplicationMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Store `value`, returning the previous value
    async fn put(&self, key: &str, value: String, options: WriteOptions) -> CacheResult<Option<String>>;

    /// Store `value` only if `key` is absent. Returns the existing value
    /// when it was not stored.
    async fn put_if_absent(&self, key: &str, value: String, options: WriteOptions) -> CacheResult<Option<String>>;

    /// Overwrite `key` only if present. Returns the replaced value, `None`
    /// when nothing was replaced.
    async fn replace(&self, key: &str, value: String, options: WriteOptions) -> CacheResult<Option<String>>;

    /// Overwrite `key` only if it currently holds `expected`
    async fn replace_if(&self, key: &str, expected: &str, value: String, options: WriteOptions) -> CacheResult<bool>;

    async fn remove(&self, key: &str, options: WriteOptions) -> CacheResult<Option<String>>;

    /// Remove `key` only if it currently holds `expected`. A condition that
    /// does not hold is reported as `false`, never as an error.
    async fn remove_if(&self, key: &str, expected: &str, options: WriteOptions) -> CacheResult<bool>;

    async fn run_query(&self, descriptor: QueryDescriptor) -> QueryResult;

    /// Snapshot of the installed view
    fn current_topology(&self) -> Arc<ClusterView>;

    /// Drop `key` from this node's local copy only. Other owners keep
    /// theirs and nothing is replicated. Returns whether an entry was held.
    async fn evict(&self, key: &str) -> CacheResult<bool>;

    /// Write every entry. Keys are replicated independently; once all
    /// writes were attempted the first failure in key order is returned.
    async fn put_all(&self, entries: BTreeMap<String, String>, options: WriteOptions) -> CacheResult<()> {
        let mut first_error = None;
        for (key, value) in entries {
            if let Err(e) = self.put(&key, value, options).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn contains_key(&self, key: &str) -> CacheResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Every live key in the cluster. Fails with
    /// [`CacheError::QueryPartial`] when a member did not answer.
    async fn key_set(&self) -> CacheResult<BTreeSet<String>> {
        let entries = self
            .run_query(QueryDescriptor::new(Predicate::All))
            .await
            .into_complete()?;
        Ok(entries.into_iter().map(|entry| entry.key).collect())
    }

    /// Number of distinct live keys in the cluster
    async fn size(&self) -> CacheResult<usize> {
        Ok(self.key_set().await?.len())
    }

    async fn is_empty(&self) -> CacheResult<bool> {
        let descriptor = QueryDescriptor::new(Predicate::All)
            .with_limit(1)
            .with_early_termination();
        let result = self.run_query(descriptor).await;
        if !result.entries.is_empty() {
            return Ok(false);
        }
        Ok(result.into_complete()?.is_empty())
    }

    /// Remove every key in the cluster, each through its primary. Returns
    /// how many entries were removed.
    async fn clear(&self, options: WriteOptions) -> CacheResult<usize> {
        let mut removed = 0;
        let mut first_error: Option<CacheError> = None;
        for key in self.key_set().await? {
            match self.remove(&key, options).await {
                Ok(Some(_)) => removed += 1,
                Ok(None) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(removed), Err)
    }
}

/// Operation counters kept by [`StatsCache`]
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    conditions_not_met: AtomicU64,
    removals: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
    queries: AtomicU64,
    partial_queries: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub conditions_not_met: u64,
    pub removals: u64,
    pub evictions: u64,
    pub errors: u64,
    pub queries: u64,
    pub partial_queries: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            conditions_not_met: self.conditions_not_met.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            partial_queries: self.partial_queries.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }
}

impl StatsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let reads = self.hits + self.misses;
        if reads == 0 {
            0.0
        } else {
            self.hits as f64 / reads as f64
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cache Statistics:")?;
        writeln!(f, "  Hits: {} (ratio {:.2})", self.hits, self.hit_ratio())?;
        writeln!(f, "  Misses: {}", self.misses)?;
        writeln!(f, "  Writes: {}", self.writes)?;
        writeln!(f, "  Conditions not met: {}", self.conditions_not_met)?;
        writeln!(f, "  Removals: {}", self.removals)?;
        writeln!(f, "  Evictions: {}", self.evictions)?;
        writeln!(f, "  Errors: {}", self.errors)?;
        write!(f, "  Queries: {} ({} partial)", self.queries, self.partial_queries)
    }
}

/// Counts operations passing through to an inner [`Cache`]
pub struct StatsCache<C> {
    inner: C,
    stats: CacheStats,
}

impl<C: Cache> StatsCache<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn track<T>(&self, result: CacheResult<T>) -> CacheResult<T> {
        if result.is_err() {
            CacheStats::bump(&self.stats.errors);
        }
        result
    }

    fn track_condition(&self, result: CacheResult<bool>) -> CacheResult<bool> {
        if let Ok(false) = result {
            CacheStats::bump(&self.stats.conditions_not_met);
        }
        self.track(result)
    }

    fn track_query<T>(&self, result: CacheResult<T>) -> CacheResult<T> {
        CacheStats::bump(&self.stats.queries);
        if let Err(CacheError::QueryPartial { .. }) = result {
            CacheStats::bump(&self.stats.partial_queries);
        }
        self.track(result)
    }
}

#[async_trait]
impl<C: Cache> Cache for StatsCache<C> {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let result = self.inner.get(key).await;
        match &result {
            Ok(Some(_)) => CacheStats::bump(&self.stats.hits),
            Ok(None) => CacheStats::bump(&self.stats.misses),
            Err(_) => {}
        }
        self.track(result)
    }

    async fn put(&self, key: &str, value: String, options: WriteOptions) -> CacheResult<Option<String>> {
        CacheStats::bump(&self.stats.writes);
        self.track(self.inner.put(key, value, options).await)
    }

    async fn put_if_absent(&self, key: &str, value: String, options: WriteOptions) -> CacheResult<Option<String>> {
        CacheStats::bump(&self.stats.writes);
        let result = self.inner.put_if_absent(key, value, options).await;
        if let Ok(Some(_)) = result {
            CacheStats::bump(&self.stats.conditions_not_met);
        }
        self.track(result)
    }

    async fn replace(&self, key: &str, value: String, options: WriteOptions) -> CacheResult<Option<String>> {
        CacheStats::bump(&self.stats.writes);
        let result = self.inner.replace(key, value, options).await;
        if let Ok(None) = result {
            CacheStats::bump(&self.stats.conditions_not_met);
        }
        self.track(result)
    }

    async fn replace_if(&self, key: &str, expected: &str, value: String, options: WriteOptions) -> CacheResult<bool> {
        CacheStats::bump(&self.stats.writes);
        self.track_condition(self.inner.replace_if(key, expected, value, options).await)
    }

    async fn remove(&self, key: &str, options: WriteOptions) -> CacheResult<Option<String>> {
        CacheStats::bump(&self.stats.removals);
        self.track(self.inner.remove(key, options).await)
    }

    async fn remove_if(&self, key: &str, expected: &str, options: WriteOptions) -> CacheResult<bool> {
        CacheStats::bump(&self.stats.removals);
        self.track_condition(self.inner.remove_if(key, expected, options).await)
    }

    async fn run_query(&self, descriptor: QueryDescriptor) -> QueryResult {
        CacheStats::bump(&self.stats.queries);
        let result = self.inner.run_query(descriptor).await;
        if !result.is_complete() {
            CacheStats::bump(&self.stats.partial_queries);
        }
        result
    }

    fn current_topology(&self) -> Arc<ClusterView> {
        self.inner.current_topology()
    }

    async fn evict(&self, key: &str) -> CacheResult<bool> {
        let result = self.inner.evict(key).await;
        if let Ok(true) = result {
            CacheStats::bump(&self.stats.evictions);
        }
        self.track(result)
    }

    async fn put_all(&self, entries: BTreeMap<String, String>, options: WriteOptions) -> CacheResult<()> {
        CacheStats::add(&self.stats.writes, entries.len() as u64);
        self.track(self.inner.put_all(entries, options).await)
    }

    async fn contains_key(&self, key: &str) -> CacheResult<bool> {
        let result = self.inner.contains_key(key).await;
        match &result {
            Ok(true) => CacheStats::bump(&self.stats.hits),
            Ok(false) => CacheStats::bump(&self.stats.misses),
            Err(_) => {}
        }
        self.track(result)
    }

    async fn key_set(&self) -> CacheResult<BTreeSet<String>> {
        self.track_query(self.inner.key_set().await)
    }

    async fn size(&self) -> CacheResult<usize> {
        self.track_query(self.inner.size().await)
    }

    async fn is_empty(&self) -> CacheResult<bool> {
        self.track_query(self.inner.is_empty().await)
    }

    async fn clear(&self, options: WriteOptions) -> CacheResult<usize> {
        let result = self.inner.clear(options).await;
        if let Ok(removed) = result {
            CacheStats::add(&self.stats.removals, removed as u64);
        }
        self.track(result)
    }
}

#[async_trait]
impl<C: Cache + ?Sized> Cache for Arc<C> {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: String, options: WriteOptions) -> CacheResult<Option<String>> {
        (**self).put(key, value, options).await
    }

    async fn put_if_absent(&self, key: &str, value: String, options: WriteOptions) -> CacheResult<Option<String>> {
        (**self).put_if_absent(key, value, options).await
    }

    async fn replace(&self, key: &str, value: String, options: WriteOptions) -> CacheResult<Option<String>> {
        (**self).replace(key, value, options).await
    }

    async fn replace_if(&self, key: &str, expected: &str, value: String, options: WriteOptions) -> CacheResult<bool> {
        (**self).replace_if(key, expected, value, options).await
    }

    async fn remove(&self, key: &str, options: WriteOptions) -> CacheResult<Option<String>> {
        (**self).remove(key, options).await
    }

    async fn remove_if(&self, key: &str, expected: &str, options: WriteOptions) -> CacheResult<bool> {
        (**self).remove_if(key, expected, options).await
    }

    async fn run_query(&self, descriptor: QueryDescriptor) -> QueryResult {
        (**self).run_query(descriptor).await
    }

    fn current_topology(&self) -> Arc<ClusterView> {
        (**self).current_topology()
    }

    async fn evict(&self, key: &str) -> CacheResult<bool> {
        (**self).evict(key).await
    }

    async fn put_all(&self, entries: BTreeMap<String, String>, options: WriteOptions) -> CacheResult<()> {
        (**self).put_all(entries, options).await
    }

    async fn contains_key(&self, key: &str) -> CacheResult<bool> {
        (**self).contains_key(key).await
    }

    async fn key_set(&self) -> CacheResult<BTreeSet<String>> {
        (**self).key_set().await
    }

    async fn size(&self) -> CacheResult<usize> {
        (**self).size().await
    }

    async fn is_empty(&self) -> CacheResult<bool> {
        (**self).is_empty().await
    }

    async fn clear(&self, options: WriteOptions) -> CacheResult<usize> {
        (**self).clear(options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::query::{Predicate, QueryStatus};
    use crate::topology::{NodeDescriptor, NodeId, TopologyInfo};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Single-process cache without replication
    #[derive(Default)]
    struct MapCache {
        data: Mutex<HashMap<String, String>>,
        fail_writes: bool,
    }

    impl MapCache {
        fn write(&self) -> CacheResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
            if self.fail_writes {
                return Err(CacheError::NotMember(NodeId::from("x")));
            }
            Ok(self.data.lock().unwrap())
        }
    }

    #[async_trait]
    impl Cache for MapCache {
        async fn get(&self, key: &str) -> CacheResult<Option<String>> {
            Ok(self.data.lock().unwrap().get(key).cloned())
        }

        async fn put(&self, key: &str, value: String, _: WriteOptions) -> CacheResult<Option<String>> {
            Ok(self.write()?.insert(key.to_string(), value))
        }

        async fn put_if_absent(&self, key: &str, value: String, _: WriteOptions) -> CacheResult<Option<String>> {
            let mut data = self.write()?;
            match data.get(key) {
                Some(existing) => Ok(Some(existing.clone())),
                None => {
                    data.insert(key.to_string(), value);
                    Ok(None)
                }
            }
        }

        async fn replace(&self, key: &str, value: String, _: WriteOptions) -> CacheResult<Option<String>> {
            let mut data = self.write()?;
            match data.get_mut(key) {
                Some(existing) => Ok(Some(std::mem::replace(existing, value))),
                None => Ok(None),
            }
        }

        async fn replace_if(&self, key: &str, expected: &str, value: String, _: WriteOptions) -> CacheResult<bool> {
            let mut data = self.write()?;
            if data.get(key).map(String::as_str) == Some(expected) {
                data.insert(key.to_string(), value);
                Ok(true)
            } else {
                Ok(false)
            }
        }

        async fn remove(&self, key: &str, _: WriteOptions) -> CacheResult<Option<String>> {
            Ok(self.write()?.remove(key))
        }

        async fn remove_if(&self, key: &str, expected: &str, _: WriteOptions) -> CacheResult<bool> {
            let mut data = self.write()?;
            if data.get(key).map(String::as_str) == Some(expected) {
                data.remove(key);
                Ok(true)
            } else {
                Ok(false)
            }
        }

        async fn run_query(&self, _: QueryDescriptor) -> QueryResult {
            QueryResult {
                entries: Vec::new(),
                status: QueryStatus::Partial,
                node_results: Vec::new(),
                failed: vec![NodeId::from("x")],
                skipped: Vec::new(),
                view_id: 1,
            }
        }

        fn current_topology(&self) -> Arc<ClusterView> {
            Arc::new(ClusterView::new(1, vec![NodeDescriptor::new("x", TopologyInfo::new(), "local")]))
        }

        async fn evict(&self, key: &str) -> CacheResult<bool> {
            Ok(self.data.lock().unwrap().remove(key).is_some())
        }
    }

    #[tokio::test]
    async fn test_stats_count_through_decorator() {
        let cache = StatsCache::new(MapCache::default());
        let opts = WriteOptions::default();

        assert_eq!(cache.get("k").await.unwrap(), None);
        cache.put("k", "v1".into(), opts).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(cache.put_if_absent("k", "v2".into(), opts).await.unwrap().as_deref(), Some("v1"));
        assert!(cache.remove_if("k", "v1", opts).await.unwrap());
        assert!(!cache.remove_if("k", "v1", opts).await.unwrap());
        assert!(!cache.run_query(QueryDescriptor::new(Predicate::All)).await.is_complete());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.removals, 2);
        assert_eq!(stats.conditions_not_met, 2);
        assert_eq!(stats.partial_queries, 1);
        assert_eq!(stats.hit_ratio(), 0.5);
        assert!(stats.to_string().contains("Queries: 1 (1 partial)"));
    }

    #[tokio::test]
    async fn test_errors_counted_and_passed_through() {
        let cache = StatsCache::new(MapCache {
            fail_writes: true,
            ..MapCache::default()
        });
        let err = cache.put("k", "v".into(), WriteOptions::sync()).await.unwrap_err();
        assert!(matches!(err, CacheError::NotMember(_)));
        assert_eq!(cache.stats().errors, 1);
        assert_eq!(cache.current_topology().len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_operations_through_decorator() {
        let cache = StatsCache::new(MapCache::default());
        let entries: BTreeMap<String, String> =
            [("a", "1"), ("b", "2")].iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();

        cache.put_all(entries, WriteOptions::default()).await.unwrap();
        assert!(cache.contains_key("a").await.unwrap());
        assert!(!cache.contains_key("z").await.unwrap());
        assert!(cache.evict("a").await.unwrap());
        assert!(!cache.evict("a").await.unwrap());

        // This cache never answers a query completely
        assert!(matches!(cache.size().await, Err(CacheError::QueryPartial { .. })));

        let stats = cache.stats();
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.queries, 1);
        assert_eq!(stats.partial_queries, 1);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_write_options_builders() {
        let opts = WriteOptions::asynchronous().with_expiry(Duration::from_secs(5));
        assert_eq!(opts.mode, Some(ReplicationMode::Async));
        assert_eq!(opts.expiry, Some(Duration::from_secs(5)));
        assert_eq!(WriteOptions::default().mode, None);
    }
}
