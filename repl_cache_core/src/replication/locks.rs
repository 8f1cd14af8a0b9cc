//! Per-key write serialization on the primary

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockTable = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Keyed lock table. Writes to the same key queue behind each other while
/// different keys never share a lock. An entry lives only as long as some
/// writer holds or waits for it.
#[derive(Debug, Default)]
pub struct KeyLocks {
    table: LockTable,
}

/// Held while a write to one key is decided and replicated
pub struct KeyGuard<'a> {
    key: String,
    table: &'a LockTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let entry = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(table.entry(key.to_string()).or_default())
        };
        let guard = entry.lock_owned().await;
        KeyGuard {
            key: key.to_string(),
            table: &self.table,
            guard: Some(guard),
        }
    }

    /// Keys currently locked or waited on
    pub fn active(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release first so the count below only sees the table and waiters
        self.guard.take();
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = table.get(&self.key) {
            if Arc::strong_count(entry) == 1 {
                table.remove(&self.key);
            }
        }
    }
}
