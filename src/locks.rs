use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One mutex per `(service, action)` key, created on first use and kept for
/// the life of the table. Repeated calls to the same key are serialised;
/// different keys never contend.
#[derive(Debug, Default)]
pub struct MethodLockTable {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held for the duration of one call; dropping it releases the method.
#[derive(Debug)]
pub struct MethodGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl MethodGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl MethodLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rpc_key(service: &str, method: &str) -> String {
        format!("{service}::RPC/{method}")
    }

    pub fn message_key(service: &str, message: &str) -> String {
        format!("{service}::Message/{message}")
    }

    pub fn transfer_key(service: &str, direction: &str) -> String {
        format!("{service}::FileTransfer/{direction}")
    }

    fn mutex_for(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.get(key) {
            return existing.value().clone();
        }
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    pub async fn acquire(&self, key: String) -> MethodGuard {
        let mutex = self.mutex_for(&key);
        let guard = mutex.lock_owned().await;
        MethodGuard { key, _guard: guard }
    }

    /// Number of distinct keys seen so far.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
