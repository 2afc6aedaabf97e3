//! Per-host mutual exclusion around reserve/bind/release sequences.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// One async mutex per host, created on first use.
#[derive(Debug, Clone, Default)]
pub struct HostLocks {
    locks: Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>,
}

impl HostLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the host's exclusive section until the guard drops.
    pub async fn lock(&self, host_id: &str) -> OwnedMutexGuard<()> {
        let existing = self.locks.read().await.get(host_id).cloned();
        let mutex = match existing {
            Some(mutex) => mutex,
            None => {
                let mut locks = self.locks.write().await;
                locks.entry(host_id.to_string()).or_default().clone()
            }
        };
        mutex.lock_owned().await
    }

    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }
}
