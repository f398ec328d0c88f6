//! Per-deployment mutual exclusion

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of async locks keyed by deployment name
///
/// At most one guard per name is held at a time. Entries nobody holds or
/// waits on are pruned whenever a new guard is requested.
#[derive(Default)]
pub struct NameLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NameLocks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `name`
    pub async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Only the map references an idle entry
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(name.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of names currently tracked
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Whether no names are tracked
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_same_name_is_exclusive() {
        let locks = Arc::new(NameLocks::new());
        let guard = locks.acquire("web").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("web").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_different_names_do_not_block() {
        let locks = NameLocks::new();
        let _web = locks.acquire("web").await;
        let api = timeout(Duration::from_secs(1), locks.acquire("api")).await;
        assert!(api.is_ok());
    }

    #[tokio::test]
    async fn test_idle_entries_pruned() {
        let locks = NameLocks::new();
        drop(locks.acquire("web").await);
        drop(locks.acquire("api").await);

        // Acquiring prunes every idle entry except the one being handed out
        let _db = locks.acquire("db").await;
        assert_eq!(locks.len().await, 1);
    }
}
