//! Per-sandbox serialization of host-affecting transitions.

use enclave_rs_protocol::SandboxId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Async locks keyed by sandbox id. Clones share the same table.
///
/// Approve, reject, stop and collection hold a sandbox's lock for their
/// whole run, so a reject can never commit while an approve is writing the
/// host tree. Different sandboxes never contend.
#[derive(Debug, Clone, Default)]
pub struct SandboxLocks {
    table: Arc<Mutex<HashMap<SandboxId, Arc<AsyncMutex<()>>>>>,
}

impl SandboxLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: SandboxId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock();
            // Entries nobody holds or waits on only pin memory.
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
            table.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of sandboxes currently locked or awaited.
    pub fn in_use(&self) -> usize {
        self.table
            .lock()
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::SandboxLocks;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn same_id_waits_for_release() {
        let locks = SandboxLocks::new();
        let id = Uuid::new_v4();
        let guard = locks.acquire(id).await;
        let waiting = tokio::time::timeout(Duration::from_millis(20), locks.acquire(id)).await;
        assert!(waiting.is_err());
        drop(guard);
        let _again = tokio::time::timeout(Duration::from_millis(200), locks.acquire(id))
            .await
            .expect("lock released");
    }

    #[tokio::test]
    async fn different_ids_do_not_contend() {
        let locks = SandboxLocks::new();
        let _first = locks.acquire(Uuid::new_v4()).await;
        let _second = tokio::time::timeout(
            Duration::from_millis(200),
            locks.acquire(Uuid::new_v4()),
        )
        .await
        .expect("independent lock");
        assert_eq!(locks.in_use(), 2);
    }

    #[tokio::test]
    async fn released_entries_are_pruned() {
        let locks = SandboxLocks::new();
        drop(locks.acquire(Uuid::new_v4()).await);
        let _held = locks.acquire(Uuid::new_v4()).await;
        assert_eq!(locks.table.lock().len(), 1);
    }
}
