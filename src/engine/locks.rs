use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum LockKey {
    Resource(Ulid),
    User(Ulid),
}

/// Per-key async mutexes guarding check-then-write sequences. An entry lives
/// only while someone holds or waits on it.
#[derive(Default)]
pub(crate) struct LockTable {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

/// Held lock on one key; releasing the last handle removes the entry.
pub(crate) struct KeyGuard<'a> {
    table: &'a LockTable,
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Clones are only taken under the shard lock, so a count of one
        // means no holder and no waiter.
        self.table
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl LockTable {
    /// Lock every key, in sorted order to prevent deadlocks.
    pub(crate) async fn acquire(&self, mut keys: Vec<LockKey>) -> Vec<KeyGuard<'_>> {
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let lock = self.locks.entry(key).or_default().value().clone();
            guards.push(KeyGuard {
                table: self,
                key,
                guard: Some(lock.lock_owned().await),
            });
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes() {
        let table = Arc::new(LockTable::default());
        let key = LockKey::Resource(Ulid::new());
        let held = table.acquire(vec![key]).await;

        let t2 = table.clone();
        let waiter = tokio::spawn(async move {
            let _g = t2.acquire(vec![key]).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn opposite_orders_do_not_deadlock() {
        let table = Arc::new(LockTable::default());
        let a = LockKey::User(Ulid::new());
        let b = LockKey::Resource(Ulid::new());

        let mut tasks = Vec::new();
        for i in 0..50 {
            let t = table.clone();
            let keys = if i % 2 == 0 { vec![a, b] } else { vec![b, a] };
            tasks.push(tokio::spawn(async move {
                let _g = t.acquire(keys).await;
                tokio::task::yield_now().await;
            }));
        }
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("deadlock")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn duplicate_keys_lock_once() {
        let table = LockTable::default();
        let key = LockKey::User(Ulid::new());
        let guards = table.acquire(vec![key, key]).await;
        assert_eq!(guards.len(), 1);
    }

    #[tokio::test]
    async fn released_keys_are_pruned() {
        let table = Arc::new(LockTable::default());
        let user = LockKey::User(Ulid::new());
        let resource = LockKey::Resource(Ulid::new());

        let held = table.acquire(vec![user, resource]).await;
        assert_eq!(table.locks.len(), 2);

        let t2 = table.clone();
        let waiter = tokio::spawn(async move {
            let _g = t2.acquire(vec![resource]).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        waiter.await.unwrap();

        assert!(table.locks.is_empty());
    }
}
