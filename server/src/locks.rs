//! Keyed async locks: per-job and per-spool transition serialization.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

/// A map of independent async mutexes keyed by entity id. Guards are
/// held across the DB write of a transition so concurrent observers of
/// the same entity serialize.
#[derive(Default)]
pub struct LockMap {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl LockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: i64) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn same_key_serializes_different_keys_do_not() {
        let locks = Arc::new(LockMap::new());
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let locks = Arc::clone(&locks);
            let peak = Arc::clone(&peak);
            let active = Arc::clone(&active);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(7).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                i
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        // Distinct keys do not contend.
        let a = locks.acquire(1).await;
        let b = locks.acquire(2).await;
        drop(a);
        drop(b);
    }
}
