use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::UserId;

/// Lazily created per-user async mutexes.
///
/// The map is sharded, so users never contend with each other. An entry is
/// dropped as soon as its last guard is released and nobody is waiting on it.
#[derive(Default)]
pub struct UserLocks {
    inner: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
}

pub struct UserLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    map: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
    user_id: UserId,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_user(&self, user_id: UserId) -> UserLockGuard {
        let lock = self
            .inner
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        UserLockGuard {
            guard: Some(guard),
            map: self.inner.clone(),
            user_id,
        }
    }

    /// Number of users with a live lock entry.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Drop for UserLockGuard {
    fn drop(&mut self) {
        // Release first so the only remaining strong refs are the map's and any waiters'.
        drop(self.guard.take());
        self.map
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn idle_entries_are_removed() {
        let locks = UserLocks::new();
        {
            let _g = locks.lock_user(UserId(1)).await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_user_is_serialized() {
        let locks = Arc::new(UserLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _g = locks.lock_user(UserId(5)).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_users_do_not_block() {
        let locks = UserLocks::new();
        let _a = locks.lock_user(UserId(1)).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock_user(UserId(2))).await;
        assert!(b.is_ok());
    }
}
