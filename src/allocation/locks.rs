//! Per-group mutual exclusion

use crate::types::GroupId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per group, created on first use and dropped again once
/// nobody holds or waits on it.
///
/// Operations on the same group queue behind each other for their whole
/// read-modify-write cycle; different groups never contend.
#[derive(Default)]
pub struct GroupLocks {
    locks: DashMap<GroupId, Arc<Mutex<()>>>,
}

/// Exclusive access to one group until dropped
pub struct GroupGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a GroupLocks,
    group: GroupId,
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        // Release first so our own guard no longer counts as a holder
        self.guard.take();
        self.locks.forget(self.group);
    }
}

impl GroupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, group: GroupId) -> GroupGuard<'_> {
        // Clone the Arc out so the map shard is not held across the await
        let lock = self.locks.entry(group).or_default().clone();
        GroupGuard {
            guard: Some(lock.lock_owned().await),
            locks: self,
            group,
        }
    }

    /// Remove the group's mutex if the map holds the only reference.
    ///
    /// A task that cloned the mutex out of the map keeps it alive, and one
    /// that arrives after removal creates a fresh entry, so exclusion holds.
    pub fn forget(&self, group: GroupId) {
        self.locks
            .remove_if(&group, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of groups currently locked or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_group_is_exclusive() {
        let locks = Arc::new(GroupLocks::new());
        let guard = locks.acquire(GroupId(1)).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(GroupId(1)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_groups_are_independent() {
        let locks = GroupLocks::new();
        let _one = locks.acquire(GroupId(1)).await;

        let two = tokio::time::timeout(Duration::from_millis(100), locks.acquire(GroupId(2)))
            .await
            .expect("other group must not block");
        assert_eq!(locks.len(), 2);

        drop(two);
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_released_groups_do_not_accumulate() {
        let locks = GroupLocks::new();
        for group in 0..1000 {
            let _guard = locks.acquire(GroupId(group)).await;
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_forget_keeps_contended_lock() {
        let locks = Arc::new(GroupLocks::new());
        let guard = locks.acquire(GroupId(3)).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(GroupId(3)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Holder and waiter both reference the mutex
        locks.forget(GroupId(3));
        assert_eq!(locks.len(), 1);

        drop(guard);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
