//! Row locks for the in-memory store

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::record::RecordId;

pub(crate) type RowKey = (String, RecordId);

/// Lock strength requested for a set of rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Strength {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct RowLock {
    exclusive: Option<Uuid>,
    shared: HashSet<Uuid>,
}

impl RowLock {
    fn admits(&self, owner: Uuid, strength: Strength) -> bool {
        let foreign_exclusive = self.exclusive.is_some_and(|holder| holder != owner);
        match strength {
            Strength::Shared => !foreign_exclusive,
            Strength::Exclusive => {
                !foreign_exclusive && self.shared.iter().all(|holder| *holder == owner)
            }
        }
    }

    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

/// Shared and exclusive row locks owned by sessions
///
/// Locks are held until the owning session releases them.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    rows: Mutex<HashMap<RowKey, RowLock>>,
    released: Notify,
}

impl LockTable {
    /// Take every lock in `keys` or none of them
    fn try_acquire(&self, owner: Uuid, keys: &[RowKey], strength: Strength) -> bool {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let admitted = keys.iter().all(|key| {
            rows.get(key)
                .map_or(true, |lock| lock.admits(owner, strength))
        });
        if !admitted {
            return false;
        }
        for key in keys {
            let lock = rows.entry(key.clone()).or_default();
            match strength {
                Strength::Shared => {
                    lock.shared.insert(owner);
                }
                Strength::Exclusive => lock.exclusive = Some(owner),
            }
        }
        true
    }

    /// Wait up to `timeout` for the locks; `false` when the wait ran out
    pub async fn acquire(
        &self,
        owner: Uuid,
        keys: &[RowKey],
        strength: Strength,
        timeout: Duration,
    ) -> bool {
        let wait = async {
            loop {
                let released = self.released.notified();
                tokio::pin!(released);
                released.as_mut().enable();
                if self.try_acquire(owner, keys, strength) {
                    return;
                }
                released.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Drop every lock held by `owner` and wake waiters
    pub fn release_all(&self, owner: Uuid) {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|_, lock| {
            if lock.exclusive == Some(owner) {
                lock.exclusive = None;
            }
            lock.shared.remove(&owner);
            !lock.is_free()
        });
        let freed = before - rows.len();
        drop(rows);
        if freed > 0 {
            tracing::trace!(%owner, freed, "released row locks");
        }
        self.released.notify_waiters();
    }
}
