use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use cirrus_store::EntityKey;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-entity mutual exclusion across workers.
///
/// Entries live only while some worker holds or waits for them.
#[derive(Default)]
pub(crate) struct EntityLocks {
    entries: StdMutex<HashMap<EntityKey, Arc<Mutex<()>>>>,
}

pub(crate) struct EntityGuard<'a> {
    locks: &'a EntityLocks,
    key: EntityKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl EntityLocks {
    pub(crate) async fn lock(&self, key: EntityKey) -> EntityGuard<'_> {
        let mutex = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.entry(key.clone()).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        EntityGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        let mut entries = self.locks.entries.lock().unwrap_or_else(|e| e.into_inner());
        // Release before checking so waiters still hold their own reference.
        self.guard.take();
        if let Some(mutex) = entries.get(&self.key) {
            if Arc::strong_count(mutex) == 1 {
                entries.remove(&self.key);
            }
        }
    }
}
