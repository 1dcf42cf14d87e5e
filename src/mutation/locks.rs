//! Per-entity mutation locks

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::cache::EntityRef;

/// One async lock per entity slot.
///
/// Mutations on the same slot queue behind each other; different slots never
/// contend. Entries nobody holds are pruned after each mutation.
#[derive(Default)]
pub struct EntityLocks {
    locks: DashMap<EntityRef, Arc<Mutex<()>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, slot: &EntityRef) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(slot.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop locks with no holder and no waiter
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
