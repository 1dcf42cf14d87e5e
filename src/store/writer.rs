//! Ordered collection writes

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::{persist_value, LocalStore, StoreKey};
use crate::cache::{QueryCache, QueryKey};

/// Persists the confirmed part of cache keys, one save at a time per key.
///
/// The snapshot is taken after the key's lock is acquired, so a later save
/// always carries a view at least as new as any earlier one. Saves to
/// different keys run in parallel.
pub struct CollectionWriter {
    cache: Arc<QueryCache>,
    store: Arc<dyn LocalStore>,
    locks: DashMap<StoreKey, Arc<Mutex<()>>>,
}

impl CollectionWriter {
    pub fn new(cache: Arc<QueryCache>, store: Arc<dyn LocalStore>) -> Self {
        Self {
            cache,
            store,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> Arc<dyn LocalStore> {
        self.store.clone()
    }

    /// Save the confirmed view of `key`. Returns whether anything was written.
    pub async fn persist(&self, key: &QueryKey) -> bool {
        let store_key = key.store_key();
        let lock = self
            .locks
            .entry(store_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let written = {
            let _turn = lock.lock().await;
            match self.cache.confirmed_view(key) {
                Some(value) => persist_value(self.store.clone(), store_key, value).await,
                None => {
                    debug!(key = %key, "Nothing confirmed to persist");
                    false
                }
            }
        };

        drop(lock);
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        written
    }

    /// Keys with a save in progress or queued
    pub fn pending(&self) -> usize {
        self.locks.len()
    }
}
