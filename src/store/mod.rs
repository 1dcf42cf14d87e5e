//! Durable local store
//!
//! Per-collection persistence that survives restarts and offline periods.
//! Every collection key holds an ordered sequence of plain records, replaced
//! as a whole on each save. A key that was never saved loads as `None`, which
//! is distinct from a saved empty sequence.
//!
//! Failures here never block the in-memory cache: writes that fail are logged
//! and the cache stays authoritative for the session; reads that fail at
//! startup are treated as "nothing stored" so the collection is refetched.

mod memory;
mod sqlite;
mod writer;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use writer::CollectionWriter;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::CacheValue;
use crate::error::Result;
use crate::model::{Collection, Scope};

/// Marker holding the last daily period a reset ran for
pub const LAST_DAILY_RESET_KEY: &str = "lastDailyResetKey";
/// Marker holding the last ISO week a reset ran for
pub const LAST_WEEKLY_RESET_KEY: &str = "lastWeeklyResetKey";

/// Key of one persisted collection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub collection: Collection,
    pub scope: Scope,
}

impl StoreKey {
    pub fn new(collection: Collection, scope: Scope) -> Self {
        Self { collection, scope }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collection, self.scope)
    }
}

/// Key/value persistence for collections and scalar markers.
///
/// `save` must be atomic from the caller's point of view: after a failed save
/// the previous contents are still there.
pub trait LocalStore: Send + Sync {
    /// Replace the contents stored under `key`
    fn save(&self, key: &StoreKey, records: &[serde_json::Value]) -> Result<()>;

    /// Load the records stored under `key`, or `None` if never saved
    fn load(&self, key: &StoreKey) -> Result<Option<Vec<serde_json::Value>>>;

    /// Wipe every collection and marker
    fn clear_all(&self) -> Result<()>;

    fn save_marker(&self, name: &str, value: &str) -> Result<()>;

    fn load_marker(&self, name: &str) -> Result<Option<String>>;
}

/// Marker name for a scope, e.g. `lastDailyResetKey:user-1`
pub fn marker_name(base: &str, scope: &Scope) -> String {
    format!("{}:{}", base, scope)
}

/// Load and decode a collection. Read failures are treated as absent.
pub fn load_value(store: &dyn LocalStore, key: &StoreKey) -> Option<CacheValue> {
    match store.load(key) {
        Ok(Some(records)) => Some(CacheValue::from_records(
            key.collection,
            &key.scope,
            records,
        )),
        Ok(None) => None,
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to read collection, treating as absent");
            None
        }
    }
}

/// Encode and save a collection on the blocking pool.
///
/// Returns whether the write succeeded. Failures are logged and swallowed.
pub async fn persist_value(store: Arc<dyn LocalStore>, key: StoreKey, value: CacheValue) -> bool {
    let records = match value.to_records() {
        Ok(records) => records,
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to encode collection for persistence");
            return false;
        }
    };

    let log_key = key.clone();
    let result = tokio::task::spawn_blocking(move || store.save(&key, &records)).await;

    match result {
        Ok(Ok(())) => {
            debug!(key = %log_key, "Persisted collection");
            true
        }
        Ok(Err(e)) => {
            warn!(key = %log_key, error = %e, "Local store write failed, durability degraded");
            false
        }
        Err(e) => {
            warn!(key = %log_key, error = %e, "Local store write task failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, Task};

    #[test]
    fn test_store_key_display() {
        let key = StoreKey::new(Collection::Rewards, "user-1".into());
        assert_eq!(key.to_string(), "rewards:user-1");
        assert_eq!(
            marker_name(LAST_WEEKLY_RESET_KEY, &"user-1".into()),
            "lastWeeklyResetKey:user-1"
        );
    }

    #[test]
    fn test_load_value_treats_read_failure_as_absent() {
        let store = MemoryStore::new();
        let key = StoreKey::new(Collection::Tasks, "u1".into());
        store.save(&key, &[serde_json::json!({ "id": "t1" })]).unwrap();

        store.fail_reads(true);
        assert!(load_value(&store, &key).is_none());

        store.fail_reads(false);
        assert_eq!(load_value(&store, &key).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persist_value_swallows_write_failure() {
        let store = Arc::new(MemoryStore::new());
        let key = StoreKey::new(Collection::Tasks, "u1".into());
        let value = CacheValue::Entities(vec![Entity::Task(Task {
            id: "t1".into(),
            ..Default::default()
        })]);

        store.fail_writes(true);
        assert!(!persist_value(store.clone(), key.clone(), value.clone()).await);
        assert!(store.load(&key).unwrap().is_none());

        store.fail_writes(false);
        assert!(persist_value(store.clone(), key.clone(), value).await);
        assert_eq!(store.load(&key).unwrap().unwrap().len(), 1);
    }
}
