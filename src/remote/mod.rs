//! Remote backend
//!
//! The hosted relational backend is the source of truth. The engine talks to
//! it through [`RemoteBackend`]; [`HttpBackend`] speaks the PostgREST dialect
//! over HTTP and [`InMemoryBackend`] stands in for it in tests and demos.

mod http;
mod memory;

pub use http::HttpBackend;
pub use memory::InMemoryBackend;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheValue, QueryFetcher, QueryKey};
use crate::error::Result;
use crate::model::{Collection, Entity, EntityId, HistoryEntry, LedgerDelta, PointsLedger, Scope};

/// Row-level access to the hosted backend
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// All rows of an entity collection for a scope, in server order
    async fn fetch_collection(&self, collection: Collection, scope: &Scope) -> Result<Vec<Entity>>;

    /// One row, or `None` if the server no longer has it
    async fn fetch_entity(
        &self,
        collection: Collection,
        scope: &Scope,
        id: &EntityId,
    ) -> Result<Option<Entity>>;

    async fn fetch_ledger(&self, scope: &Scope) -> Result<PointsLedger>;

    async fn fetch_history(&self, scope: &Scope) -> Result<Vec<HistoryEntry>>;

    /// Insert a row. The server assigns the id and returns the stored row.
    async fn insert(&self, entity: &Entity) -> Result<Entity>;

    /// Replace a row by id and return the stored row
    async fn update(&self, entity: &Entity) -> Result<Entity>;

    async fn delete(&self, collection: Collection, scope: &Scope, id: &EntityId) -> Result<()>;

    /// Write several rows of one collection in a single request
    async fn batch_update(&self, entities: &[Entity]) -> Result<()>;

    /// Apply a signed delta to the scope's ledger and return the new balance
    async fn apply_ledger_delta(&self, scope: &Scope, delta: LedgerDelta) -> Result<PointsLedger>;

    async fn insert_history(&self, entry: &HistoryEntry) -> Result<HistoryEntry>;
}

/// Kind of out-of-band change delivered by the push transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// Notification that a row changed on the server.
///
/// `record` carries the new row when the transport includes it; without it
/// the row is fetched before being applied. Delivery is at-least-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub collection: Collection,
    pub scope: Scope,
    pub entity_id: EntityId,
    pub change_type: ChangeType,
    #[serde(default)]
    pub record: Option<serde_json::Value>,
}

impl RemoteChange {
    pub fn key(&self) -> QueryKey {
        QueryKey::new(self.collection, self.scope.clone())
    }
}

/// Fetch the full server value for a cache key
pub async fn fetch_value(backend: &dyn RemoteBackend, key: &QueryKey) -> Result<CacheValue> {
    let value = match key.collection {
        Collection::Points => CacheValue::Ledger(backend.fetch_ledger(&key.scope).await?),
        Collection::History => CacheValue::History(backend.fetch_history(&key.scope).await?),
        collection => CacheValue::Entities(backend.fetch_collection(collection, &key.scope).await?),
    };
    Ok(value)
}

/// [`QueryFetcher`] that refetches cache keys from a backend
pub struct BackendFetcher {
    backend: Arc<dyn RemoteBackend>,
}

impl BackendFetcher {
    pub fn new(backend: Arc<dyn RemoteBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl QueryFetcher for BackendFetcher {
    async fn fetch(&self, key: &QueryKey) -> Result<CacheValue> {
        fetch_value(self.backend.as_ref(), key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_decodes_from_push_payload() {
        let payload = serde_json::json!({
            "collection": "rewards",
            "scope": "u1",
            "entity_id": "r1",
            "change_type": "UPDATE",
            "record": { "id": "r1", "supply": 3 }
        });
        let change: RemoteChange = serde_json::from_value(payload).unwrap();
        assert_eq!(change.change_type, ChangeType::Update);
        assert_eq!(change.key(), QueryKey::new(Collection::Rewards, "u1".into()));
        assert!(change.record.is_some());
    }
}
