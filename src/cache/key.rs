//! Structured cache keys

use std::fmt;

use crate::model::{Collection, EntityId, Scope};
use crate::store::StoreKey;

/// Cache key: a collection within a scope.
///
/// Always a tuple, never a formatted string, so two scopes can never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    pub collection: Collection,
    pub scope: Scope,
}

impl QueryKey {
    pub fn new(collection: Collection, scope: Scope) -> Self {
        Self { collection, scope }
    }

    /// Reference to one entity under this key
    pub fn entity(&self, id: EntityId) -> EntityRef {
        EntityRef {
            key: self.clone(),
            id,
        }
    }

    pub fn store_key(&self) -> StoreKey {
        StoreKey::new(self.collection, self.scope.clone())
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.collection, self.scope)
    }
}

/// One entity slot: the key it lives under plus its id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub key: QueryKey,
    pub id: EntityId,
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.key, self.id)
    }
}
