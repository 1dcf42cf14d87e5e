//! Identifiers: entity ids (server or optimistic) and owner scopes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix that marks a locally generated, not yet confirmed id
pub const OPTIMISTIC_PREFIX: &str = "opt-";

/// Stable entity identifier.
///
/// Either a server-issued id or an optimistic id (`opt-<uuid>`) minted before
/// the server confirmed the row. Optimistic ids are random v4 UUIDs, so an id
/// retired by a rollback or a confirm is never handed out again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh optimistic id
    pub fn optimistic() -> Self {
        Self(format!("{}{}", OPTIMISTIC_PREFIX, uuid::Uuid::new_v4()))
    }

    pub fn is_optimistic(&self) -> bool {
        self.0.starts_with(OPTIMISTIC_PREFIX)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The user/household an entity belongs to. Opaque to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Scope {
    fn from(scope: &str) -> Self {
        Self(scope.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimistic_ids_are_tagged_and_unique() {
        let a = EntityId::optimistic();
        let b = EntityId::optimistic();
        assert!(a.is_optimistic());
        assert!(a.as_str().starts_with("opt-"));
        assert_ne!(a, b);
        assert!(!EntityId::new("srv-9").is_optimistic());
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&EntityId::new("srv-9")).unwrap();
        assert_eq!(json, "\"srv-9\"");
        let scope: Scope = serde_json::from_str("\"user-1\"").unwrap();
        assert_eq!(scope.as_str(), "user-1");
    }
}
