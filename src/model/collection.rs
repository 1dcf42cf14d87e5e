//! Entity collections known to the engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// A named collection. Used in cache keys, store keys and remote table names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Tasks,
    Rules,
    Rewards,
    Punishments,
    /// Append-only log of ledger-affecting events
    History,
    /// Singleton points ledger per scope
    Points,
}

impl Collection {
    /// Collections holding [`crate::model::Entity`] rows
    pub const ENTITIES: [Collection; 4] = [
        Collection::Tasks,
        Collection::Rules,
        Collection::Rewards,
        Collection::Punishments,
    ];

    pub const ALL: [Collection; 6] = [
        Collection::Tasks,
        Collection::Rules,
        Collection::Rewards,
        Collection::Punishments,
        Collection::History,
        Collection::Points,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Tasks => "tasks",
            Collection::Rules => "rules",
            Collection::Rewards => "rewards",
            Collection::Punishments => "punishments",
            Collection::History => "history",
            Collection::Points => "points",
        }
    }

    pub fn holds_entities(&self) -> bool {
        Self::ENTITIES.contains(self)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| SyncError::Config(format!("unknown collection: {}", s)))
    }
}
