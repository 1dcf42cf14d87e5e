//! History log of ledger-affecting events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{EntityId, Scope};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    #[default]
    TaskCompleted,
    RewardRedeemed,
    PunishmentApplied,
}

/// One settled ledger event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryEntry {
    pub id: EntityId,
    pub owner_scope: Scope,
    pub kind: HistoryKind,
    /// Server id of the entity that caused the event
    pub entity_id: EntityId,
    pub title: String,
    pub points_delta: i64,
    pub occurred_at: DateTime<Utc>,
}
