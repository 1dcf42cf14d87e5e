//! Domain entities: tasks, rules, rewards and punishments
//!
//! Every struct is `#[serde(default)]` so that a record missing a field decodes
//! to the documented default instead of failing. Records are written without a
//! kind tag; the collection they live in decides how they decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::collection::Collection;
use super::counters::UsageCounters;
use super::id::{EntityId, Scope};
use crate::error::{Result, SyncError};

/// How often an entity's usage counters are reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    #[default]
    Weekly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// A recurring task. Completing it awards `points`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    pub id: EntityId,
    pub owner_scope: Scope,
    pub title: String,
    pub description: Option<String>,
    pub points: i64,
    pub priority: Priority,
    pub frequency: Frequency,
    pub completed: bool,
    pub usage_counters: UsageCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: EntityId::default(),
            owner_scope: Scope::default(),
            title: String::new(),
            description: None,
            points: 0,
            priority: Priority::Medium,
            frequency: Frequency::Daily,
            completed: false,
            usage_counters: UsageCounters::cleared(),
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }
}

/// A rule whose violations are tracked per weekday
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub id: EntityId,
    pub owner_scope: Scope,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub frequency: Frequency,
    pub usage_counters: UsageCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A reward bought with points. `supply` is the number of redemptions left.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reward {
    pub id: EntityId,
    pub owner_scope: Scope,
    pub title: String,
    pub description: Option<String>,
    pub cost: i64,
    pub supply: u32,
    pub frequency: Frequency,
    pub usage_counters: UsageCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A punishment. Applying it deducts `points`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Punishment {
    pub id: EntityId,
    pub owner_scope: Scope,
    pub title: String,
    pub description: Option<String>,
    pub points: i64,
    pub frequency: Frequency,
    pub usage_counters: UsageCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Closed set of entity kinds held in entity collections
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Task(Task),
    Rule(Rule),
    Reward(Reward),
    Punishment(Punishment),
}

impl Entity {
    pub fn collection(&self) -> Collection {
        match self {
            Entity::Task(_) => Collection::Tasks,
            Entity::Rule(_) => Collection::Rules,
            Entity::Reward(_) => Collection::Rewards,
            Entity::Punishment(_) => Collection::Punishments,
        }
    }

    pub fn id(&self) -> &EntityId {
        match self {
            Entity::Task(t) => &t.id,
            Entity::Rule(r) => &r.id,
            Entity::Reward(r) => &r.id,
            Entity::Punishment(p) => &p.id,
        }
    }

    pub fn set_id(&mut self, id: EntityId) {
        match self {
            Entity::Task(t) => t.id = id,
            Entity::Rule(r) => r.id = id,
            Entity::Reward(r) => r.id = id,
            Entity::Punishment(p) => p.id = id,
        }
    }

    pub fn owner_scope(&self) -> &Scope {
        match self {
            Entity::Task(t) => &t.owner_scope,
            Entity::Rule(r) => &r.owner_scope,
            Entity::Reward(r) => &r.owner_scope,
            Entity::Punishment(p) => &p.owner_scope,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Entity::Task(t) => &t.title,
            Entity::Rule(r) => &r.title,
            Entity::Reward(r) => &r.title,
            Entity::Punishment(p) => &p.title,
        }
    }

    pub fn frequency(&self) -> Frequency {
        match self {
            Entity::Task(t) => t.frequency,
            Entity::Rule(r) => r.frequency,
            Entity::Reward(r) => r.frequency,
            Entity::Punishment(p) => p.frequency,
        }
    }

    pub fn usage_counters(&self) -> &UsageCounters {
        match self {
            Entity::Task(t) => &t.usage_counters,
            Entity::Rule(r) => &r.usage_counters,
            Entity::Reward(r) => &r.usage_counters,
            Entity::Punishment(p) => &p.usage_counters,
        }
    }

    /// Replace the whole counter sequence
    pub fn set_usage_counters(&mut self, counters: UsageCounters) {
        match self {
            Entity::Task(t) => t.usage_counters = counters,
            Entity::Rule(r) => r.usage_counters = counters,
            Entity::Reward(r) => r.usage_counters = counters,
            Entity::Punishment(p) => p.usage_counters = counters,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Entity::Task(t) => t.created_at,
            Entity::Rule(r) => r.created_at,
            Entity::Reward(r) => r.created_at,
            Entity::Punishment(p) => p.created_at,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Entity::Task(t) => t.updated_at,
            Entity::Rule(r) => r.updated_at,
            Entity::Reward(r) => r.updated_at,
            Entity::Punishment(p) => p.updated_at,
        }
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        match self {
            Entity::Task(t) => t.updated_at = at,
            Entity::Rule(r) => r.updated_at = at,
            Entity::Reward(r) => r.updated_at = at,
            Entity::Punishment(p) => p.updated_at = at,
        }
    }

    /// Serialize as a plain row (no kind tag)
    pub fn to_record(&self) -> Result<serde_json::Value> {
        let value = match self {
            Entity::Task(t) => serde_json::to_value(t)?,
            Entity::Rule(r) => serde_json::to_value(r)?,
            Entity::Reward(r) => serde_json::to_value(r)?,
            Entity::Punishment(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    /// Decode a plain row stored under `collection`.
    ///
    /// Missing fields take their defaults; a record without an id is rejected.
    pub fn from_record(collection: Collection, record: serde_json::Value) -> Result<Self> {
        let entity = match collection {
            Collection::Tasks => Entity::Task(serde_json::from_value(record)?),
            Collection::Rules => Entity::Rule(serde_json::from_value(record)?),
            Collection::Rewards => Entity::Reward(serde_json::from_value(record)?),
            Collection::Punishments => Entity::Punishment(serde_json::from_value(record)?),
            other => {
                return Err(SyncError::Serialization(format!(
                    "{} does not hold entities",
                    other
                )))
            }
        };

        if entity.id().is_empty() {
            return Err(SyncError::Serialization(format!(
                "{} record without id",
                collection
            )));
        }
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    #[test]
    fn test_missing_fields_take_defaults() {
        let record = serde_json::json!({ "id": "t1", "title": "Dishes" });
        let entity = Entity::from_record(Collection::Tasks, record).unwrap();

        let Entity::Task(task) = entity else {
            panic!("expected task");
        };
        assert_eq!(task.title, "Dishes");
        assert_eq!(task.frequency, Frequency::Daily);
        assert_eq!(task.points, 0);
        assert!(!task.completed);
        assert!(task.usage_counters.is_clear());
    }

    #[test]
    fn test_record_without_id_is_rejected() {
        let record = serde_json::json!({ "title": "No id" });
        assert!(Entity::from_record(Collection::Rules, record).is_err());
    }

    #[test]
    fn test_non_entity_collection_is_rejected() {
        let record = serde_json::json!({ "id": "x" });
        assert!(Entity::from_record(Collection::Points, record).is_err());
    }

    #[test]
    fn test_record_round_trip_keeps_fields() {
        let reward = Entity::Reward(Reward {
            id: "r1".into(),
            owner_scope: "u1".into(),
            title: "Movie night".into(),
            cost: 40,
            supply: 2,
            usage_counters: UsageCounters::cleared().marked(Weekday::Fri),
            ..Default::default()
        });

        let record = reward.to_record().unwrap();
        assert!(record.get("kind").is_none());
        let decoded = Entity::from_record(Collection::Rewards, record).unwrap();
        assert_eq!(decoded, reward);
    }

    #[test]
    fn test_set_usage_counters_replaces_sequence() {
        let mut entity = Entity::Punishment(Punishment {
            id: "p1".into(),
            usage_counters: UsageCounters::cleared().marked(Weekday::Mon),
            ..Default::default()
        });
        entity.set_usage_counters(UsageCounters::cleared());
        assert!(entity.usage_counters().is_clear());
    }
}
