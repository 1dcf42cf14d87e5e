//! Caller input for generic creates and updates

use chrono::{DateTime, Utc};

use crate::error::{Result, SyncError};
use crate::model::{
    Entity, EntityId, Frequency, Priority, Punishment, Reward, Rule, Scope, Task, UsageCounters,
};

/// Fields for a new entity.
///
/// Id, owner scope, counters and timestamps are filled in when the draft is
/// turned into a prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDraft(Entity);

impl EntityDraft {
    pub fn task(title: impl Into<String>, points: i64, frequency: Frequency) -> Self {
        Self(Entity::Task(Task {
            title: title.into(),
            points,
            frequency,
            ..Default::default()
        }))
    }

    pub fn rule(title: impl Into<String>, frequency: Frequency) -> Self {
        Self(Entity::Rule(Rule {
            title: title.into(),
            frequency,
            ..Default::default()
        }))
    }

    pub fn reward(title: impl Into<String>, cost: i64, supply: u32) -> Self {
        Self(Entity::Reward(Reward {
            title: title.into(),
            cost,
            supply,
            ..Default::default()
        }))
    }

    pub fn punishment(title: impl Into<String>, points: i64) -> Self {
        Self(Entity::Punishment(Punishment {
            title: title.into(),
            points,
            ..Default::default()
        }))
    }

    /// Start from a fully built entity; its id and scope are overwritten
    pub fn from_entity(entity: Entity) -> Self {
        Self(entity)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let description = Some(description.into());
        match &mut self.0 {
            Entity::Task(t) => t.description = description,
            Entity::Rule(r) => r.description = description,
            Entity::Reward(r) => r.description = description,
            Entity::Punishment(p) => p.description = description,
        }
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        match &mut self.0 {
            Entity::Task(t) => t.priority = priority,
            Entity::Rule(r) => r.priority = priority,
            _ => {}
        }
        self
    }

    pub fn collection(&self) -> crate::model::Collection {
        self.0.collection()
    }

    /// Predicted entity under a fresh optimistic id
    pub(crate) fn into_prediction(self, scope: &Scope, now: DateTime<Utc>) -> Entity {
        let mut entity = self.0;
        entity.set_id(EntityId::optimistic());
        entity.set_usage_counters(UsageCounters::cleared());
        match &mut entity {
            Entity::Task(t) => {
                t.owner_scope = scope.clone();
                t.completed = false;
                t.created_at = now;
            }
            Entity::Rule(r) => {
                r.owner_scope = scope.clone();
                r.created_at = now;
            }
            Entity::Reward(r) => {
                r.owner_scope = scope.clone();
                r.created_at = now;
            }
            Entity::Punishment(p) => {
                p.owner_scope = scope.clone();
                p.created_at = now;
            }
        }
        entity.touch(now);
        entity
    }
}

/// Field changes for an existing entity. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub priority: Option<Priority>,
    pub frequency: Option<Frequency>,
    /// Task reward or punishment penalty
    pub points: Option<i64>,
    pub cost: Option<i64>,
    pub supply: Option<u32>,
    pub completed: Option<bool>,
    pub usage_counters: Option<UsageCounters>,
}

impl EntityPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Merge into `prior`. Fields the entity kind does not have are rejected.
    pub(crate) fn merged_into(&self, prior: &Entity, now: DateTime<Utc>) -> Result<Entity> {
        let mut entity = prior.clone();
        let kind = entity.collection();
        let unsupported = |field: &str| {
            SyncError::InvalidMutation(format!("{} has no field `{}`", kind, field))
        };

        match &mut entity {
            Entity::Task(t) => {
                self.common(&mut t.title, &mut t.description, &mut t.frequency);
                set(&mut t.priority, self.priority);
                set(&mut t.points, self.points);
                set(&mut t.completed, self.completed);
                if self.cost.is_some() {
                    return Err(unsupported("cost"));
                }
                if self.supply.is_some() {
                    return Err(unsupported("supply"));
                }
            }
            Entity::Rule(r) => {
                self.common(&mut r.title, &mut r.description, &mut r.frequency);
                set(&mut r.priority, self.priority);
                for (field, present) in [
                    ("points", self.points.is_some()),
                    ("cost", self.cost.is_some()),
                    ("supply", self.supply.is_some()),
                    ("completed", self.completed.is_some()),
                ] {
                    if present {
                        return Err(unsupported(field));
                    }
                }
            }
            Entity::Reward(r) => {
                self.common(&mut r.title, &mut r.description, &mut r.frequency);
                set(&mut r.cost, self.cost);
                set(&mut r.supply, self.supply);
                for (field, present) in [
                    ("priority", self.priority.is_some()),
                    ("points", self.points.is_some()),
                    ("completed", self.completed.is_some()),
                ] {
                    if present {
                        return Err(unsupported(field));
                    }
                }
            }
            Entity::Punishment(p) => {
                self.common(&mut p.title, &mut p.description, &mut p.frequency);
                set(&mut p.points, self.points);
                for (field, present) in [
                    ("priority", self.priority.is_some()),
                    ("cost", self.cost.is_some()),
                    ("supply", self.supply.is_some()),
                    ("completed", self.completed.is_some()),
                ] {
                    if present {
                        return Err(unsupported(field));
                    }
                }
            }
        }

        if let Some(counters) = self.usage_counters {
            entity.set_usage_counters(counters);
        }
        entity.touch(now);
        Ok(entity)
    }

    fn common(&self, title: &mut String, description: &mut Option<String>, frequency: &mut Frequency) {
        if let Some(t) = &self.title {
            *title = t.clone();
        }
        if let Some(d) = &self.description {
            *description = d.clone();
        }
        set(frequency, self.frequency);
    }
}

fn set<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}
