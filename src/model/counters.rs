//! Per-weekday usage counters

use chrono::Weekday;
use serde::{Deserialize, Deserializer, Serialize};

/// Number of slots, one per weekday
pub const USAGE_SLOTS: usize = 7;

/// Seven "did this day have an event" flags, Monday first.
///
/// The length is fixed by the type. Resets replace the whole value via
/// [`UsageCounters::cleared`], never individual slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct UsageCounters([bool; USAGE_SLOTS]);

impl UsageCounters {
    pub fn cleared() -> Self {
        Self::default()
    }

    pub fn from_slots(slots: [bool; USAGE_SLOTS]) -> Self {
        Self(slots)
    }

    /// Copy with the slot for `day` set
    pub fn marked(mut self, day: Weekday) -> Self {
        self.0[day.num_days_from_monday() as usize] = true;
        self
    }

    pub fn is_marked(&self, day: Weekday) -> bool {
        self.0[day.num_days_from_monday() as usize]
    }

    pub fn is_clear(&self) -> bool {
        self.0.iter().all(|slot| !slot)
    }

    pub fn marked_days(&self) -> usize {
        self.0.iter().filter(|slot| **slot).count()
    }

    pub fn slots(&self) -> &[bool; USAGE_SLOTS] {
        &self.0
    }
}

/// Stored slots are either booleans or legacy 0/1 integers.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredSlot {
    Flag(bool),
    Count(i64),
}

impl<'de> Deserialize<'de> for UsageCounters {
    /// Never fails on shape: a sequence of the wrong length decodes as cleared.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stored = Option::<Vec<StoredSlot>>::deserialize(deserializer)?.unwrap_or_default();
        if stored.len() != USAGE_SLOTS {
            return Ok(Self::cleared());
        }

        let mut slots = [false; USAGE_SLOTS];
        for (slot, value) in slots.iter_mut().zip(stored) {
            *slot = match value {
                StoredSlot::Flag(flag) => flag,
                StoredSlot::Count(count) => count > 0,
            };
        }
        Ok(Self(slots))
    }
}
