//! Domain model
//!
//! Tasks, rules, rewards and punishments share one shape (id, owner scope,
//! seven usage counters, timestamps) and are held as the closed [`Entity`]
//! enum. The points ledger and the history log ride alongside them.

mod collection;
mod counters;
mod entity;
mod history;
mod id;
mod ledger;

pub use collection::Collection;
pub use counters::{UsageCounters, USAGE_SLOTS};
pub use entity::{Entity, Frequency, Priority, Punishment, Reward, Rule, Task};
pub use history::{HistoryEntry, HistoryKind};
pub use id::{EntityId, Scope, OPTIMISTIC_PREFIX};
pub use ledger::{LedgerDelta, PointsLedger};
