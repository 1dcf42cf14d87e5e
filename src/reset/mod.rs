//! Periodic reset scheduler
//!
//! Daily and weekly boundaries clear the per-weekday usage counters. Each kind
//! keeps a durable `last*ResetKey:{scope}` marker; a reset runs when the
//! current period id differs from it, so re-running inside a period is a no-op.

mod period;
mod scheduler;

pub use period::PeriodKind;
pub use scheduler::{ResetReport, ResetScheduler};
