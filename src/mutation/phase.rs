//! Mutation lifecycle

use std::fmt;

use tracing::debug;

use crate::cache::EntityRef;

/// Where a mutation is in its lifecycle.
///
/// `Pending -> AppliedLocally -> InFlight -> Confirmed | RolledBack`, or
/// `Pending -> Rejected` when a local check fails before anything changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Pending,
    AppliedLocally,
    InFlight,
    Confirmed,
    RolledBack,
    Rejected,
}

impl MutationPhase {
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            MutationPhase::Confirmed | MutationPhase::RolledBack | MutationPhase::Rejected
        )
    }

    pub fn can_advance_to(&self, next: MutationPhase) -> bool {
        use MutationPhase::*;
        matches!(
            (self, next),
            (Pending, AppliedLocally)
                | (Pending, Rejected)
                | (AppliedLocally, InFlight)
                | (InFlight, Confirmed)
                | (InFlight, RolledBack)
        )
    }
}

impl fmt::Display for MutationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationPhase::Pending => "pending",
            MutationPhase::AppliedLocally => "applied-locally",
            MutationPhase::InFlight => "in-flight",
            MutationPhase::Confirmed => "confirmed",
            MutationPhase::RolledBack => "rolled-back",
            MutationPhase::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Phase tracker for one mutation, logging each transition
#[derive(Debug)]
pub(crate) struct PhaseTracker {
    slot: EntityRef,
    intent: &'static str,
    phase: MutationPhase,
}

impl PhaseTracker {
    pub(crate) fn new(slot: EntityRef, intent: &'static str) -> Self {
        Self {
            slot,
            intent,
            phase: MutationPhase::Pending,
        }
    }

    pub(crate) fn advance(&mut self, next: MutationPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "invalid mutation transition {} -> {}",
            self.phase,
            next
        );
        debug!(slot = %self.slot, intent = self.intent, from = %self.phase, to = %next, "Mutation phase");
        self.phase = next;
    }

    pub(crate) fn phase(&self) -> MutationPhase {
        self.phase
    }

    pub(crate) fn slot(&self) -> &EntityRef {
        &self.slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use MutationPhase::*;
        assert!(Pending.can_advance_to(AppliedLocally));
        assert!(AppliedLocally.can_advance_to(InFlight));
        assert!(InFlight.can_advance_to(Confirmed));
        assert!(InFlight.can_advance_to(RolledBack));
        assert!(Pending.can_advance_to(Rejected));
    }

    #[test]
    fn test_settled_phases_are_terminal() {
        use MutationPhase::*;
        for settled in [Confirmed, RolledBack, Rejected] {
            assert!(settled.is_settled());
            for next in [Pending, AppliedLocally, InFlight, Confirmed, RolledBack, Rejected] {
                assert!(!settled.can_advance_to(next));
            }
        }
        assert!(!AppliedLocally.can_advance_to(Rejected));
    }
}
