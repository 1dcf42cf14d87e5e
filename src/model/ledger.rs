//! Points ledger: one balance record per scope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::Scope;

/// Singleton balance for a scope.
///
/// Only written as a side effect of a confirmed mutation, or when the server
/// pushes a new balance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointsLedger {
    pub owner_scope: Scope,
    pub points: i64,
    /// Balance of the linked partner account
    pub partner_points: i64,
    pub updated_at: DateTime<Utc>,
}

impl PointsLedger {
    pub fn empty(scope: Scope) -> Self {
        Self {
            owner_scope: scope,
            ..Default::default()
        }
    }

    /// Copy with `delta` applied
    pub fn applied(&self, delta: LedgerDelta) -> Self {
        Self {
            owner_scope: self.owner_scope.clone(),
            points: self.points + delta.points,
            partner_points: self.partner_points + delta.partner_points,
            updated_at: Utc::now(),
        }
    }
}

/// Signed change to a ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDelta {
    pub points: i64,
    pub partner_points: i64,
}

impl LedgerDelta {
    pub fn points(points: i64) -> Self {
        Self {
            points,
            partner_points: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.points == 0 && self.partner_points == 0
    }

    /// Amount this delta takes away from the main balance
    pub fn debit(&self) -> i64 {
        (-self.points).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_delta() {
        let ledger = PointsLedger {
            points: 100,
            ..PointsLedger::empty("u1".into())
        };
        let after = ledger.applied(LedgerDelta::points(-30));
        assert_eq!(after.points, 70);
        assert_eq!(after.owner_scope.as_str(), "u1");
    }

    #[test]
    fn test_debit_only_counts_spending() {
        assert_eq!(LedgerDelta::points(-25).debit(), 25);
        assert_eq!(LedgerDelta::points(10).debit(), 0);
        assert!(LedgerDelta::default().is_zero());
    }
}
