//! Period identifiers

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::Frequency;
use crate::store::{LAST_DAILY_RESET_KEY, LAST_WEEKLY_RESET_KEY};

/// Kind of recurring boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Daily,
    Weekly,
}

impl PeriodKind {
    pub const ALL: [PeriodKind; 2] = [PeriodKind::Daily, PeriodKind::Weekly];

    /// Entities with this frequency are reset at this boundary
    pub fn frequency(&self) -> Frequency {
        match self {
            PeriodKind::Daily => Frequency::Daily,
            PeriodKind::Weekly => Frequency::Weekly,
        }
    }

    pub fn marker_base(&self) -> &'static str {
        match self {
            PeriodKind::Daily => LAST_DAILY_RESET_KEY,
            PeriodKind::Weekly => LAST_WEEKLY_RESET_KEY,
        }
    }

    /// `YYYY-MM-DD` for daily periods, ISO `YYYY-Www` for weekly ones
    pub fn period_id(&self, date: NaiveDate) -> String {
        match self {
            PeriodKind::Daily => date.format("%Y-%m-%d").to_string(),
            PeriodKind::Weekly => {
                let week = date.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodKind::Daily => f.write_str("daily"),
            PeriodKind::Weekly => f.write_str("weekly"),
        }
    }
}
