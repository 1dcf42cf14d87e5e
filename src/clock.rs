//! Calendar source for period boundaries and weekday slots

use std::sync::Mutex;

use chrono::{DateTime, Local, NaiveDate, Utc};

/// Supplies the local calendar date. Injected so resets can be driven in tests.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock in the device's local timezone
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Clock pinned to a date that only moves when told to
#[derive(Debug)]
pub struct FixedClock {
    today: Mutex<NaiveDate>,
}

impl FixedClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today: Mutex::new(today),
        }
    }

    pub fn set(&self, today: NaiveDate) {
        *self.today.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = today;
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        *self.today.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
