//! Billing period boundaries
//!
//! Every tenant is anchored to calendar months in UTC: a period ends at
//! midnight on the first day of the following month. A lazily created record
//! starts "now" and ends at the next month boundary; a record that rolls over
//! moves to the month containing the current instant.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use quotaguard_common::{BillingPeriod, UsageRecord};

/// Computes period windows and rollover decisions
#[derive(Debug, Clone, Copy, Default)]
pub struct BillingPeriodManager;

impl BillingPeriodManager {
    pub fn new() -> Self {
        Self
    }

    /// True iff `now` is past the record's period end
    pub fn needs_reset(&self, record: &UsageRecord, now: DateTime<Utc>) -> bool {
        record.period().has_elapsed(now)
    }

    /// The calendar month after the one containing `from`
    pub fn next_period(&self, from: DateTime<Utc>) -> BillingPeriod {
        let start = next_month_start(from);
        BillingPeriod::new(start, next_month_start(start))
    }

    /// Window for a record created at `now`: starts now, ends at the next month boundary
    pub fn initial_period(&self, now: DateTime<Utc>) -> BillingPeriod {
        BillingPeriod::new(now, next_month_start(now))
    }

    /// The calendar month containing `now`, used when a record rolls over
    pub fn period_containing(&self, now: DateTime<Utc>) -> BillingPeriod {
        BillingPeriod::new(month_start(now), next_month_start(now))
    }
}

fn month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    first_of(at.year(), at.month())
}

fn next_month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    if at.month() == 12 {
        first_of(at.year() + 1, 1)
    } else {
        first_of(at.year(), at.month() + 1)
    }
}

fn first_of(year: i32, month: u32) -> DateTime<Utc> {
    // Midnight on the 1st exists in every month of every representable year
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
