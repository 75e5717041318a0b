//! Adherence statistics over a window of dose obligations.
//!
//! Pure functions: the ledger hands in obligations, nothing is stored.

use crate::{DoseObligation, DoseStatus, Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Longest lookback accepted by [`AdherenceWindow::last_days`]
pub const MAX_WINDOW_DAYS: u32 = 365;

/// Half-open range `[start, end)` over scheduled times
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdherenceWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AdherenceWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(Error::InvalidWindow(format!(
                "window end {} is not after start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    /// The last `days` days up to `now`
    pub fn last_days(now: DateTime<Utc>, days: u32) -> Result<Self> {
        if days == 0 || days > MAX_WINDOW_DAYS {
            return Err(Error::InvalidWindow(format!(
                "days must be between 1 and {}, got {}",
                MAX_WINDOW_DAYS, days
            )));
        }
        Self::new(now - Duration::days(i64::from(days)), now)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Aggregate over the obligations in a window
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AdherenceRecord {
    pub taken: u32,
    pub missed: u32,
    pub skipped: u32,
    /// Taken within the on-time tolerance of the scheduled time
    pub on_time: u32,
    /// Pending or Reminded; excluded from the ratio
    pub outstanding: u32,
    /// Taken / (Taken + Missed + Skipped); `None` when nothing is resolved yet
    pub taken_ratio: Option<f64>,
    /// Consecutive Taken doses ending with the most recent resolved dose
    pub current_streak: u32,
    pub longest_streak: u32,
}

impl AdherenceRecord {
    pub fn resolved(&self) -> u32 {
        self.taken + self.missed + self.skipped
    }

    /// Taken ratio as a percentage rounded to one decimal
    pub fn percentage(&self) -> Option<f64> {
        self.taken_ratio.map(|r| (r * 1000.0).round() / 10.0)
    }
}

/// Compute adherence for the obligations scheduled inside `window`
///
/// Obligations may span several prescriptions; streaks follow scheduled time.
pub fn calculate<'a, I>(obligations: I, window: &AdherenceWindow, on_time: Duration) -> AdherenceRecord
where
    I: IntoIterator<Item = &'a DoseObligation>,
{
    let mut in_window: Vec<&DoseObligation> = obligations
        .into_iter()
        .filter(|o| window.contains(o.scheduled_at))
        .collect();
    in_window.sort_by_key(|o| (o.scheduled_at, o.prescription_id));

    let mut record = AdherenceRecord::default();
    let mut run = 0u32;

    for obligation in in_window {
        match obligation.status {
            DoseStatus::Pending | DoseStatus::Reminded => {
                record.outstanding += 1;
                continue;
            }
            DoseStatus::Taken => {
                record.taken += 1;
                let punctual = obligation
                    .actual_time
                    .map(|t| (t - obligation.scheduled_at).abs() <= on_time)
                    .unwrap_or(false);
                if punctual {
                    record.on_time += 1;
                }
                run += 1;
                record.longest_streak = record.longest_streak.max(run);
            }
            DoseStatus::Missed => {
                record.missed += 1;
                run = 0;
            }
            DoseStatus::Skipped => {
                record.skipped += 1;
                run = 0;
            }
        }
    }

    record.current_streak = run;
    let resolved = record.resolved();
    if resolved > 0 {
        record.taken_ratio = Some(f64::from(record.taken) / f64::from(resolved));
    }
    record
}
