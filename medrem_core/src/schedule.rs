//! Dosing rule evaluation.
//!
//! Rules are evaluated in the owner's local wall-clock time and then
//! converted to UTC, so an 08:00 dose stays at 08:00 across daylight-saving
//! changes (the elapsed interval between doses is allowed to vary).
//!
//! Resolution of local times that do not map to exactly one instant:
//! - Ambiguous (clocks fall back): the earlier instant is used, once.
//! - Nonexistent (clocks spring forward): read with the offset in force
//!   before the gap, i.e. moved forward by the gap's length (02:30 becomes
//!   03:30), so distinct times inside and after the gap stay distinct.

use crate::{DosingRule, Error, Frequency, Result, RuleSegment};
use chrono::offset::LocalResult;
use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc,
};
use chrono_tz::Tz;
use std::collections::{BTreeSet, HashSet};

/// Longest daylight-saving gap searched (real gaps are at most 2h)
const MAX_GAP_MINUTES: i64 = 180;

/// Longest accepted dosing interval: one year
pub const MAX_INTERVAL_MINUTES: i64 = 366 * 24 * 60;

/// Validate a dosing rule
///
/// Fails with `InvalidRule` on a non-positive or over-long interval, an empty daily or
/// weekly list, duplicate entries, or an end date before the start date.
pub fn validate(rule: &DosingRule) -> Result<()> {
    match &rule.frequency {
        Frequency::Interval { every_minutes, .. } => {
            if *every_minutes <= 0 {
                return Err(Error::InvalidRule(format!(
                    "interval must be positive, got {} minutes",
                    every_minutes
                )));
            }
            if *every_minutes > MAX_INTERVAL_MINUTES {
                return Err(Error::InvalidRule(format!(
                    "interval must be at most {} minutes, got {}",
                    MAX_INTERVAL_MINUTES, every_minutes
                )));
            }
        }
        Frequency::Daily { times } => validate_times(times)?,
        Frequency::Weekly { days, times } => {
            if days.is_empty() {
                return Err(Error::InvalidRule(
                    "weekly rule needs at least one day".into(),
                ));
            }
            let unique: HashSet<_> = days.iter().collect();
            if unique.len() != days.len() {
                return Err(Error::InvalidRule("weekly rule repeats a day".into()));
            }
            validate_times(times)?;
        }
    }

    if let Some(end) = rule.end {
        if end < rule.start {
            return Err(Error::InvalidRule(format!(
                "end date {} precedes start date {}",
                end, rule.start
            )));
        }
    }

    Ok(())
}

fn validate_times(times: &[NaiveTime]) -> Result<()> {
    if times.is_empty() {
        return Err(Error::InvalidRule(
            "at least one time of day must be specified".into(),
        ));
    }
    let unique: HashSet<_> = times.iter().collect();
    if unique.len() != times.len() {
        return Err(Error::InvalidRule("time of day listed twice".into()));
    }
    Ok(())
}

/// First instant a rule can produce a dose: local midnight of the start date
pub fn rule_start(rule: &DosingRule, tz: Tz) -> DateTime<Utc> {
    local_midnight(rule.start, tz)
}

/// Exclusive upper bound of a rule: local midnight of the end date
pub fn rule_end(rule: &DosingRule, tz: Tz) -> Option<DateTime<Utc>> {
    rule.end.map(|end| local_midnight(end, tz))
}

/// Produce all due instants of `rule` in `[window_start, window_end)`
///
/// Pure and deterministic: the same inputs always give the same ascending,
/// duplicate-free sequence, and a wider window gives a superset.
pub fn generate(
    rule: &DosingRule,
    tz: Tz,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let from = window_start.max(rule_start(rule, tz));
    let to = match rule_end(rule, tz) {
        Some(end) => window_end.min(end),
        None => window_end,
    };
    if from >= to {
        return Vec::new();
    }

    let mut due = BTreeSet::new();
    let in_window = |t: &DateTime<Utc>| *t >= from && *t < to;

    match &rule.frequency {
        Frequency::Interval {
            every_minutes,
            anchor,
        } => {
            let Some(every) = Duration::try_minutes(*every_minutes) else {
                return Vec::new();
            };
            if every <= Duration::zero() {
                return Vec::new();
            }
            let origin = NaiveDateTime::new(rule.start, *anchor);
            // One day of slack on each side covers any UTC offset
            let first = from.with_timezone(&tz).naive_local() - Duration::days(1);
            let last = to.with_timezone(&tz).naive_local() + Duration::days(1);

            let skip = if first > origin {
                (first - origin).num_minutes() / every_minutes
            } else {
                0
            };
            let mut next = skip
                .checked_mul(*every_minutes)
                .and_then(Duration::try_minutes)
                .and_then(|offset| origin.checked_add_signed(offset));
            while let Some(local) = next {
                if local > last {
                    break;
                }
                if let Some(t) = resolve_local(tz, local) {
                    if in_window(&t) {
                        due.insert(t);
                    }
                }
                next = local.checked_add_signed(every);
            }
        }
        Frequency::Daily { times } => {
            for date in local_dates(rule, tz, from, to) {
                for time in times {
                    if let Some(t) = resolve_local(tz, NaiveDateTime::new(date, *time)) {
                        if in_window(&t) {
                            due.insert(t);
                        }
                    }
                }
            }
        }
        Frequency::Weekly { days, times } => {
            for date in local_dates(rule, tz, from, to) {
                if !days.contains(&date.weekday()) {
                    continue;
                }
                for time in times {
                    if let Some(t) = resolve_local(tz, NaiveDateTime::new(date, *time)) {
                        if in_window(&t) {
                            due.insert(t);
                        }
                    }
                }
            }
        }
    }

    due.into_iter().collect()
}

/// Produce due instants in `[from, to)` across a rule history
///
/// Each segment governs from its `effective_from` up to the next segment's.
pub fn generate_segments(
    segments: &[RuleSegment],
    tz: Tz,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let mut due = Vec::new();
    for (i, segment) in segments.iter().enumerate() {
        let seg_from = from.max(segment.effective_from);
        let seg_to = match segments.get(i + 1) {
            Some(next) => to.min(next.effective_from),
            None => to,
        };
        if seg_from < seg_to {
            due.extend(generate(&segment.rule, tz, seg_from, seg_to));
        }
    }
    due
}

/// Local calendar dates overlapping `[from, to)`, clipped to the rule's span
fn local_dates(
    rule: &DosingRule,
    tz: Tz,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> impl Iterator<Item = NaiveDate> {
    let first = (from.with_timezone(&tz).date_naive() - Duration::days(1)).max(rule.start);
    let mut last = to.with_timezone(&tz).date_naive() + Duration::days(1);
    if let Some(end) = rule.end {
        // `end` is exclusive
        last = last.min(end - Duration::days(1));
    }
    first.iter_days().take_while(move |d| *d <= last)
}

fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let midnight = NaiveDateTime::new(date, NaiveTime::MIN);
    resolve_local(tz, midnight).unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

/// Map a local wall-clock time to a single UTC instant
pub fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            let before = (1..=MAX_GAP_MINUTES).find_map(|m| {
                tz.from_local_datetime(&(local - Duration::minutes(m)))
                    .latest()
            })?;
            before
                .offset()
                .fix()
                .from_local_datetime(&local)
                .single()
                .map(|t| t.with_timezone(&Utc))
        }
    }
}
