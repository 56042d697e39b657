use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::clock::LocalParts;
use crate::model::*;

use super::EngineError;

// ── Weekly availability rules (pure functions) ───────────────────

/// 0 = Sunday.
pub fn weekday_of(date: NaiveDate) -> u8 {
    // num_days_from_sunday is always 0..=6
    date.weekday().num_days_from_sunday() as u8
}

/// True iff the rule is active, falls on `date`'s weekday, and `date` lies
/// within its inclusive validity bounds.
pub fn is_valid_for_date(rule: &AvailabilityRule, date: NaiveDate) -> bool {
    rule.active
        && weekday_of(date) == rule.day_of_week
        && rule.valid_from.is_none_or(|from| from <= date)
        && rule.valid_to.is_none_or(|to| date <= to)
}

/// Slot start times from `start_time`, every 30 minutes, strictly before `end_time`.
pub fn generate_slots(rule: &AvailabilityRule) -> impl Iterator<Item = WallTime> + use<> {
    let end = rule.end_time;
    std::iter::successors(Some(rule.start_time), |t| t.checked_add_minutes(SLOT_MINUTES))
        .take_while(move |t| *t < end)
}

/// Half-open `[s1, e1)` and `[s2, e2)` overlap.
pub fn time_ranges_overlap(s1: WallTime, e1: WallTime, s2: WallTime, e2: WallTime) -> bool {
    s1 < e2 && s2 < e1
}

/// First active rule on the same day overlapping `[start, end)`, ignoring `exclude`.
pub fn find_rule_overlap<'a>(
    rules: &'a [AvailabilityRule],
    day_of_week: u8,
    start: WallTime,
    end: WallTime,
    exclude: Option<Ulid>,
) -> Option<&'a AvailabilityRule> {
    rules.iter().find(|r| {
        r.active
            && r.day_of_week == day_of_week
            && Some(r.id) != exclude
            && time_ranges_overlap(r.start_time, r.end_time, start, end)
    })
}

/// Some rule covers the local instant: valid on its date and `start <= t < end`.
pub fn covers(rules: &[AvailabilityRule], at: &LocalParts) -> bool {
    rules.iter().any(|r| {
        is_valid_for_date(r, at.date) && r.start_time <= at.time && at.time < r.end_time
    })
}

/// Shape checks shared by rule creation and update.
pub fn validate_rule(rule: &AvailabilityRule) -> Result<(), EngineError> {
    if rule.day_of_week > 6 {
        return Err(EngineError::Validation(format!(
            "day_of_week must be 0..=6, got {}",
            rule.day_of_week
        )));
    }
    if rule.end_time <= rule.start_time {
        return Err(EngineError::Validation(format!(
            "end time {} must be after start time {}",
            rule.end_time, rule.start_time
        )));
    }
    let minutes = rule.end_time.minutes() - rule.start_time.minutes();
    if minutes % SLOT_MINUTES != 0 {
        return Err(EngineError::Validation(format!(
            "window {}-{} is not a multiple of {SLOT_MINUTES} minutes",
            rule.start_time, rule.end_time
        )));
    }
    if let (Some(from), Some(to)) = (rule.valid_from, rule.valid_to)
        && from > to
    {
        return Err(EngineError::Validation(format!(
            "valid_from {from} is after valid_to {to}"
        )));
    }
    Ok(())
}
