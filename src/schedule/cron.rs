//! Cron expression utilities: validation, next-fire computation and the
//! conservative minimum-interval estimate behind missed-run detection.
//!
//! Expressions use the 6-field form with a leading seconds field
//! (`sec min hour dom month dow`); standard 5-field Unix expressions are
//! accepted and normalized by prepending `0` for the seconds field.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

use super::error::{Result, ScheduleError};

/// Converts a 5-field Unix expression to the 6-field form the `cron`
/// crate parses; 6-or-more-field expressions pass through unchanged.
pub fn normalize(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

/// Parses an expression, surfacing the parser's reason on failure.
pub fn parse(expression: &str) -> Result<Schedule> {
    Schedule::from_str(&normalize(expression)).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// The next fire strictly after `after`.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Conservative lower bound, in seconds, on the gap between two firings,
/// derived from the seconds field alone:
///
/// - `*/k` → `k`
/// - `*` → 1
/// - a literal second → 60 (fires at most once a minute)
/// - a comma list → the smallest gap between successive listed seconds
/// - anything else → 60
///
/// Deliberately an underestimate for complex expressions; missed-run
/// detection only needs "definitely at least one period has passed".
pub fn min_interval_secs(expression: &str) -> u64 {
    let normalized = normalize(expression);
    let Some(seconds_field) = normalized.split_whitespace().next() else {
        return 60;
    };

    if seconds_field == "*" {
        return 1;
    }
    if let Some(step) = seconds_field.strip_prefix("*/") {
        return step.parse().unwrap_or(60);
    }
    if seconds_field.contains(',') {
        let mut values: Vec<u64> = seconds_field
            .split(',')
            .filter_map(|v| v.parse().ok())
            .collect();
        values.sort_unstable();
        let min_gap = values
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .min()
            .unwrap_or(60);
        return min_gap.max(1);
    }
    // A single literal, a range, or anything unrecognized.
    60
}

/// Whether a function whose last firing was at `last_ms` should have
/// fired again by `now_ms`.
pub fn should_have_run(expression: &str, last_ms: i64, now_ms: i64) -> bool {
    let min_interval_ms = min_interval_secs(expression) as i64 * 1000;
    last_ms + min_interval_ms <= now_ms && last_ms < now_ms
}
