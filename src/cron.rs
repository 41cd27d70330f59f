//! Cron schedule parsing and fetch-window math
//!
//! Feed schedules accept the classic 5-field form (minute precision), a
//! 6-field form with a trailing seconds field, and the usual aliases
//! (`@hourly`, `@daily`, ...). Expressions carrying a seventh (year) field
//! are rejected. Internally everything is normalized to the seconds-first
//! layout the scheduler engine expects.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronParseError {
    #[error("empty cron expression")]
    Empty,

    #[error("year field is not allowed in cron expression '{0}'")]
    YearField(String),

    #[error("cron expression '{expr}' must have 5 or 6 fields, found {fields}")]
    FieldCount { expr: String, fields: usize },

    #[error("invalid cron expression '{expr}': {reason}")]
    Invalid { expr: String, reason: String },
}

/// A validated cron expression.
///
/// Keeps the string as the user wrote it for display and config round-trips,
/// alongside the parsed schedule used for tick math.
#[derive(Debug, Clone)]
pub struct CronExpression {
    raw: String,
    normalized: String,
    schedule: Schedule,
}

impl CronExpression {
    /// Parse a 5- or 6-field cron expression or alias.
    pub fn parse(raw: &str) -> Result<Self, CronParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CronParseError::Empty);
        }

        let expanded = match trimmed {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * SUN",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let normalized = match fields.len() {
            // minute hour dom month dow -> prepend a zero seconds field
            5 => format!("0 {}", fields.join(" ")),
            // trailing seconds field moves to the front
            6 => {
                let (head, sec) = fields.split_at(5);
                format!("{} {}", sec[0], head.join(" "))
            }
            7 => return Err(CronParseError::YearField(trimmed.to_string())),
            n => {
                return Err(CronParseError::FieldCount {
                    expr: trimmed.to_string(),
                    fields: n,
                })
            }
        };

        let schedule = Schedule::from_str(&normalized).map_err(|e| CronParseError::Invalid {
            expr: trimmed.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            raw: trimmed.to_string(),
            normalized,
            schedule,
        })
    }

    /// The expression as written in configuration.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Seconds-first form consumed by the scheduler engine.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Next tick strictly after `start`.
    pub fn next_after(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&start).next()
    }

    /// Distance between two successive ticks of this schedule.
    ///
    /// Computed from the next two upcoming ticks; for the periodic
    /// expressions feeds use, this equals the distance between the two
    /// most recent ones.
    pub fn interval(&self, at: DateTime<Utc>) -> Option<Duration> {
        let mut ticks = self.schedule.after(&at);
        let first = ticks.next()?;
        let second = ticks.next()?;
        Some(second - first)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for CronExpression {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl FromStr for CronExpression {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for CronExpression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for CronExpression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        CronExpression::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Upper bound for a single fetch window.
///
/// Returns `min(now, fetch_since + 2 * cron_interval)`. Bounding each run
/// keeps a feed that has been idle for months from scanning its entire
/// history in one pass; successive runs walk the window forward.
pub fn calculate_fetch_until_date(
    schedule: &CronExpression,
    fetch_since: DateTime<Utc>,
) -> DateTime<Utc> {
    let now = Utc::now();
    match schedule.interval(now) {
        Some(interval) => now.min(fetch_since + interval * 2),
        None => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_five_field_expression() {
        let expr = CronExpression::parse("0 * * * *").unwrap();
        assert_eq!(expr.as_str(), "0 * * * *");
        assert_eq!(expr.normalized(), "0 0 * * * *");
    }

    #[test]
    fn parses_six_field_expression_with_trailing_seconds() {
        let expr = CronExpression::parse("*/5 * * * * 30").unwrap();
        assert_eq!(expr.normalized(), "30 */5 * * * *");
    }

    #[test]
    fn rejects_year_field() {
        let err = CronExpression::parse("0 0 * * * 0 2026").unwrap_err();
        assert!(matches!(err, CronParseError::YearField(_)));
    }

    #[test]
    fn rejects_garbage_field_counts() {
        assert!(matches!(
            CronExpression::parse("* *").unwrap_err(),
            CronParseError::FieldCount { fields: 2, .. }
        ));
        assert!(matches!(
            CronExpression::parse("").unwrap_err(),
            CronParseError::Empty
        ));
    }

    #[test]
    fn expands_aliases() {
        for (alias, normalized) in [
            ("@hourly", "0 0 * * * *"),
            ("@daily", "0 0 0 * * *"),
            ("@midnight", "0 0 0 * * *"),
            ("@monthly", "0 0 0 1 * *"),
            ("@yearly", "0 0 0 1 1 *"),
            ("@annually", "0 0 0 1 1 *"),
        ] {
            let expr = CronExpression::parse(alias).unwrap();
            assert_eq!(expr.normalized(), normalized, "alias {alias}");
            assert_eq!(expr.as_str(), alias);
        }
        // weekly resolves to Sunday by name to avoid numbering ambiguity
        let weekly = CronExpression::parse("@weekly").unwrap();
        assert_eq!(weekly.normalized(), "0 0 0 * * SUN");
    }

    #[test]
    fn hourly_interval_is_one_hour() {
        let expr = CronExpression::parse("@hourly").unwrap();
        let interval = expr.interval(Utc::now()).unwrap();
        assert_eq!(interval, Duration::hours(1));
    }

    #[test]
    fn fetch_until_is_bounded_by_window() {
        let expr = CronExpression::parse("0 * * * *").unwrap();
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let until = calculate_fetch_until_date(&expr, since);
        assert_eq!(until, since + Duration::hours(2));
    }

    #[test]
    fn fetch_until_never_exceeds_now() {
        let expr = CronExpression::parse("0 * * * *").unwrap();
        let since = Utc::now() - Duration::minutes(5);
        let until = calculate_fetch_until_date(&expr, since);
        assert!(until <= Utc::now());
    }
}
