//! Compiled recurrence expressions.
//!
//! Thin wrapper over [`cron::Schedule`]. Accepts standard 5-field cron
//! (`min hour dom month dow`) as well as the 6/7-field forms with a
//! leading seconds column understood by the `cron` crate.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::RecurrenceError;

/// Normalize a 5-field cron expression to 6-field by prepending "0 " for seconds.
pub fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// A recurrence expression together with its compiled schedule.
#[derive(Clone)]
pub struct Recurrence {
    expression: String,
    schedule: Schedule,
}

impl Recurrence {
    /// Compile `expression`.
    ///
    /// # Errors
    ///
    /// Returns [`RecurrenceError`] if the expression is empty or the `cron`
    /// crate rejects it.
    pub fn parse(expression: &str) -> Result<Self, RecurrenceError> {
        if expression.trim().is_empty() {
            return Err(RecurrenceError {
                expression: expression.to_string(),
                reason: "empty expression".into(),
            });
        }
        let schedule = Schedule::from_str(&normalize_cron(expression)).map_err(|e| {
            RecurrenceError {
                expression: expression.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    /// The expression as written by the job's owner.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next fire time strictly after `now`, or `None` if the schedule has no
    /// future occurrences (e.g. a fixed year in the past).
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }

    /// How long to wait from `now` until the next fire time.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, Duration)> {
        let next = self.next_after(now)?;
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        Some((next, delay))
    }
}

impl fmt::Debug for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Recurrence").field(&self.expression).finish()
    }
}

impl FromStr for Recurrence {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_gain_a_seconds_column() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("  * * * * * *  "), "* * * * * *");
    }

    #[test]
    fn every_second_fires_one_second_later() {
        let r = Recurrence::parse("* * * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let next = r.next_after(now).unwrap();
        assert_eq!(next, now + chrono::Duration::seconds(1));
    }

    #[test]
    fn five_field_minutely_fires_on_the_minute() {
        let r = Recurrence::parse("* * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap();
        let (next, delay) = r.delay_from(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap());
        assert_eq!(delay, Duration::from_secs(30));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(Recurrence::parse("").is_err());
        assert!(Recurrence::parse("not a cron").is_err());
        let err = Recurrence::parse("61 * * * *").unwrap_err();
        assert_eq!(err.expression, "61 * * * *");
    }

    #[test]
    fn expression_is_kept_as_written() {
        let r: Recurrence = " */10 * * * * ".parse().unwrap();
        assert_eq!(r.expression(), "*/10 * * * *");
    }
}
