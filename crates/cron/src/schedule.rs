use chrono::{prelude::*, Duration};

use crate::{parse_cron, CronParseError, CronTimer};

/// How far ahead (or back) slot computation will scan before giving up.
/// Five years covers every satisfiable 5-field expression, including
/// "Feb 29" style schedules.
const SCAN_LIMIT_DAYS: i64 = 366 * 5;

/// A parsed cron expression together with its source text.
///
/// The source text is kept for logging and for identifying the schedule in
/// configuration; all matching goes through the parsed [`CronTimer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    timer: CronTimer,
    expression: String,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let timer = parse_cron(expression)?;
        Ok(Self {
            timer,
            expression: expression.trim().to_string(),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timer(&self) -> &CronTimer {
        &self.timer
    }

    pub fn should_run_at(&self, at: &NaiveDateTime) -> bool {
        self.timer.should_run_at(at)
    }

    /// The next matching minute strictly after `after`, or `None` when the
    /// expression is unsatisfiable within the scan window.
    ///
    /// ```rust
    /// use chrono::prelude::*;
    /// use procrastinate_cron::CronSchedule;
    ///
    /// let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
    /// let after = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    /// assert_eq!(
    ///     schedule.next_after(&after),
    ///     Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap()),
    /// );
    /// ```
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let mut ts = round_to_minute(after.clone()) + Duration::minutes(1);
        let deadline = ts.clone() + Duration::days(SCAN_LIMIT_DAYS);

        while ts <= deadline {
            let local = ts.naive_local();
            if !self.timer.date_matches(&local.date()) {
                // Skip the rest of a non-matching day in one step.
                let to_midnight = 24 * 60 - (local.hour() * 60 + local.minute());
                ts += Duration::minutes(to_midnight as i64);
                continue;
            }
            if self.timer.time_matches(&local) {
                return Some(ts);
            }
            ts += Duration::minutes(1);
        }

        None
    }

    /// The most recent `n` matching minutes at or before `at`, oldest
    /// first. Used by the periodic deferrer to catch up missed slots after
    /// a late wake; `n` bounds the look-back.
    pub fn prev_slots<Tz: TimeZone>(&self, at: &DateTime<Tz>, n: u32) -> Vec<DateTime<Tz>> {
        let mut slots = Vec::new();
        let mut ts = round_to_minute(at.clone());
        let deadline = ts.clone() - Duration::days(SCAN_LIMIT_DAYS);

        while slots.len() < n as usize && ts >= deadline {
            let local = ts.naive_local();
            if !self.timer.date_matches(&local.date()) {
                // Jump back to 23:59 of the previous day.
                let since_midnight = local.hour() * 60 + local.minute();
                ts -= Duration::minutes(since_midnight as i64 + 1);
                continue;
            }
            if self.timer.time_matches(&local) {
                slots.push(ts.clone());
            }
            ts -= Duration::minutes(1);
        }

        slots.reverse();
        slots
    }
}

fn round_to_minute<Tz: TimeZone>(datetime: DateTime<Tz>) -> DateTime<Tz> {
    datetime
        .with_nanosecond(0)
        .and_then(|dt| dt.with_second(0))
        .expect("zeroing seconds cannot leave the valid range")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn next_after_steps_to_the_next_matching_minute() -> Result<()> {
        let schedule = CronSchedule::parse("*/5 * * * *")?;
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 12, 2, 30).unwrap();
        assert_eq!(
            schedule.next_after(&after),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap()),
        );

        // Exactly on a slot: strictly after
        let on_slot = Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap();
        assert_eq!(
            schedule.next_after(&on_slot),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 10, 0).unwrap()),
        );

        Ok(())
    }

    #[test]
    fn next_after_skips_non_matching_days() -> Result<()> {
        // Midnight on the first of the month
        let schedule = CronSchedule::parse("0 0 1 * *")?;
        let after = Utc.with_ymd_and_hms(2024, 3, 2, 7, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(&after),
            Some(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()),
        );
        Ok(())
    }

    #[test]
    fn next_after_respects_fixed_offset() -> Result<()> {
        // 09:00 every day, evaluated in UTC+02:00
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let schedule = CronSchedule::parse("0 9 * * *")?;
        let after = tz.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let next = schedule.next_after(&after).unwrap();
        assert_eq!(next, tz.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).unwrap());
        // 09:00+02:00 is 07:00 UTC
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 3, 2, 7, 0, 0).unwrap(),
        );
        Ok(())
    }

    #[test]
    fn prev_slots_returns_most_recent_slots_oldest_first() -> Result<()> {
        let schedule = CronSchedule::parse("*/5 * * * *")?;
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 7, 45).unwrap();

        assert_eq!(
            schedule.prev_slots(&at, 1),
            vec![Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap()],
        );
        assert_eq!(
            schedule.prev_slots(&at, 3),
            vec![
                Utc.with_ymd_and_hms(2024, 3, 1, 11, 55, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap(),
            ],
        );

        Ok(())
    }

    #[test]
    fn prev_slots_includes_the_current_minute() -> Result<()> {
        let schedule = CronSchedule::parse("*/5 * * * *")?;
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 3).unwrap();
        assert_eq!(
            schedule.prev_slots(&at, 1),
            vec![Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap()],
        );
        Ok(())
    }

    #[test]
    fn unsatisfiable_expression_yields_nothing() -> Result<()> {
        // February 31st never happens
        let schedule = CronSchedule::parse("0 0 31 2 *")?;
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(schedule.next_after(&after), None);
        assert!(schedule.prev_slots(&after, 1).is_empty());
        Ok(())
    }
}
