use chrono::prelude::*;
use getset::Getters;

/// A single entry of a cron field.
///
/// Numbers, ranges and steps must be valid for the field they appear in
/// (0-59 for minutes, 0-23 for hours, and so on); the parser enforces the
/// boundaries.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub enum CronValue {
    Number(u32),
    Range(u32, u32),
    Step(u32),
    #[default]
    Any,
}

impl CronValue {
    /// Check whether `value` matches this entry. `step_offset` is the
    /// lowest valid value of the field (1 for days and months, 0 otherwise)
    /// and anchors step matching.
    pub(crate) fn matches(&self, value: u32, step_offset: u32) -> bool {
        match self {
            CronValue::Number(n) => &value == n,
            CronValue::Range(low, high) => &value >= low && &value <= high,
            CronValue::Step(n) => (value % n) == step_offset,
            CronValue::Any => true,
        }
    }
}

/// The five parsed fields of a cron expression, one `Vec` per field
/// (comma-separated entries).
#[derive(Debug, PartialEq, Eq, Clone, Getters)]
#[getset(get = "pub")]
pub struct CronTimer {
    pub minutes: Vec<CronValue>,
    pub hours: Vec<CronValue>,
    pub days: Vec<CronValue>,
    pub months: Vec<CronValue>,
    /// Days of week, 0 = Sunday
    pub dows: Vec<CronValue>,
}

impl Default for CronTimer {
    fn default() -> Self {
        Self {
            minutes: vec![CronValue::default()],
            hours: vec![CronValue::default()],
            days: vec![CronValue::default()],
            months: vec![CronValue::default()],
            dows: vec![CronValue::default()],
        }
    }
}

impl CronTimer {
    /// Check if the timer matches the given wall-clock minute.
    ///
    /// ```rust
    /// use procrastinate_cron::{CronTimer, CronValue};
    ///
    /// let timer = CronTimer {
    ///     minutes: vec![CronValue::Number(30)],
    ///     hours: vec![CronValue::Range(8, 10)],
    ///     days: vec![CronValue::Step(4)],
    ///     ..Default::default()
    /// };
    /// assert!(timer.should_run_at(&"2012-12-17T08:30:12".parse().unwrap()));
    /// assert!(!timer.should_run_at(&"2012-12-17T11:30:59".parse().unwrap()));
    /// ```
    pub fn should_run_at(&self, at: &NaiveDateTime) -> bool {
        self.time_matches(at) && self.date_matches(&at.date())
    }

    pub(crate) fn time_matches(&self, at: &NaiveDateTime) -> bool {
        self.minutes.iter().any(|v| v.matches(at.minute(), 0))
            && self.hours.iter().any(|v| v.matches(at.hour(), 0))
    }

    pub(crate) fn date_matches(&self, date: &NaiveDate) -> bool {
        self.days.iter().any(|v| v.matches(date.day(), 1))
            && self.months.iter().any(|v| v.matches(date.month(), 1))
            && self
                .dows
                .iter()
                .any(|v| v.matches(date.weekday().num_days_from_sunday(), 0))
    }
}
