use thiserror::Error;

mod parser;
mod schedule;
mod types;

pub use schedule::CronSchedule;
pub use types::{CronTimer, CronValue};

/// Error returned when a cron expression cannot be parsed.
#[derive(Error, Debug)]
#[error("invalid cron expression '{input}': {msg}")]
pub struct CronParseError {
    pub input: String,
    pub msg: String,
}

/// Parse a 5-field cron expression into a [`CronTimer`].
///
/// The five space-separated fields are minute (0-59), hour (0-23),
/// day of month (1-31), month (1-12) and day of week (0-6, 0 = Sunday).
/// Each field is a comma-separated list of an explicit number, a range
/// such as `1-5`, `*` for every valid value, or `*/n` for every value
/// divisible by `n`.
///
/// ```rust
/// use procrastinate_cron::{parse_cron, CronValue};
///
/// let timer = parse_cron("*/5 8-18 * * 1").unwrap();
/// assert_eq!(timer.minutes(), &vec![CronValue::Step(5)]);
/// assert_eq!(timer.hours(), &vec![CronValue::Range(8, 18)]);
/// assert!(parse_cron("61 * * * *").is_err());
/// ```
pub fn parse_cron(expression: &str) -> Result<CronTimer, CronParseError> {
    use nom::combinator::all_consuming;

    let (_, timer) =
        all_consuming(parser::cron_timer)(expression.trim()).map_err(|e| CronParseError {
            input: expression.to_string(),
            msg: format!("{e:?}"),
        })?;

    Ok(timer)
}
