use nom::{
    branch::alt,
    character::complete::{self, char, space1},
    combinator::{map, opt, verify},
    multi::separated_list1,
    sequence::{preceded, separated_pair, terminated},
    IResult,
};

use crate::types::{CronTimer, CronValue};

/// The five fields of a cron expression, with their valid boundaries.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CronField {
    Minute,
    Hour,
    Day,
    Month,
    DayOfWeek,
}

impl CronField {
    fn boundaries(&self) -> (u32, u32) {
        match self {
            CronField::Minute => (0, 59),
            CronField::Hour => (0, 23),
            CronField::Day => (1, 31),
            CronField::Month => (1, 12),
            CronField::DayOfWeek => (0, 6),
        }
    }
}

/// Attempts to parse a number within the field boundaries
fn field_number<'a>(field: CronField) -> impl Fn(&'a str) -> IResult<&'a str, u32> {
    let (min, max) = field.boundaries();
    move |input| verify(complete::u32, |v| v >= &min && v <= &max)(input)
}

/// Attempts to parse a range within the field boundaries
fn field_range<'a>(field: CronField) -> impl Fn(&'a str) -> IResult<&'a str, (u32, u32)> {
    move |input| {
        verify(
            separated_pair(field_number(field), char('-'), field_number(field)),
            |(left, right)| left < right,
        )(input)
    }
}

/// Attempts to parse a step divisor: field boundaries apply, and zero is
/// rejected (matching divides by the step)
fn step_number<'a>(field: CronField) -> impl Fn(&'a str) -> IResult<&'a str, u32> {
    let (_, max) = field.boundaries();
    move |input| verify(complete::u32, |v| v >= &1 && v <= &max)(input)
}

/// Attempts to parse `*` or `*/n`
fn field_wildcard<'a>(field: CronField) -> impl Fn(&'a str) -> IResult<&'a str, Option<u32>> {
    move |input| preceded(char('*'), opt(preceded(char('/'), step_number(field))))(input)
}

fn field_value<'a>(field: CronField) -> impl Fn(&'a str) -> IResult<&'a str, CronValue> {
    move |input| {
        alt((
            map(field_range(field), |(left, right)| {
                CronValue::Range(left, right)
            }),
            map(field_wildcard(field), |divider| match divider {
                Some(d) => CronValue::Step(d),
                None => CronValue::Any,
            }),
            map(field_number(field), CronValue::Number),
        ))(input)
    }
}

/// Attempts to parse comma separated field values
fn field_values<'a>(field: CronField) -> impl Fn(&'a str) -> IResult<&'a str, Vec<CronValue>> {
    move |input| separated_list1(char(','), field_value(field))(input)
}

/// Parse all 5 cron fields
pub(crate) fn cron_timer(input: &str) -> IResult<&str, CronTimer> {
    let (input, minutes) = terminated(field_values(CronField::Minute), space1)(input)?;
    let (input, hours) = terminated(field_values(CronField::Hour), space1)(input)?;
    let (input, days) = terminated(field_values(CronField::Day), space1)(input)?;
    let (input, months) = terminated(field_values(CronField::Month), space1)(input)?;
    let (input, dows) = field_values(CronField::DayOfWeek)(input)?;

    Ok((
        input,
        CronTimer {
            minutes,
            hours,
            days,
            months,
            dows,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_wildcards() {
        assert_eq!(
            Ok((
                "",
                CronTimer {
                    minutes: vec![CronValue::Any],
                    hours: vec![CronValue::Any],
                    days: vec![CronValue::Any],
                    months: vec![CronValue::Any],
                    dows: vec![CronValue::Any],
                }
            )),
            cron_timer("* * * * *"),
        );
    }

    #[test]
    fn parses_complex_comma_separated_lists() {
        assert_eq!(
            Ok((
                "",
                CronTimer {
                    minutes: vec![
                        CronValue::Step(7),
                        CronValue::Number(8),
                        CronValue::Range(30, 35)
                    ],
                    hours: vec![CronValue::Any],
                    days: vec![CronValue::Number(3), CronValue::Step(4)],
                    months: vec![CronValue::Any],
                    dows: vec![CronValue::Any, CronValue::Number(4)],
                }
            )),
            cron_timer("*/7,8,30-35 * 3,*/4 * *,4"),
        );
    }

    #[test]
    fn rejects_out_of_bound_values() {
        assert!(cron_timer("60 * * * *").is_err());
        assert!(cron_timer("* 24 * * *").is_err());
        assert!(cron_timer("* * 0 * *").is_err());
        assert!(cron_timer("* * * 13 *").is_err());
        assert!(cron_timer("* * * * 7").is_err());
    }

    #[test]
    fn rejects_inverted_ranges() {
        assert!(cron_timer("30-8 * * * *").is_err());
    }

    #[test]
    fn rejects_zero_steps() {
        assert!(cron_timer("*/0 * * * *").is_err());
        // In the last field the bad step survives as trailing input, which
        // the public entry point refuses
        assert!(crate::parse_cron("* * * * */0").is_err());
        assert!(crate::parse_cron("0 0 */0 * *").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(cron_timer("*/7! * * * *").is_err());
        assert!(cron_timer("not a cron").is_err());
    }
}
