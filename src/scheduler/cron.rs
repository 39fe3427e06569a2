//! Six-field cron evaluation.
//!
//! Fields are `second minute hour day-of-month month day-of-week`. Each field
//! accepts `*`, a value, a comma list, a range `a-b` and a step (`*/n`, `a/n`,
//! `a-b/n`). Whitespace inside a field is ignored. Months and weekdays also
//! take three-letter names; weekday `7` is Sunday like `0`.
//!
//! Unlike POSIX cron, day-of-month and day-of-week are both required to match.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use thiserror::Error;

use crate::state::CronSchedule;

/// How far ahead to look before declaring a schedule unsatisfiable
const SEARCH_YEARS: i32 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("{field} field is empty")]
    EmptyField { field: &'static str },

    #[error("invalid value '{value}' in {field} field")]
    InvalidValue { field: &'static str, value: String },

    #[error("value {value} out of range {min}-{max} in {field} field")]
    OutOfRange { field: &'static str, value: u32, min: u32, max: u32 },

    #[error("invalid range '{expr}' in {field} field")]
    InvalidRange { field: &'static str, expr: String },

    #[error("invalid step '{expr}' in {field} field")]
    InvalidStep { field: &'static str, expr: String },

    #[error("schedule has no fire time within 50 years")]
    Unsatisfiable,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    name_base: u32,
}

const SECOND: FieldSpec = FieldSpec { name: "second", min: 0, max: 59, names: &[], name_base: 0 };
const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], name_base: 0 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], name_base: 0 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "dayOfMonth", min: 1, max: 31, names: &[], name_base: 0 };
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &["jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec"],
    name_base: 1,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "dayOfWeek",
    min: 0,
    max: 7,
    names: &["sun", "mon", "tue", "wed", "thu", "fri", "sat"],
    name_base: 0,
};

/// Bitset of allowed values for one field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn insert(&mut self, value: u32) {
        self.0 |= 1 << value;
    }

    fn remove(&mut self, value: u32) {
        self.0 &= !(1 << value);
    }

    fn contains(self, value: u32) -> bool {
        self.0 & (1 << value) != 0
    }
}

/// A parsed schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl CronExpression {
    pub fn parse(schedule: &CronSchedule) -> Result<Self, CronError> {
        Self::from_fields(schedule.fields())
    }

    pub fn from_fields(fields: [&str; 6]) -> Result<Self, CronError> {
        let mut days_of_week = parse_field(fields[5], &DAY_OF_WEEK)?;
        if days_of_week.contains(7) {
            days_of_week.remove(7);
            days_of_week.insert(0);
        }

        Ok(Self {
            seconds: parse_field(fields[0], &SECOND)?,
            minutes: parse_field(fields[1], &MINUTE)?,
            hours: parse_field(fields[2], &HOUR)?,
            days_of_month: parse_field(fields[3], &DAY_OF_MONTH)?,
            months: parse_field(fields[4], &MONTH)?,
            days_of_week,
        })
    }

    /// Whether a wall-clock time satisfies every field
    pub fn matches(&self, t: &NaiveDateTime) -> bool {
        self.months.contains(t.month())
            && self.days_of_month.contains(t.day())
            && self.days_of_week.contains(t.weekday().num_days_from_sunday())
            && self.hours.contains(t.hour())
            && self.minutes.contains(t.minute())
            && self.seconds.contains(t.second())
    }

    /// Earliest matching instant strictly after `reference`, in its time zone.
    ///
    /// Wall-clock times skipped by a DST jump never match; repeated ones match
    /// their first occurrence.
    pub fn next_after<Tz: TimeZone>(&self, reference: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = reference.timezone();
        let mut t = reference.naive_local().with_nanosecond(0)? + Duration::seconds(1);
        let limit_year = t.year() + SEARCH_YEARS;

        while t.year() <= limit_year {
            if !self.months.contains(t.month()) {
                t = start_of_next_month(&t)?;
                continue;
            }
            if !self.days_of_month.contains(t.day())
                || !self.days_of_week.contains(t.weekday().num_days_from_sunday())
            {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1);
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t += Duration::seconds(1);
                continue;
            }

            match tz.from_local_datetime(&t).earliest() {
                Some(candidate) if candidate > *reference => return Some(candidate),
                _ => t += Duration::seconds(1),
            }
        }

        None
    }
}

/// Next time `schedule` fires strictly after `reference`.
pub fn next_fire_time<Tz: TimeZone>(
    schedule: &CronSchedule,
    reference: &DateTime<Tz>,
) -> Result<DateTime<Tz>, CronError> {
    CronExpression::parse(schedule)?
        .next_after(reference)
        .ok_or(CronError::Unsatisfiable)
}

fn start_of_next_month(t: &NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_field(raw: &str, field: &FieldSpec) -> Result<FieldSet, CronError> {
    let expr: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if expr.is_empty() {
        return Err(CronError::EmptyField { field: field.name });
    }

    let mut set = FieldSet::default();
    for part in expr.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(parse_step(step, part, field)?)),
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (field.min, field.max)
        } else if let Some((low, high)) = range.split_once('-') {
            let (low, high) = (parse_value(low, field)?, parse_value(high, field)?);
            if low > high {
                return Err(CronError::InvalidRange { field: field.name, expr: part.to_string() });
            }
            (low, high)
        } else {
            let value = parse_value(range, field)?;
            // `a/n` runs from a to the end of the field
            if step.is_some() { (value, field.max) } else { (value, value) }
        };

        for value in (start..=end).step_by(step.unwrap_or(1) as usize) {
            set.insert(value);
        }
    }

    Ok(set)
}

fn parse_step(step: &str, part: &str, field: &FieldSpec) -> Result<u32, CronError> {
    match step.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(CronError::InvalidStep { field: field.name, expr: part.to_string() }),
    }
}

fn parse_value(token: &str, field: &FieldSpec) -> Result<u32, CronError> {
    if !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()) {
        let value = token.parse::<u32>().map_err(|_| CronError::InvalidValue {
            field: field.name,
            value: token.to_string(),
        })?;
        if value < field.min || value > field.max {
            return Err(CronError::OutOfRange { field: field.name, value, min: field.min, max: field.max });
        }
        return Ok(value);
    }

    let lower = token.to_ascii_lowercase();
    field.names
        .iter()
        .position(|name| *name == lower)
        .map(|index| index as u32 + field.name_base)
        .ok_or_else(|| CronError::InvalidValue { field: field.name, value: token.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, LocalResult, NaiveDate, Utc};

    /// Central European rules for 2024: UTC+1, UTC+2 between the last
    /// Sundays of March and October (switching at 01:00 UTC).
    #[derive(Debug, Clone, Copy)]
    struct CentralEurope2024;

    impl CentralEurope2024 {
        fn offset_at(utc: &NaiveDateTime) -> FixedOffset {
            let summer_start = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap().and_hms_opt(1, 0, 0).unwrap();
            let summer_end = NaiveDate::from_ymd_opt(2024, 10, 27).unwrap().and_hms_opt(1, 0, 0).unwrap();
            let hours = if *utc >= summer_start && *utc < summer_end { 2 } else { 1 };
            FixedOffset::east_opt(hours * 3600).unwrap()
        }
    }

    impl TimeZone for CentralEurope2024 {
        type Offset = FixedOffset;

        fn from_offset(_: &FixedOffset) -> Self {
            CentralEurope2024
        }

        fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<FixedOffset> {
            self.offset_from_local_datetime(&local.and_hms_opt(0, 0, 0).unwrap())
        }

        fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
            // Summer offset first so an ambiguous time lists its earlier instant first
            let valid: Vec<FixedOffset> = [2, 1]
                .into_iter()
                .map(|hours| FixedOffset::east_opt(hours * 3600).unwrap())
                .filter(|offset| {
                    let utc = *local - Duration::seconds(offset.local_minus_utc() as i64);
                    Self::offset_at(&utc) == *offset
                })
                .collect();

            match valid.as_slice() {
                [] => LocalResult::None,
                [single] => LocalResult::Single(*single),
                [earlier, later, ..] => LocalResult::Ambiguous(*earlier, *later),
            }
        }

        fn offset_from_utc_date(&self, utc: &NaiveDate) -> FixedOffset {
            Self::offset_at(&utc.and_hms_opt(0, 0, 0).unwrap())
        }

        fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
            Self::offset_at(utc)
        }
    }

    fn schedule(expr: &str) -> CronSchedule {
        let f: Vec<&str> = expr.split(' ').collect();
        CronSchedule {
            second: f[0].to_string(),
            minute: f[1].to_string(),
            hour: f[2].to_string(),
            day_of_month: f[3].to_string(),
            month: f[4].to_string(),
            day_of_week: f[5].to_string(),
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn next(expr: &str, reference: DateTime<Utc>) -> DateTime<Utc> {
        next_fire_time(&schedule(expr), &reference).unwrap()
    }

    #[test]
    fn test_every_five_minutes() {
        assert_eq!(next("0 */5 * * * *", at(2024, 5, 10, 12, 2, 0)), at(2024, 5, 10, 12, 5, 0));
    }

    #[test]
    fn test_result_is_strictly_after_reference() {
        assert_eq!(next("0 */5 * * * *", at(2024, 5, 10, 12, 5, 0)), at(2024, 5, 10, 12, 10, 0));
    }

    #[test]
    fn test_subsecond_reference() {
        let reference = at(2024, 5, 10, 12, 4, 59) + Duration::milliseconds(500);
        assert_eq!(next("0 */5 * * * *", reference), at(2024, 5, 10, 12, 5, 0));

        let reference = at(2024, 5, 10, 12, 5, 0) + Duration::milliseconds(1);
        assert_eq!(next("0 */5 * * * *", reference), at(2024, 5, 10, 12, 10, 0));
    }

    #[test]
    fn test_default_schedule_is_every_minute() {
        let reference = at(2024, 5, 10, 23, 59, 30);
        assert_eq!(next_fire_time(&CronSchedule::default(), &reference).unwrap(), at(2024, 5, 11, 0, 0, 0));
    }

    #[test]
    fn test_weekday_business_hours() {
        // 2024-05-11 is a Saturday
        assert_eq!(next("0 0 9-17 * * 1-5", at(2024, 5, 11, 10, 0, 0)), at(2024, 5, 13, 9, 0, 0));
        assert_eq!(next("0 0 9-17 * * 1-5", at(2024, 5, 13, 17, 0, 0)), at(2024, 5, 14, 9, 0, 0));
    }

    #[test]
    fn test_day_of_month_and_weekday_are_anded() {
        // Friday the 13th
        assert_eq!(next("0 0 0 13 * 5", at(2024, 1, 1, 0, 0, 0)), at(2024, 9, 13, 0, 0, 0));
    }

    #[test]
    fn test_whitespace_inside_fields_ignored() {
        let s = CronSchedule {
            second: " 0 ".to_string(),
            minute: "1, 31".to_string(),
            hour: " * ".to_string(),
            ..CronSchedule::default()
        };
        assert_eq!(next_fire_time(&s, &at(2024, 5, 10, 12, 2, 0)).unwrap(), at(2024, 5, 10, 12, 31, 0));
    }

    #[test]
    fn test_year_rollover() {
        assert_eq!(next("0 0 0 1 1 *", at(2024, 6, 15, 8, 0, 0)), at(2025, 1, 1, 0, 0, 0));
    }

    #[test]
    fn test_leap_day() {
        assert_eq!(next("0 0 0 29 2 *", at(2024, 3, 1, 0, 0, 0)), at(2028, 2, 29, 0, 0, 0));
    }

    #[test]
    fn test_sunday_as_seven() {
        // 2024-01-01 is a Monday
        assert_eq!(next("0 0 0 * * 7", at(2024, 1, 1, 0, 0, 0)), at(2024, 1, 7, 0, 0, 0));
        assert_eq!(next("0 0 0 * * 0", at(2024, 1, 1, 0, 0, 0)), at(2024, 1, 7, 0, 0, 0));
    }

    #[test]
    fn test_names() {
        assert_eq!(next("0 30 6 * jun MON", at(2024, 1, 1, 0, 0, 0)), at(2024, 6, 3, 6, 30, 0));
    }

    #[test]
    fn test_step_from_value_and_range() {
        assert_eq!(next("0 10/20 * * * *", at(2024, 5, 10, 12, 31, 0)), at(2024, 5, 10, 12, 50, 0));
        assert_eq!(next("0 0 1-10/3 * * *", at(2024, 5, 10, 5, 0, 0)), at(2024, 5, 10, 7, 0, 0));
    }

    #[test]
    fn test_keeps_reference_time_zone() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let reference = tz.with_ymd_and_hms(2024, 5, 10, 10, 0, 0).unwrap();

        let fired = next_fire_time(&schedule("0 0 9 * * *"), &reference).unwrap();
        assert_eq!(fired, tz.with_ymd_and_hms(2024, 5, 11, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_time_skipped_by_dst_never_matches() {
        let zone = CentralEurope2024;
        let reference = zone.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap();

        // 02:30 does not exist on 31 March
        let fired = next_fire_time(&schedule("0 30 2 * * *"), &reference).unwrap();
        assert_eq!(fired, zone.with_ymd_and_hms(2024, 4, 1, 2, 30, 0).unwrap());
        assert_eq!(fired.with_timezone(&Utc), at(2024, 4, 1, 0, 30, 0));
    }

    #[test]
    fn test_time_repeated_by_dst_matches_first_occurrence() {
        let zone = CentralEurope2024;
        let reference = zone.with_ymd_and_hms(2024, 10, 27, 0, 0, 0).unwrap();

        let fired = next_fire_time(&schedule("0 30 2 * * *"), &reference).unwrap();
        assert_eq!(fired.with_timezone(&Utc), at(2024, 10, 27, 0, 30, 0));

        // The second 02:30 that night is not another fire time
        let after = next_fire_time(&schedule("0 30 2 * * *"), &fired).unwrap();
        assert_eq!(after.with_timezone(&Utc), at(2024, 10, 28, 1, 30, 0));
    }

    #[test]
    fn test_huge_step_keeps_only_start() {
        let reference = at(2024, 5, 10, 12, 0, 0);

        assert_eq!(next("59/4294967295 * * * * *", reference), at(2024, 5, 10, 12, 0, 59));
        assert_eq!(next("59/4294967295 * * * * *", at(2024, 5, 10, 12, 0, 59)), at(2024, 5, 10, 12, 1, 59));
        assert_eq!(next("0 */4294967295 * * * *", reference), at(2024, 5, 10, 13, 0, 0));
    }

    #[test]
    fn test_result_is_minimal() {
        let cases = [
            "0 */5 * * * *",
            "*/7 * * * * *",
            "30 15,45 * * * *",
            "0 0 */6 * * *",
            "0 1-3 * * * 2-4",
        ];
        let references = [
            at(2024, 5, 10, 12, 2, 0),
            at(2024, 5, 10, 23, 59, 59),
            at(2024, 12, 31, 23, 58, 1),
        ];

        for expr in cases {
            let parsed = CronExpression::parse(&schedule(expr)).unwrap();
            for reference in references {
                let fired = parsed.next_after(&reference).unwrap();
                assert!(fired > reference, "{} from {}", expr, reference);
                assert!(parsed.matches(&fired.naive_utc()), "{} fired on non-match {}", expr, fired);

                let mut t = reference + Duration::seconds(1);
                while t < fired {
                    assert!(!parsed.matches(&t.naive_utc()), "{} skipped earlier match {}", expr, t);
                    t += Duration::seconds(1);
                }
            }
        }
    }

    #[test]
    fn test_malformed_expressions() {
        let reference = at(2024, 5, 10, 12, 0, 0);
        let err = |expr: &str| next_fire_time(&schedule(expr), &reference).unwrap_err();

        assert!(matches!(err("abc * * * * *"), CronError::InvalidValue { field: "second", .. }));
        assert!(matches!(err("61 * * * * *"), CronError::OutOfRange { value: 61, .. }));
        assert!(matches!(err("0 */0 * * * *"), CronError::InvalidStep { field: "minute", .. }));
        assert!(matches!(err("0 0 5-2 * * *"), CronError::InvalidRange { field: "hour", .. }));
        assert!(matches!(err("0 0 0 0 * *"), CronError::OutOfRange { field: "dayOfMonth", .. }));
        assert!(matches!(err("0 0 0 * 13 *"), CronError::OutOfRange { field: "month", .. }));
        assert!(matches!(err("0 1,,2 * * * *"), CronError::InvalidValue { field: "minute", .. }));

        let empty = CronSchedule { hour: "  ".to_string(), ..CronSchedule::default() };
        assert_eq!(next_fire_time(&empty, &reference).unwrap_err(), CronError::EmptyField { field: "hour" });
    }

    #[test]
    fn test_impossible_date_is_unsatisfiable() {
        assert_eq!(
            next_fire_time(&schedule("0 0 0 30 2 *"), &at(2024, 1, 1, 0, 0, 0)).unwrap_err(),
            CronError::Unsatisfiable,
        );
    }
}
