//! Five-field cron evaluation.
//!
//! Supports `*`, lists, ranges and steps in every field, plus three-letter
//! month and weekday names. Day-of-month and day-of-week are OR-combined when
//! both are restricted, matching Vixie cron. Evaluation is pure and works on
//! naive local times: the caller decides which timezone the schedule lives in.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc,
};

use crate::ScheduleError;

/// How many years ahead the evaluator searches before giving up.
///
/// Eight years covers `29 2 *` across a skipped leap year (e.g. 2100).
const SEARCH_HORIZON_YEARS: i32 = 8;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Which cron field is being parsed; carries its legal range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl FieldKind {
    fn name(self) -> &'static str {
        match self {
            FieldKind::Minute => "minute",
            FieldKind::Hour => "hour",
            FieldKind::DayOfMonth => "day-of-month",
            FieldKind::Month => "month",
            FieldKind::DayOfWeek => "day-of-week",
        }
    }

    fn bounds(self) -> (u32, u32) {
        match self {
            FieldKind::Minute => (0, 59),
            FieldKind::Hour => (0, 23),
            FieldKind::DayOfMonth => (1, 31),
            FieldKind::Month => (1, 12),
            // 7 is accepted as an alias for Sunday and folded onto 0.
            FieldKind::DayOfWeek => (0, 7),
        }
    }

    fn names(self) -> &'static [&'static str] {
        match self {
            FieldKind::Month => &MONTH_NAMES,
            FieldKind::DayOfWeek => &WEEKDAY_NAMES,
            _ => &[],
        }
    }
}

/// Set of allowed values for one field, stored as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && (self.0 >> value) & 1 == 1
    }

    fn insert(&mut self, value: u32) {
        self.0 |= 1 << value;
    }
}

/// A parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    day_of_month_restricted: bool,
    day_of_week_restricted: bool,
}

impl CronSchedule {
    /// Parse a five-field cron expression.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }

        let mut days_of_week = parse_field(fields[4], FieldKind::DayOfWeek)?;
        if days_of_week.contains(7) {
            days_of_week.insert(0);
        }

        Ok(Self {
            expression: fields.join(" "),
            minutes: parse_field(fields[0], FieldKind::Minute)?,
            hours: parse_field(fields[1], FieldKind::Hour)?,
            days_of_month: parse_field(fields[2], FieldKind::DayOfMonth)?,
            months: parse_field(fields[3], FieldKind::Month)?,
            days_of_week,
            day_of_month_restricted: !fields[2].starts_with('*'),
            day_of_week_restricted: !fields[4].starts_with('*'),
        })
    }

    /// The expression in canonical single-space form.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First matching minute strictly after `after`.
    ///
    /// Seconds and sub-seconds of `after` are discarded, so the result is
    /// always on a whole minute.
    pub fn next_after(&self, after: NaiveDateTime) -> Result<NaiveDateTime, ScheduleError> {
        let floor = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after);
        let mut candidate = floor + Duration::minutes(1);
        let horizon = after.year() + SEARCH_HORIZON_YEARS;

        while candidate.year() <= horizon {
            if !self.months.contains(candidate.month()) {
                candidate = start_of_next_month(candidate.date());
                continue;
            }
            if !self.matches_day(candidate.date()) {
                candidate = start_of_day(candidate.date() + Duration::days(1));
                continue;
            }
            if !self.hours.contains(candidate.hour()) {
                candidate = candidate
                    .with_minute(0)
                    .map(|t| t + Duration::hours(1))
                    .unwrap_or(candidate + Duration::minutes(1));
                continue;
            }
            if !self.minutes.contains(candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Ok(candidate);
        }

        Err(ScheduleError::NoOccurrence(self.expression.clone()))
    }

    /// Next fire instant after `after`, evaluating the schedule in the
    /// timezone given by `offset`.
    pub fn next_fire_at(
        &self,
        after: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let local = after.with_timezone(&offset).naive_local();
        let next = self.next_after(local)?;
        offset
            .from_local_datetime(&next)
            .single()
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| ScheduleError::NoOccurrence(self.expression.clone()))
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (self.day_of_month_restricted, self.day_of_week_restricted) {
            (true, true) => dom || dow,
            _ => dom && dow,
        }
    }
}

impl FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Compute the next occurrence of `expression` strictly after `after`.
pub fn next_occurrence(
    expression: &str,
    after: NaiveDateTime,
) -> Result<NaiveDateTime, ScheduleError> {
    CronSchedule::parse(expression)?.next_after(after)
}

fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

fn start_of_next_month(date: NaiveDate) -> NaiveDateTime {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    // Day 1 of a valid month always exists.
    NaiveDate::from_ymd_opt(year, month, 1)
        .map(start_of_day)
        .unwrap_or_else(|| start_of_day(date + Duration::days(31)))
}

fn parse_field(text: &str, kind: FieldKind) -> Result<FieldSet, ScheduleError> {
    let invalid = |reason: String| ScheduleError::InvalidField {
        field: kind.name(),
        value: text.to_string(),
        reason,
    };

    let (min, max) = kind.bounds();
    let mut set = FieldSet(0);

    for item in text.split(',') {
        if item.is_empty() {
            return Err(invalid("empty list item".to_string()));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("step '{}' is not a number", step)))?;
                if step == 0 {
                    return Err(invalid("step must be at least 1".to_string()));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_value(lo, kind)?, parse_value(hi, kind)?)
        } else {
            let value = parse_value(range, kind)?;
            // `N/step` runs from N to the end of the field.
            (value, if step.is_some() { max } else { value })
        };

        if start < min || end > max {
            return Err(invalid(format!("values must be within {}-{}", min, max)));
        }
        if start > end {
            return Err(invalid(format!("range {}-{} is reversed", start, end)));
        }

        let step = step.unwrap_or(1) as usize;
        for value in (start..=end).step_by(step) {
            set.insert(value);
        }
    }

    Ok(set)
}

fn parse_value(text: &str, kind: FieldKind) -> Result<u32, ScheduleError> {
    if let Ok(value) = text.parse::<u32>() {
        return Ok(value);
    }

    let lower = text.to_ascii_lowercase();
    let offset = if kind == FieldKind::Month { 1 } else { 0 };
    kind.names()
        .iter()
        .position(|name| *name == lower)
        .map(|index| index as u32 + offset)
        .ok_or_else(|| ScheduleError::InvalidField {
            field: kind.name(),
            value: text.to_string(),
            reason: "not a number or known name".to_string(),
        })
}
