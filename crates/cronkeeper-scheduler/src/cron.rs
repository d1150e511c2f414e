//! 5-field cron evaluation in civil time.
//!
//! Fields: minute, hour, day-of-month, month, day-of-week. Each accepts `*`,
//! single values, `a-b` ranges, comma lists and `/step` on any of those.
//! Months and weekdays also accept three-letter names, weekday `7` is Sunday,
//! and the usual `@hourly` / `@daily` / ... macros expand to their 5-field
//! form. When both day fields are restricted a day matches if *either* does.
//!
//! Occurrences are searched minute by minute in the wall clock of the
//! reference's time zone. Wall-clock times that fall into a DST gap resolve to
//! the first valid instant after the gap; times repeated by a DST fold resolve
//! to their earliest instant that is still after the reference.

use chrono::{
    DateTime, Datelike, Duration, Local, LocalResult, NaiveDate, NaiveDateTime, TimeZone,
    Timelike, Utc,
};

use crate::error::{Result, SchedulerError};

/// Beyond this many days without a match the expression is treated as never firing.
/// Covers leap-day schedules across a skipped leap year (2096 → 2104).
const SEARCH_HORIZON_DAYS: i64 = 366 * 10;

/// Longest DST gap we step across when resolving a nonexistent wall-clock time.
const MAX_GAP_MINUTES: i64 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    /// Day-of-month field was written starting with `*`.
    dom_any: bool,
    /// Day-of-week field was written starting with `*`.
    dow_any: bool,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value of the first entry in `names`.
    first_name: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    first_name: 0,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    first_name: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    first_name: 0,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ],
    first_name: 1,
};
// 7 is accepted and folded onto 0 after parsing.
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["sun", "mon", "tue", "wed", "thu", "fri", "sat"],
    first_name: 0,
};

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let expanded = match expr.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            m if m.starts_with('@') => {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "unsupported macro: {expr}"
                )))
            }
            _ => expr,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::InvalidSchedule(format!(
                "expected 5 fields, got {}: '{expr}'",
                fields.len()
            )));
        }

        let mut days_of_week = parse_field(fields[4], &DAY_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            minutes: parse_field(fields[0], &MINUTE)?,
            hours: parse_field(fields[1], &HOUR)?,
            days_of_month: parse_field(fields[2], &DAY_OF_MONTH)?,
            months: parse_field(fields[3], &MONTH)?,
            days_of_week,
            dom_any: fields[2].starts_with('*'),
            dow_any: fields[4].starts_with('*'),
        })
    }

    /// First occurrence strictly after `reference`, in the reference's zone.
    ///
    /// `None` when nothing matches within the search horizon.
    pub fn next_after<Tz: TimeZone>(&self, reference: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = reference.timezone();
        let start = truncate_to_minute(reference.naive_local())? + Duration::minutes(1);
        let last_day = start.date() + Duration::days(SEARCH_HORIZON_DAYS);

        let mut date = start.date();
        while date <= last_day {
            if !bit(self.months, date.month()) {
                date = first_of_next_month(date)?;
                continue;
            }
            if self.day_matches(date) {
                for hour in (0..24).filter(|h| bit(self.hours, *h)) {
                    for minute in (0..60).filter(|m| bit(self.minutes, *m)) {
                        let naive = date.and_hms_opt(hour, minute, 0)?;
                        if naive < start {
                            continue;
                        }
                        let found = resolve_local(|n| tz.from_local_datetime(n), naive, reference);
                        if found.is_some() {
                            return found;
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_any || self.dow_any {
            dom && dow
        } else {
            dom || dow
        }
    }
}

fn bit(mask: u64, n: u32) -> bool {
    mask & (1u64 << n) != 0
}

fn truncate_to_minute(t: NaiveDateTime) -> Option<NaiveDateTime> {
    t.with_second(0)?.with_nanosecond(0)
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

/// Map a wall-clock candidate to an instant after `reference`.
///
/// `lookup` is the zone's local-to-instant mapping. A nonexistent time (gap)
/// steps forward to the first valid minute; an ambiguous time (fold) prefers
/// the earlier instant.
fn resolve_local<Tz, F>(
    lookup: F,
    naive: NaiveDateTime,
    reference: &DateTime<Tz>,
) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    F: Fn(&NaiveDateTime) -> LocalResult<DateTime<Tz>>,
{
    let mut candidate = naive;
    for _ in 0..=MAX_GAP_MINUTES {
        match lookup(&candidate) {
            LocalResult::Single(dt) => return (dt > *reference).then_some(dt),
            LocalResult::Ambiguous(earliest, latest) => {
                if earliest > *reference {
                    return Some(earliest);
                }
                return (latest > *reference).then_some(latest);
            }
            LocalResult::None => candidate += Duration::minutes(1),
        }
    }
    None
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<u64> {
    let mut mask = 0u64;
    for part in field.split(',') {
        mask |= parse_part(part, spec)?;
    }
    Ok(mask)
}

fn parse_part(part: &str, spec: &FieldSpec) -> Result<u64> {
    let invalid = |why: String| SchedulerError::InvalidSchedule(format!("{} field: {why}", spec.name));

    if part.is_empty() {
        return Err(invalid("empty list item".into()));
    }

    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step
                .parse()
                .map_err(|_| invalid(format!("invalid step '{step}'")))?;
            if step == 0 {
                return Err(invalid("step must be positive".into()));
            }
            if step > spec.max - spec.min + 1 {
                return Err(invalid(format!(
                    "step {step} exceeds range {}-{}",
                    spec.min, spec.max
                )));
            }
            (range, Some(step))
        }
        None => (part, None),
    };

    let (lo, hi) = if range == "*" {
        (spec.min, spec.max)
    } else if let Some((a, b)) = range.split_once('-') {
        let lo = parse_value(a, spec)?;
        let hi = parse_value(b, spec)?;
        if lo > hi {
            return Err(invalid(format!("range {lo}-{hi} is reversed")));
        }
        (lo, hi)
    } else {
        let v = parse_value(range, spec)?;
        // `a/n` means from a to the field maximum, every n
        (v, if step.is_some() { spec.max } else { v })
    };

    let step = step.unwrap_or(1);
    let mut mask = 0u64;
    let mut v = lo;
    while v <= hi {
        mask |= 1u64 << v;
        match v.checked_add(step) {
            Some(next) => v = next,
            None => break,
        }
    }
    Ok(mask)
}

fn parse_value(token: &str, spec: &FieldSpec) -> Result<u32> {
    let lower = token.to_ascii_lowercase();
    if let Some(idx) = spec.names.iter().position(|n| *n == lower) {
        return Ok(idx as u32 + spec.first_name);
    }
    let v: u32 = token.parse().map_err(|_| {
        SchedulerError::InvalidSchedule(format!("{} field: invalid value '{token}'", spec.name))
    })?;
    if v < spec.min || v > spec.max {
        return Err(SchedulerError::InvalidSchedule(format!(
            "{} value {v} out of range {}-{}",
            spec.name, spec.min, spec.max
        )));
    }
    Ok(v)
}

/// Next occurrence of `schedule` after `reference`, evaluated in the host's
/// local time zone.
pub fn next_after(schedule: &str, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let expr = CronExpr::parse(schedule)?;
    expr.next_after(&reference.with_timezone(&Local))
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| SchedulerError::InvalidSchedule(format!("'{schedule}' never fires")))
}

/// Parse `schedule` and check that it fires at least once from now on.
pub fn validate(schedule: &str) -> Result<()> {
    next_after(schedule, Utc::now()).map(|_| ())
}

/// Short English rendering for the common shapes; anything else is echoed.
pub fn describe(schedule: &str) -> String {
    let trimmed = schedule.trim();
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.as_slice() {
        ["*", "*", "*", "*", "*"] => "Every minute".to_string(),
        ["0", "*", "*", "*", "*"] => "Every hour on the hour".to_string(),
        ["0", "0", "*", "*", "*"] => "Daily at midnight".to_string(),
        [m, h, "*", "*", "*"] => match (m.parse::<u32>(), h.parse::<u32>()) {
            (Ok(m), Ok(h)) if m < 60 && h < 24 => format!("Daily at {h:02}:{m:02}"),
            _ => trimmed.to_string(),
        },
        _ => match trimmed.to_ascii_lowercase().as_str() {
            "@hourly" => "Every hour on the hour".to_string(),
            "@daily" | "@midnight" => "Daily at midnight".to_string(),
            _ => trimmed.to_string(),
        },
    }
}
