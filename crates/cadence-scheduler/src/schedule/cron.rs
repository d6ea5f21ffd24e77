use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc,
};
use chrono_tz::Tz;
use cron::TimeUnitSpec;
use serde::{Deserialize, Serialize};

use super::{FireWindow, GIVE_UP_YEARS};
use crate::error::{Result, SchedulerError};

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Set of allowed values for one field, as a bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CronField {
    bits: u64,
    /// `*` or `?`: matters for the day-of-month / day-of-week OR rule.
    unrestricted: bool,
}

impl CronField {
    /// Values in `lo..=hi` that `spec` includes.
    fn from_spec(spec: &impl TimeUnitSpec, lo: u32, hi: u32, unrestricted: bool) -> Self {
        let bits = (lo..=hi)
            .filter(|&v| spec.includes(v))
            .fold(0u64, |bits, v| bits | 1 << v);
        Self { bits, unrestricted }
    }

    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }
}

/// A parsed cron pattern.
///
/// Five fields (`minute hour day-of-month month day-of-week`) or six with a
/// leading seconds field. Day-of-week counts from Sunday as 0 (7 is Sunday
/// too). When both day fields are restricted a day matches if either of
/// them does.
///
/// Field syntax is parsed by the `cron` crate; the day rules and the bounded
/// searches are evaluated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpression {
    source: String,
    seconds: CronField,
    minutes: CronField,
    hours: CronField,
    days_of_month: CronField,
    months: CronField,
    days_of_week: CronField,
    /// `L` in the day-of-month field.
    last_day_of_month: bool,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |msg: String| {
            SchedulerError::InvalidSchedule(format!("cron expression '{expression}': {msg}"))
        };
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let (sec, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => return Err(invalid(format!("has {n} fields, expected 5 or 6"))),
        };
        let (minute, hour, dom, month, dow) = (rest[0], rest[1], rest[2], rest[3], rest[4]);
        if [sec, minute, hour, month].contains(&"?") {
            return Err(invalid("'?' is only allowed in the day fields".into()));
        }

        let (dom_source, last_day_of_month) = strip_last_day(dom);
        let dom_unrestricted = matches!(dom_source, "*" | "?");
        let dow_unrestricted = matches!(dow, "*" | "?");
        let dom = match dom_source {
            "" | "*" | "?" => "*".to_string(),
            other => numeric_field(other, &[], 0).map_err(invalid)?,
        };
        let month = numeric_field(month, &MONTH_NAMES, 1).map_err(invalid)?;
        // Day-of-week goes through the crate's seconds field: the crate counts
        // days from Sunday as 1 and cannot take both 0 and 7 for Sunday.
        let dow = match dow {
            "*" | "?" => "0-7".to_string(),
            other => numeric_field(&other.replace('*', "0-7"), &DAY_NAMES, 0).map_err(invalid)?,
        };
        let sec = numeric_field(sec, &[], 0).map_err(invalid)?;
        let minute = numeric_field(minute, &[], 0).map_err(invalid)?;
        let hour = numeric_field(hour, &[], 0).map_err(invalid)?;

        let parse = |source: String| {
            cron::Schedule::from_str(&source).map_err(|e| invalid(e.to_string()))
        };
        let fields = parse(format!("{sec} {minute} {hour} {dom} {month} *"))?;
        let weekdays = parse(format!("{dow} * * * * *"))?;
        if (8..60).any(|v| weekdays.seconds().includes(v)) {
            return Err(invalid(format!("day-of-week '{}' is outside 0-7", rest[4])));
        }
        let mut days_of_week = CronField::from_spec(weekdays.seconds(), 0, 7, dow_unrestricted);
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1 << 7)) | 1;
        }
        let days_of_month = if dom_source.is_empty() {
            CronField {
                bits: 0,
                unrestricted: false,
            }
        } else {
            CronField::from_spec(fields.days_of_month(), 1, 31, dom_unrestricted)
        };

        Ok(Self {
            source: expression.trim().to_string(),
            seconds: CronField::from_spec(fields.seconds(), 0, 59, false),
            minutes: CronField::from_spec(fields.minutes(), 0, 59, false),
            hours: CronField::from_spec(fields.hours(), 0, 23, false),
            days_of_month,
            months: CronField::from_spec(fields.months(), 1, 12, false),
            days_of_week,
            last_day_of_month,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day())
            || (self.last_day_of_month && date.succ_opt().map_or(true, |d| d.day() == 1));
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (
            self.days_of_month.unrestricted,
            self.days_of_week.unrestricted,
        ) {
            (true, true) => true,
            (false, true) => dom,
            (true, false) => dow,
            (false, false) => dom || dow,
        }
    }

    /// Earliest matching wall-clock second strictly after `after`.
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let give_up = after.year().saturating_add(GIVE_UP_YEARS);
        let mut t = after
            .with_nanosecond(0)?
            .checked_add_signed(Duration::seconds(1))?;
        loop {
            if t.year() > give_up {
                return None;
            }
            if !self.months.contains(t.month()) {
                t = first_of_next_month(t.date())?.and_time(NaiveTime::MIN);
                continue;
            }
            if !self.matches_day(t.date()) {
                t = t.date().succ_opt()?.and_time(NaiveTime::MIN);
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t
                    .date()
                    .and_hms_opt(t.hour(), 0, 0)?
                    .checked_add_signed(Duration::hours(1))?;
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = t
                    .date()
                    .and_hms_opt(t.hour(), t.minute(), 0)?
                    .checked_add_signed(Duration::minutes(1))?;
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t = t.checked_add_signed(Duration::seconds(1))?;
                continue;
            }
            return Some(t);
        }
    }

    /// Latest matching wall-clock second at or before `bound`.
    pub fn latest_at_or_before(&self, bound: NaiveDateTime) -> Option<NaiveDateTime> {
        let give_up = bound.year().saturating_sub(GIVE_UP_YEARS);
        let one = Duration::seconds(1);
        let mut t = bound.with_nanosecond(0)?;
        loop {
            if t.year() < give_up {
                return None;
            }
            if !self.months.contains(t.month()) {
                t = t
                    .date()
                    .with_day(1)?
                    .and_time(NaiveTime::MIN)
                    .checked_sub_signed(one)?;
                continue;
            }
            if !self.matches_day(t.date()) {
                t = t.date().and_time(NaiveTime::MIN).checked_sub_signed(one)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t
                    .date()
                    .and_hms_opt(t.hour(), 0, 0)?
                    .checked_sub_signed(one)?;
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = t
                    .date()
                    .and_hms_opt(t.hour(), t.minute(), 0)?
                    .checked_sub_signed(one)?;
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t = t.checked_sub_signed(one)?;
                continue;
            }
            return Some(t);
        }
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year().checked_add(1)?, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

/// Split an `L` item out of a day-of-month field.
fn strip_last_day(field: &str) -> (&str, bool) {
    let parts: Vec<&str> = field.split(',').collect();
    if !parts.iter().any(|p| p.eq_ignore_ascii_case("L")) {
        return (field, false);
    }
    if parts.len() == 1 {
        return ("", true);
    }
    // `L` must come last when combined with other days ("1,15,L").
    match field.rsplit_once(',') {
        Some((head, tail)) if tail.eq_ignore_ascii_case("L") => (head, true),
        _ => (field, false),
    }
}

/// Rewrite `field` with month or day names replaced by their numbers,
/// rejecting what the crate would accept differently: empty list items, zero
/// steps and reversed ranges.
fn numeric_field(
    field: &str,
    names: &[&str],
    first: u32,
) -> std::result::Result<String, String> {
    let value = |token: &str| -> std::result::Result<String, String> {
        if token == "*" || token.parse::<u32>().is_ok() {
            return Ok(token.to_string());
        }
        names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(token))
            .map(|pos| (pos as u32 + first).to_string())
            .ok_or_else(|| format!("invalid value '{token}'"))
    };
    let mut items = Vec::new();
    for item in field.split(',') {
        if item.is_empty() {
            return Err(format!("empty list item in '{field}'"));
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let range = match range.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (value(lo)?, value(hi)?);
                if lo.parse::<u32>().ok() > hi.parse::<u32>().ok() {
                    return Err(format!("range '{item}' is reversed"));
                }
                format!("{lo}-{hi}")
            }
            None => value(range)?,
        };
        items.push(match step {
            Some(step) if step.parse::<u32>().map_or(true, |s| s == 0) => {
                return Err(format!("invalid step '{step}' in '{item}'"));
            }
            Some(step) => format!("{range}/{step}"),
            None => range,
        });
    }
    Ok(items.join(","))
}

impl FromStr for CronExpression {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CronExpression {
    type Error = SchedulerError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<CronExpression> for String {
    fn from(expr: CronExpression) -> Self {
        expr.source
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// A cron pattern evaluated in a time zone.
///
/// Wall-clock times skipped by a DST change never match; repeated wall-clock
/// times match once per occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSchedule {
    pub expression: CronExpression,
    #[serde(default = "default_time_zone")]
    pub time_zone: Tz,
}

fn default_time_zone() -> Tz {
    chrono_tz::UTC
}

impl CronSchedule {
    pub fn new(expression: &str, time_zone: Tz) -> Result<Self> {
        Ok(Self {
            expression: CronExpression::parse(expression)?,
            time_zone,
        })
    }

    pub fn utc(expression: &str) -> Result<Self> {
        Self::new(expression, chrono_tz::UTC)
    }

    pub(crate) fn fire_time_after(
        &self,
        after: DateTime<Utc>,
        window: &FireWindow,
    ) -> Option<DateTime<Utc>> {
        let reference = if after < window.start {
            window.start - Duration::milliseconds(1)
        } else {
            after
        };
        let tz = &self.time_zone;
        let mut cursor = reference.with_timezone(tz).naive_local();
        // The cursor strictly advances and next_after is bounded, so this ends.
        loop {
            let local = self.expression.next_after(cursor)?;
            let candidate = match tz.from_local_datetime(&local) {
                LocalResult::Single(t) => Some(t),
                LocalResult::Ambiguous(first, second) => {
                    if first.with_timezone(&Utc) > reference {
                        Some(first)
                    } else {
                        Some(second)
                    }
                }
                LocalResult::None => None,
            };
            if let Some(t) = candidate.map(|t| t.with_timezone(&Utc)) {
                if t > reference {
                    return Some(t);
                }
            }
            cursor = local;
        }
    }

    pub(crate) fn fire_time_before(
        &self,
        bound: DateTime<Utc>,
        window: &FireWindow,
    ) -> Option<DateTime<Utc>> {
        let tz = &self.time_zone;
        let mut cursor = bound.with_timezone(tz).naive_local();
        loop {
            let local = self.expression.latest_at_or_before(cursor)?;
            let candidate = match tz.from_local_datetime(&local) {
                LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
                LocalResult::Ambiguous(first, second) => {
                    let second = second.with_timezone(&Utc);
                    if second <= bound {
                        Some(second)
                    } else {
                        Some(first.with_timezone(&Utc))
                    }
                }
                LocalResult::None => None,
            };
            if let Some(t) = candidate {
                if t < window.start {
                    return None;
                }
                if t <= bound {
                    return Some(t);
                }
            }
            cursor = local.checked_sub_signed(Duration::seconds(1))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn open_window() -> FireWindow {
        FireWindow::new(utc(2000, 1, 1, 0, 0, 0), None)
    }

    fn next(expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        CronSchedule::utc(expr)
            .unwrap()
            .fire_time_after(after, &open_window())
    }

    #[test]
    fn every_five_minutes() {
        assert_eq!(
            next("*/5 * * * *", utc(2024, 6, 1, 10, 2, 30)),
            Some(utc(2024, 6, 1, 10, 5, 0))
        );
        // Strictly after: an exact match moves on.
        assert_eq!(
            next("*/5 * * * *", utc(2024, 6, 1, 10, 5, 0)),
            Some(utc(2024, 6, 1, 10, 10, 0))
        );
    }

    #[test]
    fn six_fields_lead_with_seconds() {
        assert_eq!(
            next("30 0 12 * * *", utc(2024, 6, 1, 10, 0, 0)),
            Some(utc(2024, 6, 1, 12, 0, 30))
        );
    }

    #[test]
    fn rolls_over_year_end() {
        assert_eq!(
            next("0 0 1 1 *", utc(2024, 12, 31, 23, 59, 59)),
            Some(utc(2025, 1, 1, 0, 0, 0))
        );
    }

    #[test]
    fn day_fields_are_ored_when_both_restricted() {
        // The 15th or any Monday. 2024-06-03 is a Monday.
        assert_eq!(
            next("0 9 15 * MON", utc(2024, 6, 1, 0, 0, 0)),
            Some(utc(2024, 6, 3, 9, 0, 0))
        );
        // Only Mondays when day-of-month is unrestricted.
        assert_eq!(
            next("0 9 ? * 1", utc(2024, 6, 4, 0, 0, 0)),
            Some(utc(2024, 6, 10, 9, 0, 0))
        );
    }

    #[test]
    fn sunday_can_be_zero_or_seven() {
        let a = next("0 0 * * 0", utc(2024, 6, 3, 0, 0, 0));
        let b = next("0 0 * * 7", utc(2024, 6, 3, 0, 0, 0));
        assert_eq!(a, Some(utc(2024, 6, 9, 0, 0, 0)));
        assert_eq!(a, b);
    }

    #[test]
    fn weekday_range_may_end_on_seven() {
        let expr = CronExpression::parse("0 0 * * FRI-7").unwrap();
        assert_eq!(expr.days_of_week.bits, 1 | 1 << 5 | 1 << 6);
        assert_eq!(
            next("0 0 * * 5-7", utc(2024, 6, 8, 12, 0, 0)),
            Some(utc(2024, 6, 9, 0, 0, 0))
        );
        assert_eq!(
            next("0 0 * * */3", utc(2024, 6, 3, 0, 0, 0)),
            Some(utc(2024, 6, 5, 0, 0, 0))
        );
    }

    #[test]
    fn last_day_of_month() {
        assert_eq!(
            next("0 0 L 2 *", utc(2023, 3, 1, 0, 0, 0)),
            Some(utc(2024, 2, 29, 0, 0, 0))
        );
    }

    #[test]
    fn nonexistent_date_gives_up() {
        assert_eq!(next("0 0 30 2 *", utc(2024, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn leap_day_is_found() {
        assert_eq!(
            next("0 0 29 2 *", utc(2024, 3, 1, 0, 0, 0)),
            Some(utc(2028, 2, 29, 0, 0, 0))
        );
    }

    #[test]
    fn malformed_fields_are_rejected() {
        for bad in [
            "* * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 32 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5-1 * * * *",
            "? * * * *",
            "* * * FOO *",
            "1,,2 * * * *",
        ] {
            assert!(CronExpression::parse(bad).is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn names_and_ranges_parse() {
        let expr = CronExpression::parse("0 8-18/2 * JAN-MAR mon-fri").unwrap();
        assert!(expr.hours.contains(8));
        assert!(expr.hours.contains(18));
        assert!(!expr.hours.contains(9));
        assert!(expr.months.contains(3));
        assert!(!expr.months.contains(4));
        assert!(expr.days_of_week.contains(5));
        assert!(!expr.days_of_week.contains(0));
    }

    #[test]
    fn evaluates_in_time_zone() {
        let rule = CronSchedule::new("0 9 * * *", chrono_tz::Europe::Berlin).unwrap();
        // 09:00 CEST = 07:00 UTC in June.
        assert_eq!(
            rule.fire_time_after(utc(2024, 6, 1, 8, 0, 0), &open_window()),
            Some(utc(2024, 6, 2, 7, 0, 0))
        );
    }

    #[test]
    fn skipped_wall_clock_time_does_not_fire() {
        let rule = CronSchedule::new("30 2 * * *", chrono_tz::America::New_York).unwrap();
        // 02:30 does not exist on 2024-03-10; the next firing is 2024-03-11 02:30 EDT.
        assert_eq!(
            rule.fire_time_after(utc(2024, 3, 9, 12, 0, 0), &open_window()),
            Some(utc(2024, 3, 11, 6, 30, 0))
        );
    }

    #[test]
    fn respects_start_time() {
        let start = utc(2024, 6, 1, 10, 0, 0);
        let rule = CronSchedule::utc("0 * * * *").unwrap();
        let window = FireWindow::new(start, None);
        assert_eq!(
            rule.fire_time_after(start - Duration::days(3), &window),
            Some(start)
        );
    }

    #[test]
    fn latest_before_bound() {
        let rule = CronSchedule::utc("0 12 * * *").unwrap();
        let window = FireWindow::new(utc(2024, 1, 1, 0, 0, 0), None);
        assert_eq!(
            rule.fire_time_before(utc(2024, 6, 1, 11, 0, 0), &window),
            Some(utc(2024, 5, 31, 12, 0, 0))
        );
        assert_eq!(
            rule.fire_time_before(utc(2024, 1, 1, 11, 0, 0), &window),
            None
        );
    }

    #[test]
    fn serializes_as_source_string() {
        let rule = CronSchedule::utc("0 0 * * MON").unwrap();
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["expression"], "0 0 * * MON");
        assert_eq!(json["time_zone"], "UTC");
        let bad = serde_json::json!({ "expression": "0 0 * *", "time_zone": "UTC" });
        assert!(serde_json::from_value::<CronSchedule>(bad).is_err());
    }
}
