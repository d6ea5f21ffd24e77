use chrono::{DateTime, Datelike, Days, Duration, Months, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::{resolve_local, FireWindow, GIVE_UP_YEARS};
use crate::error::{Result, SchedulerError};

/// Steps taken past the estimated index before giving up.
const MAX_PROBES: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

/// Fires every `interval` calendar units, measured in `time_zone`.
///
/// Day and longer units keep the wall-clock time of the start across DST
/// changes; month and year units clamp to the end of short months while
/// still counting from the start (Jan 31 → Feb 29 → Mar 31).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarIntervalSchedule {
    pub interval: u32,
    pub unit: IntervalUnit,
    #[serde(default = "default_time_zone")]
    pub time_zone: Tz,
}

fn default_time_zone() -> Tz {
    chrono_tz::UTC
}

impl CalendarIntervalSchedule {
    pub fn new(interval: u32, unit: IntervalUnit, time_zone: Tz) -> Self {
        Self {
            interval,
            unit,
            time_zone,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(SchedulerError::InvalidSchedule(
                "calendar interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The k-th candidate, re-derived from the start's calendar fields.
    fn candidate(&self, start: DateTime<Utc>, k: u64) -> Option<DateTime<Utc>> {
        if k == 0 {
            return Some(start);
        }
        let steps = k.checked_mul(u64::from(self.interval))?;
        let fixed = |unit_secs: u64| {
            let secs = i64::try_from(steps.checked_mul(unit_secs)?).ok()?;
            start.checked_add_signed(Duration::seconds(secs))
        };
        let local = start.with_timezone(&self.time_zone).naive_local();
        let shifted = match self.unit {
            IntervalUnit::Second => return fixed(1),
            IntervalUnit::Minute => return fixed(60),
            IntervalUnit::Hour => return fixed(3600),
            IntervalUnit::Day => local.checked_add_days(Days::new(steps))?,
            IntervalUnit::Week => local.checked_add_days(Days::new(steps.checked_mul(7)?))?,
            IntervalUnit::Month => {
                local.checked_add_months(Months::new(u32::try_from(steps).ok()?))?
            }
            IntervalUnit::Year => local
                .checked_add_months(Months::new(u32::try_from(steps.checked_mul(12)?).ok()?))?,
        };
        resolve_local(&self.time_zone, shifted)
    }

    /// A lower bound on the index of the first candidate after `after`.
    fn estimate_index(&self, start: DateTime<Utc>, after: DateTime<Utc>) -> u64 {
        let interval = i64::from(self.interval);
        let units = match self.unit {
            IntervalUnit::Second => (after - start).num_seconds(),
            IntervalUnit::Minute => (after - start).num_minutes(),
            IntervalUnit::Hour => (after - start).num_hours(),
            IntervalUnit::Day | IntervalUnit::Week => {
                let days = (after.with_timezone(&self.time_zone).date_naive()
                    - start.with_timezone(&self.time_zone).date_naive())
                .num_days();
                if self.unit == IntervalUnit::Week {
                    days / 7
                } else {
                    days
                }
            }
            IntervalUnit::Month | IntervalUnit::Year => {
                let a = after.with_timezone(&self.time_zone);
                let s = start.with_timezone(&self.time_zone);
                let months = i64::from(a.year() - s.year()) * 12 + i64::from(a.month())
                    - i64::from(s.month());
                if self.unit == IntervalUnit::Year {
                    months / 12
                } else {
                    months
                }
            }
        };
        // Step back one to absorb DST and month-length slack.
        u64::try_from(units / interval - 1).unwrap_or(0)
    }

    /// Smallest k whose candidate lies strictly after `after`.
    fn index_after(&self, start: DateTime<Utc>, after: DateTime<Utc>) -> Option<u64> {
        if after < start {
            return Some(0);
        }
        let give_up = after.year().saturating_add(GIVE_UP_YEARS);
        let mut k = self.estimate_index(start, after);
        for _ in 0..MAX_PROBES {
            let candidate = self.candidate(start, k)?;
            if candidate.year() > give_up {
                return None;
            }
            if candidate > after {
                return Some(k);
            }
            k = k.checked_add(1)?;
        }
        None
    }

    pub(crate) fn fire_time_after(
        &self,
        after: DateTime<Utc>,
        window: &FireWindow,
    ) -> Option<DateTime<Utc>> {
        let mut k = self.index_after(window.start, after)?;
        // A resolved candidate can land before the start around a DST fold.
        for _ in 0..MAX_PROBES {
            let candidate = self.candidate(window.start, k)?;
            if candidate >= window.start && candidate > after {
                return Some(candidate);
            }
            k = k.checked_add(1)?;
        }
        None
    }

    pub(crate) fn fire_time_before(
        &self,
        bound: DateTime<Utc>,
        window: &FireWindow,
    ) -> Option<DateTime<Utc>> {
        let k = self.index_after(window.start, bound)?;
        let last = self.candidate(window.start, k.checked_sub(1)?)?;
        (last >= window.start).then_some(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window(start: DateTime<Utc>) -> FireWindow {
        FireWindow::new(start, None)
    }

    #[test]
    fn monthly_counts_from_start_and_clamps() {
        let rule = CalendarIntervalSchedule::new(1, IntervalUnit::Month, chrono_tz::UTC);
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 9, 0, 0).unwrap();
        let w = window(start);
        let feb = rule.fire_time_after(start, &w).unwrap();
        assert_eq!(feb, Utc.with_ymd_and_hms(2024, 2, 29, 9, 0, 0).unwrap());
        let mar = rule.fire_time_after(feb, &w).unwrap();
        assert_eq!(mar, Utc.with_ymd_and_hms(2024, 3, 31, 9, 0, 0).unwrap());
    }

    #[test]
    fn daily_keeps_wall_clock_across_dst() {
        let tz = chrono_tz::America::New_York;
        let rule = CalendarIntervalSchedule::new(1, IntervalUnit::Day, tz);
        // 2024-03-09 09:00 EST = 14:00 UTC.
        let start = Utc.with_ymd_and_hms(2024, 3, 9, 14, 0, 0).unwrap();
        let next = rule.fire_time_after(start, &window(start)).unwrap();
        // 2024-03-10 09:00 EDT = 13:00 UTC: only 23 hours later.
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 10, 13, 0, 0).unwrap());
        assert_eq!((next - start).num_hours(), 23);
    }

    #[test]
    fn far_after_jumps_without_walking() {
        let rule = CalendarIntervalSchedule::new(2, IntervalUnit::Week, chrono_tz::UTC);
        let start = Utc.with_ymd_and_hms(2020, 1, 6, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let next = rule.fire_time_after(after, &window(start)).unwrap();
        assert!(next > after);
        assert!(next - after <= Duration::weeks(2));
        assert_eq!((next - start).num_days() % 14, 0);
    }

    #[test]
    fn fire_time_before_returns_latest_candidate() {
        let rule = CalendarIntervalSchedule::new(1, IntervalUnit::Year, chrono_tz::UTC);
        let start = Utc.with_ymd_and_hms(2020, 5, 1, 0, 0, 0).unwrap();
        let bound = Utc.with_ymd_and_hms(2023, 4, 30, 0, 0, 0).unwrap();
        assert_eq!(
            rule.fire_time_before(bound, &window(start)),
            Some(Utc.with_ymd_and_hms(2022, 5, 1, 0, 0, 0).unwrap())
        );
        let too_early = Utc.with_ymd_and_hms(2020, 4, 1, 0, 0, 0).unwrap();
        assert_eq!(rule.fire_time_before(too_early, &window(start)), None);
    }

    #[test]
    fn zero_interval_is_invalid() {
        let rule = CalendarIntervalSchedule::new(0, IntervalUnit::Day, chrono_tz::UTC);
        assert!(rule.validate().is_err());
    }
}
