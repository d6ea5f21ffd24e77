use std::fmt;

use chrono::{DateTime, Datelike, Days, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

use crate::schedule::resolve_local;

/// Excludes instants from a trigger's schedule.
///
/// A trigger bound to a calendar skips every computed fire time the calendar
/// rejects and moves on to the rule's next candidate.
pub trait Calendar: Send + Sync + fmt::Debug {
    fn is_time_included(&self, time: DateTime<Utc>) -> bool;

    /// Earliest included instant at or after `time`, if there is one.
    fn next_included_time(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Excludes whole days of the week, evaluated in a time zone.
#[derive(Debug, Clone)]
pub struct WeekdayCalendar {
    time_zone: Tz,
    /// Indexed by `num_days_from_monday`.
    excluded: [bool; 7],
}

impl WeekdayCalendar {
    pub fn new(time_zone: Tz, excluded: &[Weekday]) -> Self {
        let mut mask = [false; 7];
        for day in excluded {
            mask[day.num_days_from_monday() as usize] = true;
        }
        Self {
            time_zone,
            excluded: mask,
        }
    }

    /// Saturday and Sunday excluded.
    pub fn weekends(time_zone: Tz) -> Self {
        Self::new(time_zone, &[Weekday::Sat, Weekday::Sun])
    }

    fn is_day_excluded(&self, day: Weekday) -> bool {
        self.excluded[day.num_days_from_monday() as usize]
    }
}

impl Calendar for WeekdayCalendar {
    fn is_time_included(&self, time: DateTime<Utc>) -> bool {
        !self.is_day_excluded(time.with_timezone(&self.time_zone).weekday())
    }

    fn next_included_time(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_time_included(time) {
            return Some(time);
        }
        let mut date = time.with_timezone(&self.time_zone).date_naive();
        for _ in 0..7 {
            date = date.checked_add_days(Days::new(1))?;
            if !self.is_day_excluded(date.weekday()) {
                return resolve_local(&self.time_zone, date.and_time(NaiveTime::MIN));
            }
        }
        // Every weekday is excluded.
        None
    }
}
