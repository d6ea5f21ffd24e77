//! Schedule rules: pure functions from "fire after this instant" to the next
//! candidate fire time.
//!
//! | Variant             | Behaviour                                                |
//! |---------------------|----------------------------------------------------------|
//! | `Simple`            | Fixed interval in absolute time, optional repeat count   |
//! | `CalendarInterval`  | Every N seconds/../days/weeks/months/years in a time zone |
//! | `Cron`              | Cron field pattern evaluated in a time zone              |
//!
//! A rule never returns a time at or before the `after` argument, never one
//! before the trigger's start time and never one after its end time.

mod calendar_interval;
mod cron;
mod simple;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub use calendar_interval::{CalendarIntervalSchedule, IntervalUnit};
pub use cron::{CronExpression, CronSchedule};
pub use simple::SimpleSchedule;

use crate::error::Result;
use crate::misfire::MisfireInstruction;

/// Searches for a fire time give up this many years past their reference point.
pub const GIVE_UP_YEARS: i32 = 100;

/// The part of a trigger a rule needs: when it may start and stop firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FireWindow {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl FireWindow {
    pub fn new(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    /// `Some(time)` unless `time` falls after the end bound.
    fn bounded(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.end {
            Some(end) if time > end => None,
            _ => Some(time),
        }
    }
}

/// Defines when a trigger fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleRule {
    Simple(SimpleSchedule),
    CalendarInterval(CalendarIntervalSchedule),
    Cron(CronSchedule),
}

impl ScheduleRule {
    /// Reject malformed parameters before a trigger is ever stored.
    pub fn validate(&self) -> Result<()> {
        match self {
            ScheduleRule::Simple(s) => s.validate(),
            ScheduleRule::CalendarInterval(c) => c.validate(),
            // Cron expressions are validated when parsed.
            ScheduleRule::Cron(_) => Ok(()),
        }
    }

    /// Earliest fire time strictly after `after`, within `window`.
    pub fn fire_time_after(
        &self,
        after: DateTime<Utc>,
        window: &FireWindow,
    ) -> Option<DateTime<Utc>> {
        let next = match self {
            ScheduleRule::Simple(s) => s.fire_time_after(after, window),
            ScheduleRule::CalendarInterval(c) => c.fire_time_after(after, window),
            ScheduleRule::Cron(c) => c.fire_time_after(after, window),
        }?;
        debug_assert!(next > after && next >= window.start);
        window.bounded(next)
    }

    /// Latest fire time at or before `bound`, within `window`.
    pub fn fire_time_before(
        &self,
        bound: DateTime<Utc>,
        window: &FireWindow,
    ) -> Option<DateTime<Utc>> {
        if bound < window.start {
            return None;
        }
        let bound = window.end.map_or(bound, |end| bound.min(end));
        match self {
            ScheduleRule::Simple(s) => s.fire_time_before(bound, window),
            ScheduleRule::CalendarInterval(c) => c.fire_time_before(bound, window),
            ScheduleRule::Cron(c) => c.fire_time_before(bound, window),
        }
    }

    /// The last time this rule will fire, or `None` if it repeats forever.
    pub fn final_fire_time(&self, window: &FireWindow) -> Option<DateTime<Utc>> {
        match self {
            ScheduleRule::Simple(s) => s.final_fire_time(window),
            _ => window
                .end
                .and_then(|end| self.fire_time_before(end, window)),
        }
    }

    /// Whether the rule's own bounds (repeat count) allow another firing
    /// after `times_triggered` firings. Time bounds are covered by
    /// [`Self::fire_time_after`].
    pub fn may_fire_again(&self, times_triggered: u32) -> bool {
        match self {
            ScheduleRule::Simple(s) => s.may_fire_again(times_triggered),
            ScheduleRule::CalendarInterval(_) | ScheduleRule::Cron(_) => true,
        }
    }

    /// What [`MisfireInstruction::Smart`] resolves to for this rule.
    pub fn smart_misfire_instruction(&self) -> MisfireInstruction {
        match self {
            ScheduleRule::Simple(s) => match s.repeat_count {
                Some(0) => MisfireInstruction::FireNow,
                None => MisfireInstruction::RescheduleNextWithRemainingCount,
                Some(_) => MisfireInstruction::RescheduleNowWithExistingCount,
            },
            ScheduleRule::CalendarInterval(_) => MisfireInstruction::FireOnceNow,
            ScheduleRule::Cron(_) => MisfireInstruction::DoNothing,
        }
    }

    /// Whether `instruction` is meaningful for this rule variant.
    pub fn supports(&self, instruction: MisfireInstruction) -> bool {
        use MisfireInstruction as M;
        match instruction {
            M::Smart | M::IgnoreMisfire => true,
            M::FireNow
            | M::RescheduleNowWithExistingCount
            | M::RescheduleNowWithRemainingCount
            | M::RescheduleNextWithRemainingCount
            | M::RescheduleNextWithExistingCount => matches!(self, ScheduleRule::Simple(_)),
            M::FireOnceNow | M::DoNothing => !matches!(self, ScheduleRule::Simple(_)),
        }
    }
}

/// Map a wall-clock time in `tz` to an instant.
///
/// Ambiguous times (clocks going back) take the earlier instant; times inside
/// a gap (clocks going forward) are shifted forward by the gap's length.
pub(crate) fn resolve_local(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            // Interpret the wall-clock time with the offset in force before the gap.
            let before = local.checked_sub_signed(Duration::hours(3))?;
            let offset = tz.offset_from_local_datetime(&before).earliest()?.fix();
            local
                .and_utc()
                .checked_sub_signed(Duration::seconds(i64::from(offset.local_minus_utc())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn naive(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    #[test]
    fn gap_time_shifts_forward() {
        let tz = chrono_tz::America::New_York;
        // 2024-03-10 02:30 does not exist in New York; 03:30 EDT = 07:30 UTC.
        let t = resolve_local(&tz, naive(2024, 3, 10, 2, 30)).unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 3, 10, 7, 30, 0).unwrap());
    }

    #[test]
    fn ambiguous_time_takes_earlier_instant() {
        let tz = chrono_tz::America::New_York;
        // 2024-11-03 01:30 happens twice; the EDT one is 05:30 UTC.
        let t = resolve_local(&tz, naive(2024, 11, 3, 1, 30)).unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 11, 3, 5, 30, 0).unwrap());
    }

    #[test]
    fn rule_serializes_with_kind_tag() {
        let rule = ScheduleRule::Simple(SimpleSchedule::every(std::time::Duration::from_secs(60)));
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["kind"], "simple");
        assert_eq!(json["interval_ms"], 60_000);
        let back: ScheduleRule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn smart_instruction_depends_on_variant() {
        let forever = ScheduleRule::Simple(SimpleSchedule::every(std::time::Duration::from_secs(1)));
        let once = ScheduleRule::Simple(SimpleSchedule::once());
        let cron = ScheduleRule::Cron(CronSchedule::utc("0 * * * *").unwrap());
        assert_eq!(
            forever.smart_misfire_instruction(),
            MisfireInstruction::RescheduleNextWithRemainingCount
        );
        assert_eq!(once.smart_misfire_instruction(), MisfireInstruction::FireNow);
        assert_eq!(cron.smart_misfire_instruction(), MisfireInstruction::DoNothing);
        assert!(!cron.supports(MisfireInstruction::FireNow));
        assert!(cron.supports(MisfireInstruction::IgnoreMisfire));
    }
}
