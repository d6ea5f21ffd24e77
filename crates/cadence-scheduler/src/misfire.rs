//! Misfire detection and correction.
//!
//! A trigger has misfired when its next fire time is older than
//! `now - threshold` at the moment the store looks at it. The correction is
//! chosen by the trigger's [`MisfireInstruction`]; `Smart` defers to the
//! schedule rule's own default.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::error::SchedulerError;
use crate::schedule::ScheduleRule;
use crate::trigger::Trigger;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfireInstruction {
    /// Let the schedule rule pick (see [`ScheduleRule::smart_misfire_instruction`]).
    #[default]
    Smart,
    /// Never correct; the late fire time is fired as soon as possible.
    IgnoreMisfire,
    /// Fixed interval, one-shot: fire now. With repeats left this behaves like
    /// `RescheduleNowWithRemainingCount`.
    FireNow,
    /// Fixed interval: restart the schedule now, keeping the repeat count
    /// minus the firings already done.
    RescheduleNowWithExistingCount,
    /// Fixed interval: restart the schedule now, also deducting missed firings.
    RescheduleNowWithRemainingCount,
    /// Fixed interval: wait for the next scheduled time; missed firings count
    /// as fired.
    RescheduleNextWithRemainingCount,
    /// Fixed interval: wait for the next scheduled time; missed firings are
    /// not counted.
    RescheduleNextWithExistingCount,
    /// Calendar interval / cron: fire once now, then resume the schedule.
    FireOnceNow,
    /// Calendar interval / cron: skip the missed firings entirely.
    DoNothing,
}

impl MisfireInstruction {
    /// Numeric code of the instruction. `0` is smart, `-1` is ignore; rule
    /// specific codes overlap between the fixed-interval and calendar/cron
    /// families.
    pub fn code(self) -> i32 {
        match self {
            MisfireInstruction::Smart => 0,
            MisfireInstruction::IgnoreMisfire => -1,
            MisfireInstruction::FireNow | MisfireInstruction::FireOnceNow => 1,
            MisfireInstruction::RescheduleNowWithExistingCount | MisfireInstruction::DoNothing => 2,
            MisfireInstruction::RescheduleNowWithRemainingCount => 3,
            MisfireInstruction::RescheduleNextWithRemainingCount => 4,
            MisfireInstruction::RescheduleNextWithExistingCount => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MisfireInstruction::Smart => "smart",
            MisfireInstruction::IgnoreMisfire => "ignore_misfire",
            MisfireInstruction::FireNow => "fire_now",
            MisfireInstruction::RescheduleNowWithExistingCount => {
                "reschedule_now_with_existing_count"
            }
            MisfireInstruction::RescheduleNowWithRemainingCount => {
                "reschedule_now_with_remaining_count"
            }
            MisfireInstruction::RescheduleNextWithRemainingCount => {
                "reschedule_next_with_remaining_count"
            }
            MisfireInstruction::RescheduleNextWithExistingCount => {
                "reschedule_next_with_existing_count"
            }
            MisfireInstruction::FireOnceNow => "fire_once_now",
            MisfireInstruction::DoNothing => "do_nothing",
        }
    }
}

impl fmt::Display for MisfireInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MisfireInstruction {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [MisfireInstruction; 9] = [
            MisfireInstruction::Smart,
            MisfireInstruction::IgnoreMisfire,
            MisfireInstruction::FireNow,
            MisfireInstruction::RescheduleNowWithExistingCount,
            MisfireInstruction::RescheduleNowWithRemainingCount,
            MisfireInstruction::RescheduleNextWithRemainingCount,
            MisfireInstruction::RescheduleNextWithExistingCount,
            MisfireInstruction::FireOnceNow,
            MisfireInstruction::DoNothing,
        ];
        ALL.into_iter()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| {
                SchedulerError::InvalidSchedule(format!("unknown misfire instruction: {s}"))
            })
    }
}

/// Whether `trigger` is later than the threshold allows at `now`.
pub fn is_misfired(trigger: &Trigger, now: DateTime<Utc>, threshold: Duration) -> bool {
    if trigger.misfire_instruction == MisfireInstruction::IgnoreMisfire {
        return false;
    }
    trigger
        .next_fire_time
        .zip(now.checked_sub_signed(threshold))
        .is_some_and(|(next, limit)| next < limit)
}

/// Correct a misfired trigger in place.
///
/// Returns `false`, leaving the trigger untouched, when it is not misfired, so
/// calling it again on a corrected trigger is a no-op. A `true` return with
/// `next_fire_time == None` means the trigger has nothing left to fire.
pub fn apply_misfire(
    trigger: &mut Trigger,
    calendar: Option<&dyn Calendar>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    if !is_misfired(trigger, now, threshold) {
        return false;
    }
    let instruction = match trigger.misfire_instruction {
        MisfireInstruction::Smart => trigger.schedule.smart_misfire_instruction(),
        other => other,
    };
    correct(trigger, instruction, calendar, now);
    true
}

fn correct(
    trigger: &mut Trigger,
    instruction: MisfireInstruction,
    calendar: Option<&dyn Calendar>,
    now: DateTime<Utc>,
) {
    use MisfireInstruction as M;

    let missed_next = trigger.next_fire_time;
    // "Now" for corrections that fire immediately: the first instant the
    // calendar allows.
    let fire_now = match calendar {
        Some(cal) => cal.next_included_time(now),
        None => Some(now),
    };
    let one_shot = matches!(
        &trigger.schedule,
        ScheduleRule::Simple(s) if s.repeat_count == Some(0)
    );

    match instruction {
        M::Smart | M::IgnoreMisfire => {}
        M::FireNow if one_shot => {
            trigger.next_fire_time = fire_now.and_then(|t| trigger.within_end(t));
        }
        M::FireOnceNow => {
            trigger.next_fire_time = fire_now.and_then(|t| trigger.within_end(t));
        }
        M::FireNow | M::RescheduleNowWithRemainingCount => {
            let Some(new_time) = fire_now else {
                trigger.next_fire_time = None;
                return;
            };
            if let ScheduleRule::Simple(s) = &mut trigger.schedule {
                let missed = missed_next.map_or(0, |from| s.fires_between(from, new_time));
                if let Some(limit) = s.repeat_count.filter(|&n| n > 0) {
                    let done = trigger.times_triggered.saturating_add(missed);
                    s.repeat_count = Some(limit.saturating_sub(done));
                }
            }
            restart_at(trigger, new_time);
        }
        M::RescheduleNowWithExistingCount => {
            let Some(new_time) = fire_now else {
                trigger.next_fire_time = None;
                return;
            };
            if let ScheduleRule::Simple(s) = &mut trigger.schedule {
                if let Some(limit) = s.repeat_count.filter(|&n| n > 0) {
                    s.repeat_count = Some(limit.saturating_sub(trigger.times_triggered));
                }
            }
            restart_at(trigger, new_time);
        }
        M::RescheduleNextWithRemainingCount => {
            let next = trigger.next_fire_time_after(now, calendar);
            if let (Some(from), Some(to), ScheduleRule::Simple(s)) =
                (missed_next, next, &trigger.schedule)
            {
                let missed = s.fires_between(from, to);
                trigger.times_triggered = trigger.times_triggered.saturating_add(missed);
            }
            trigger.next_fire_time = next;
        }
        M::RescheduleNextWithExistingCount | M::DoNothing => {
            trigger.next_fire_time = trigger.next_fire_time_after(now, calendar);
        }
    }
}

/// Restart a fixed-interval schedule at `time`, which becomes its new start.
fn restart_at(trigger: &mut Trigger, time: DateTime<Utc>) {
    trigger.times_triggered = 0;
    match trigger.end_time {
        Some(end) if end < time => trigger.next_fire_time = None,
        _ => {
            trigger.start_time = time;
            trigger.next_fire_time = Some(time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SequenceKeyGenerator;
    use crate::schedule::{CronSchedule, SimpleSchedule};
    use crate::trigger::TriggerConfig;
    use crate::types::JobKey;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn trigger(rule: ScheduleRule, misfire: MisfireInstruction) -> Trigger {
        let config = TriggerConfig {
            job_key: Some(JobKey::with_default_group("job")),
            start_time: t0(),
            misfire_instruction: misfire,
            ..TriggerConfig::new(rule)
        };
        let mut trigger =
            Trigger::from_config(config, &SequenceKeyGenerator::new("t")).expect("valid trigger");
        trigger.compute_first_fire_time(None);
        trigger
    }

    fn every_minute() -> ScheduleRule {
        ScheduleRule::Simple(SimpleSchedule::every(std::time::Duration::from_secs(60)))
    }

    #[test]
    fn smart_interval_skips_to_next_multiple_after_now() {
        let mut t = trigger(every_minute(), MisfireInstruction::Smart);
        let now = t0() + Duration::seconds(125);
        assert!(apply_misfire(&mut t, None, now, Duration::seconds(30)));
        assert_eq!(t.next_fire_time, Some(t0() + Duration::seconds(180)));
    }

    #[test]
    fn within_threshold_is_not_a_misfire() {
        let mut t = trigger(every_minute(), MisfireInstruction::Smart);
        let now = t0() + Duration::seconds(20);
        assert!(!apply_misfire(&mut t, None, now, Duration::seconds(30)));
        assert_eq!(t.next_fire_time, Some(t0()));
    }

    #[test]
    fn ignore_keeps_the_late_time() {
        let mut t = trigger(every_minute(), MisfireInstruction::IgnoreMisfire);
        let now = t0() + Duration::hours(5);
        assert!(!apply_misfire(&mut t, None, now, Duration::seconds(30)));
        assert_eq!(t.next_fire_time, Some(t0()));
    }

    #[test]
    fn one_shot_fires_now() {
        let rule = ScheduleRule::Simple(SimpleSchedule::once());
        let mut t = trigger(rule, MisfireInstruction::Smart);
        let now = t0() + Duration::minutes(10);
        assert!(apply_misfire(&mut t, None, now, Duration::seconds(30)));
        assert_eq!(t.next_fire_time, Some(now));
    }

    #[test]
    fn reschedule_now_with_existing_count_restarts_schedule() {
        let rule = ScheduleRule::Simple(SimpleSchedule::repeat(
            std::time::Duration::from_secs(60),
            5,
        ));
        let mut t = trigger(rule, MisfireInstruction::Smart);
        t.triggered(None);
        t.triggered(None);
        assert_eq!(t.times_triggered, 2);
        let now = t0() + Duration::minutes(30);
        assert!(apply_misfire(&mut t, None, now, Duration::seconds(30)));
        assert_eq!(t.next_fire_time, Some(now));
        assert_eq!(t.start_time, now);
        assert_eq!(t.times_triggered, 0);
        match &t.schedule {
            ScheduleRule::Simple(s) => assert_eq!(s.repeat_count, Some(3)),
            other => panic!("unexpected rule {other:?}"),
        }
    }

    #[test]
    fn reschedule_now_with_remaining_count_deducts_missed() {
        let rule = ScheduleRule::Simple(SimpleSchedule::repeat(
            std::time::Duration::from_secs(60),
            10,
        ));
        let mut t = trigger(rule, MisfireInstruction::RescheduleNowWithRemainingCount);
        // Never fired; four intervals missed since t0.
        let now = t0() + Duration::seconds(250);
        assert!(apply_misfire(&mut t, None, now, Duration::seconds(30)));
        match &t.schedule {
            ScheduleRule::Simple(s) => assert_eq!(s.repeat_count, Some(6)),
            other => panic!("unexpected rule {other:?}"),
        }
        assert_eq!(t.next_fire_time, Some(now));
    }

    #[test]
    fn cron_does_nothing_until_next_match() {
        let rule = ScheduleRule::Cron(CronSchedule::utc("0 * * * *").unwrap());
        let mut t = trigger(rule, MisfireInstruction::Smart);
        let now = t0() + Duration::minutes(150);
        assert!(apply_misfire(&mut t, None, now, Duration::seconds(60)));
        assert_eq!(t.next_fire_time, Some(t0() + Duration::hours(3)));
    }

    #[test]
    fn fire_once_now_then_resumes() {
        let rule = ScheduleRule::Cron(CronSchedule::utc("0 * * * *").unwrap());
        let mut t = trigger(rule, MisfireInstruction::FireOnceNow);
        let now = t0() + Duration::minutes(150);
        assert!(apply_misfire(&mut t, None, now, Duration::seconds(60)));
        assert_eq!(t.next_fire_time, Some(now));
        t.triggered(None);
        assert_eq!(t.next_fire_time, Some(t0() + Duration::hours(3)));
    }

    #[test]
    fn exhausted_schedule_leaves_no_fire_time() {
        let rule = ScheduleRule::Simple(SimpleSchedule::repeat(
            std::time::Duration::from_secs(60),
            2,
        ));
        let mut t = trigger(rule, MisfireInstruction::RescheduleNextWithExistingCount);
        let now = t0() + Duration::hours(1);
        assert!(apply_misfire(&mut t, None, now, Duration::seconds(30)));
        assert_eq!(t.next_fire_time, None);
    }

    #[test]
    fn parses_from_config_strings() {
        assert_eq!(
            "fire_once_now".parse::<MisfireInstruction>().unwrap(),
            MisfireInstruction::FireOnceNow
        );
        assert!("sometimes".parse::<MisfireInstruction>().is_err());
        assert_eq!(MisfireInstruction::Smart.code(), 0);
        assert_eq!(MisfireInstruction::IgnoreMisfire.code(), -1);
    }

    proptest! {
        #[test]
        fn correction_is_idempotent(
            interval_s in 1u64..3_600,
            late_s in 0i64..100_000,
            threshold_s in 0i64..600,
            pick in 0usize..4,
        ) {
            let instruction = [
                MisfireInstruction::Smart,
                MisfireInstruction::RescheduleNextWithRemainingCount,
                MisfireInstruction::RescheduleNowWithExistingCount,
                MisfireInstruction::RescheduleNextWithExistingCount,
            ][pick];
            let interval = std::time::Duration::from_secs(interval_s);
            let rule = ScheduleRule::Simple(SimpleSchedule::every(interval));
            let mut t = trigger(rule, instruction);
            let now = t0() + Duration::seconds(late_s);
            let threshold = Duration::seconds(threshold_s);
            apply_misfire(&mut t, None, now, threshold);
            let once = t.clone();
            prop_assert!(!apply_misfire(&mut t, None, now, threshold));
            prop_assert_eq!(t, once);
        }
    }
}
