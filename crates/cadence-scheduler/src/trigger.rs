use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::error::{Result, SchedulerError};
use crate::keys::KeyGenerator;
use crate::misfire::MisfireInstruction;
use crate::schedule::{FireWindow, ScheduleRule, GIVE_UP_YEARS};
use crate::types::{JobKey, TriggerKey, TriggerState, DEFAULT_GROUP};

/// Priority given to triggers that do not set one. Higher fires first on ties.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Upper bound on consecutive calendar-excluded fire times skipped in one go.
const MAX_CALENDAR_SKIPS: usize = 10_000;

/// Everything needed to create a [`Trigger`].
///
/// Fields are public; start from [`TriggerConfig::new`] and override with
/// struct update syntax.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Generated from the handle's key generator when absent.
    pub key: Option<TriggerKey>,
    pub job_key: Option<JobKey>,
    pub description: Option<String>,
    pub priority: i32,
    pub calendar_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub schedule: ScheduleRule,
    pub misfire_instruction: MisfireInstruction,
    /// Merged over the job's own data when the trigger fires.
    pub job_data: serde_json::Value,
}

impl TriggerConfig {
    /// Defaults: priority 5, starting now, smart misfire policy.
    pub fn new(schedule: ScheduleRule) -> Self {
        Self {
            key: None,
            job_key: None,
            description: None,
            priority: DEFAULT_PRIORITY,
            calendar_name: None,
            start_time: Utc::now(),
            end_time: None,
            schedule,
            misfire_instruction: MisfireInstruction::Smart,
            job_data: serde_json::Value::Null,
        }
    }
}

/// A schedule rule bound to a job, plus its mutable scheduling state.
///
/// `next_fire_time`, `previous_fire_time`, `times_triggered` and `state` are
/// only changed by the job store while it holds the trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: i32,
    #[serde(default)]
    pub calendar_name: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub schedule: ScheduleRule,
    #[serde(default)]
    pub misfire_instruction: MisfireInstruction,
    #[serde(default)]
    pub job_data: serde_json::Value,
    #[serde(default)]
    pub next_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub previous_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub times_triggered: u32,
    pub state: TriggerState,
}

impl Trigger {
    /// Validate `config` and build an unscheduled trigger (state NONE, no
    /// fire time yet).
    pub fn from_config(config: TriggerConfig, keys: &dyn KeyGenerator) -> Result<Self> {
        let key = config
            .key
            .unwrap_or_else(|| TriggerKey::new(keys.unique_name(), DEFAULT_GROUP));
        let invalid = |reason: &str| SchedulerError::InvalidTrigger {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        let job_key = config
            .job_key
            .ok_or_else(|| invalid("trigger is not bound to a job"))?;
        if config.end_time.is_some_and(|end| end < config.start_time) {
            return Err(invalid("end time is before start time"));
        }
        config.schedule.validate()?;
        if !config.schedule.supports(config.misfire_instruction) {
            return Err(invalid(&format!(
                "misfire instruction {} does not apply to this schedule",
                config.misfire_instruction
            )));
        }

        Ok(Self {
            key,
            job_key,
            description: config.description,
            priority: config.priority,
            calendar_name: config.calendar_name,
            start_time: config.start_time,
            end_time: config.end_time,
            schedule: config.schedule,
            misfire_instruction: config.misfire_instruction,
            job_data: config.job_data,
            next_fire_time: None,
            previous_fire_time: None,
            times_triggered: 0,
            state: TriggerState::None,
        })
    }

    pub fn window(&self) -> FireWindow {
        FireWindow::new(self.start_time, self.end_time)
    }

    /// The rule's next fire time strictly after `after`, ignoring calendars.
    pub fn fire_time_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.fire_time_after(after, &self.window())
    }

    /// Like [`Self::fire_time_after`], skipping times the calendar excludes.
    pub fn next_fire_time_after(
        &self,
        after: DateTime<Utc>,
        calendar: Option<&dyn Calendar>,
    ) -> Option<DateTime<Utc>> {
        self.skip_excluded(self.fire_time_after(after), calendar)
    }

    /// Last time the trigger will fire, or `None` when it is unbounded.
    pub fn final_fire_time(&self) -> Option<DateTime<Utc>> {
        self.schedule.final_fire_time(&self.window())
    }

    pub fn may_fire_again(&self) -> bool {
        self.next_fire_time.is_some() && self.schedule.may_fire_again(self.times_triggered)
    }

    /// `Some(time)` unless it falls after the end time.
    pub(crate) fn within_end(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.end_time {
            Some(end) if time > end => None,
            _ => Some(time),
        }
    }

    /// Set and return the first fire time at or after the start time.
    pub fn compute_first_fire_time(
        &mut self,
        calendar: Option<&dyn Calendar>,
    ) -> Option<DateTime<Utc>> {
        let before_start = self.start_time - Duration::milliseconds(1);
        self.next_fire_time = self.next_fire_time_after(before_start, calendar);
        self.next_fire_time
    }

    /// Record a firing at the current `next_fire_time` and advance past it.
    pub fn triggered(&mut self, calendar: Option<&dyn Calendar>) {
        self.times_triggered = self.times_triggered.saturating_add(1);
        if let Some(fired) = self.next_fire_time {
            self.previous_fire_time = Some(fired);
            self.next_fire_time = self.next_fire_time_after(fired, calendar);
        }
    }

    /// Recompute the next fire time after the trigger's calendar changed.
    pub fn update_with_new_calendar(&mut self, calendar: Option<&dyn Calendar>) {
        let after = self
            .previous_fire_time
            .unwrap_or(self.start_time - Duration::milliseconds(1));
        self.next_fire_time = self.next_fire_time_after(after, calendar);
    }

    fn skip_excluded(
        &self,
        candidate: Option<DateTime<Utc>>,
        calendar: Option<&dyn Calendar>,
    ) -> Option<DateTime<Utc>> {
        let Some(calendar) = calendar else {
            return candidate;
        };
        let mut time = candidate?;
        let give_up = time.year().saturating_add(GIVE_UP_YEARS);
        for _ in 0..MAX_CALENDAR_SKIPS {
            if calendar.is_time_included(time) {
                return Some(time);
            }
            let resume = calendar.next_included_time(time)?;
            if resume.year() > give_up {
                return None;
            }
            time = self.fire_time_after(resume - Duration::milliseconds(1))?;
        }
        None
    }
}
