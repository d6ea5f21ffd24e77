use std::sync::Arc;

use cadence_core::JobEntry;
use chrono::Utc;
use tracing::info;

use crate::calendar::Calendar;
use crate::error::{Result, SchedulerError};
use crate::keys::{KeyGenerator, UuidKeyGenerator};
use crate::misfire::MisfireInstruction;
use crate::schedule::{ScheduleRule, SimpleSchedule};
use crate::signal::SchedulerSignal;
use crate::store::JobStore;
use crate::trigger::{Trigger, TriggerConfig, DEFAULT_PRIORITY};
use crate::types::{
    JobDetail, JobKey, TriggerKey, TriggerState, DEFAULT_GROUP, MANUAL_TRIGGER_GROUP,
};

/// Shared handle for managing jobs, triggers and calendars while the engine
/// loop runs. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    store: Arc<dyn JobStore>,
    signal: SchedulerSignal,
    keys: Arc<dyn KeyGenerator>,
}

impl SchedulerHandle {
    pub fn new(store: Arc<dyn JobStore>, signal: SchedulerSignal) -> Self {
        Self::with_key_generator(store, signal, Arc::new(UuidKeyGenerator))
    }

    /// Like [`Self::new`], naming key-less triggers with `keys`.
    pub fn with_key_generator(
        store: Arc<dyn JobStore>,
        signal: SchedulerSignal,
        keys: Arc<dyn KeyGenerator>,
    ) -> Self {
        Self {
            store,
            signal,
            keys,
        }
    }

    fn build(&self, config: TriggerConfig) -> Result<Trigger> {
        Trigger::from_config(config, self.keys.as_ref())
    }

    fn changed(&self, trigger: &Trigger) {
        self.signal.scheduling_changed(trigger.next_fire_time);
    }

    /// Store a new job with its first trigger. Returns the stored trigger.
    pub fn schedule_job(&self, job: JobDetail, trigger: TriggerConfig) -> Result<Trigger> {
        let trigger = self.build(TriggerConfig {
            job_key: Some(job.key.clone()),
            ..trigger
        })?;
        let stored = self.store.store_job_and_trigger(job, trigger)?;
        info!(
            job = %stored.job_key,
            trigger = %stored.key,
            next = ?stored.next_fire_time,
            "job scheduled"
        );
        self.changed(&stored);
        Ok(stored)
    }

    /// Store a job without a trigger. Only durable jobs may exist that way.
    pub fn add_job(&self, job: JobDetail, replace: bool) -> Result<()> {
        if !job.durable {
            return Err(SchedulerError::NonDurableJob {
                key: job.key.to_string(),
            });
        }
        let key = job.key.clone();
        self.store.store_job(job, replace)?;
        info!(job = %key, "job added");
        Ok(())
    }

    /// Add a trigger for a stored job; `trigger.job_key` names the job.
    pub fn schedule_trigger(&self, trigger: TriggerConfig) -> Result<Trigger> {
        let stored = self.store.store_trigger(self.build(trigger)?, false)?;
        info!(
            job = %stored.job_key,
            trigger = %stored.key,
            next = ?stored.next_fire_time,
            "trigger scheduled"
        );
        self.changed(&stored);
        Ok(stored)
    }

    pub fn unschedule_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let removed = self.store.remove_trigger(key)?;
        if removed {
            info!(trigger = %key, "trigger unscheduled");
            self.signal.scheduling_changed(None);
        }
        Ok(removed)
    }

    /// Replace the trigger at `key`. The replacement fires the same job and
    /// keeps the old key unless it names its own.
    ///
    /// `Ok(None)` when no trigger is stored under `key`.
    pub fn reschedule_trigger(
        &self,
        key: &TriggerKey,
        trigger: TriggerConfig,
    ) -> Result<Option<Trigger>> {
        let Some(old) = self.store.retrieve_trigger(key)? else {
            return Ok(None);
        };
        let replacement = self.build(TriggerConfig {
            key: trigger.key.clone().or_else(|| Some(key.clone())),
            job_key: Some(old.job_key),
            ..trigger
        })?;
        let stored = self.store.replace_trigger(key, replacement)?;
        if let Some(t) = &stored {
            info!(trigger = %key, next = ?t.next_fire_time, "trigger rescheduled");
            self.changed(t);
        }
        Ok(stored)
    }

    /// Remove a job and all of its triggers.
    pub fn delete_job(&self, key: &JobKey) -> Result<bool> {
        let removed = self.store.remove_job(key)?;
        if removed {
            info!(job = %key, "job deleted");
            self.signal.scheduling_changed(None);
        }
        Ok(removed)
    }

    /// Fire a stored job once, as soon as possible, with `data` merged over
    /// its own.
    pub fn trigger_job_now(&self, job: &JobKey, data: serde_json::Value) -> Result<Trigger> {
        let config = TriggerConfig {
            key: Some(TriggerKey::new(self.keys.unique_name(), MANUAL_TRIGGER_GROUP)),
            job_key: Some(job.clone()),
            start_time: Utc::now(),
            job_data: data,
            ..TriggerConfig::new(ScheduleRule::Simple(SimpleSchedule::once()))
        };
        let stored = self.store.store_trigger(self.build(config)?, false)?;
        info!(job = %job, trigger = %stored.key, "job triggered manually");
        self.changed(&stored);
        Ok(stored)
    }

    pub fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
        self.store.pause_trigger(key)
    }

    pub fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
        self.store.resume_trigger(key, Utc::now())?;
        self.signal.scheduling_changed(None);
        Ok(())
    }

    pub fn pause_job(&self, key: &JobKey) -> Result<()> {
        self.store.pause_job(key)
    }

    pub fn resume_job(&self, key: &JobKey) -> Result<()> {
        self.store.resume_job(key, Utc::now())?;
        self.signal.scheduling_changed(None);
        Ok(())
    }

    pub fn trigger_state(&self, key: &TriggerKey) -> Result<TriggerState> {
        self.store.trigger_state(key)
    }

    pub fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        self.store.retrieve_trigger(key)
    }

    pub fn get_job(&self, key: &JobKey) -> Result<Option<JobDetail>> {
        self.store.retrieve_job(key)
    }

    pub fn triggers_of_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
        self.store.triggers_for_job(key)
    }

    pub fn add_calendar(
        &self,
        name: &str,
        calendar: Arc<dyn Calendar>,
        replace: bool,
        update_triggers: bool,
    ) -> Result<()> {
        self.store
            .store_calendar(name, calendar, replace, update_triggers)?;
        if update_triggers {
            self.signal.scheduling_changed(None);
        }
        Ok(())
    }

    pub fn remove_calendar(&self, name: &str) -> Result<bool> {
        self.store.remove_calendar(name)
    }

    /// Store a job + trigger pair declared in configuration, both keyed by the
    /// entry's name and group.
    ///
    /// An already stored trigger with the same schedule, priority and misfire
    /// instruction is kept as is, so restarts do not reset its fire times.
    pub fn register_entry(&self, entry: &JobEntry) -> Result<Trigger> {
        let group = entry.group.as_deref().unwrap_or(DEFAULT_GROUP);
        let schedule: ScheduleRule = serde_json::from_value(entry.schedule.clone())
            .map_err(|e| SchedulerError::InvalidSchedule(format!("{}: {e}", entry.name)))?;
        let misfire_instruction = entry
            .misfire
            .as_deref()
            .map(str::parse::<MisfireInstruction>)
            .transpose()?
            .unwrap_or_default();
        let priority = entry.priority.unwrap_or(DEFAULT_PRIORITY);

        let job = JobDetail {
            description: entry.description.clone(),
            durable: entry.durable,
            requests_recovery: entry.requests_recovery,
            concurrent_execution_disallowed: entry.concurrent_execution_disallowed,
            data: entry.data.clone(),
            ..JobDetail::new(JobKey::new(&entry.name, group), &entry.job_type)
        };
        let trigger_key = TriggerKey::new(&entry.name, group);

        if let Some(existing) = self.store.retrieve_trigger(&trigger_key)? {
            if existing.job_key == job.key
                && existing.schedule == schedule
                && existing.priority == priority
                && existing.misfire_instruction == misfire_instruction
            {
                self.store.store_job(job, true)?;
                return Ok(existing);
            }
        }

        let trigger = self.build(TriggerConfig {
            key: Some(trigger_key),
            job_key: Some(job.key.clone()),
            description: entry.description.clone(),
            priority,
            misfire_instruction,
            ..TriggerConfig::new(schedule)
        })?;
        let stored = if self.store.retrieve_job(&job.key)?.is_none() {
            self.store.store_job_and_trigger(job, trigger)?
        } else {
            self.store.store_job(job, true)?;
            self.store.store_trigger(trigger, true)?
        };
        info!(job = %stored.job_key, next = ?stored.next_fire_time, "configured job registered");
        self.changed(&stored);
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::WeekdayCalendar;
    use crate::keys::SequenceKeyGenerator;
    use crate::signal::SchedulingChange;
    use crate::store::{MemoryJobStore, StoreSettings};
    use chrono::{DateTime, Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 7, 9, 0, 0).unwrap()
    }

    fn handle() -> (SchedulerHandle, SchedulerSignal) {
        let signal = SchedulerSignal::new();
        let store = Arc::new(MemoryJobStore::new(StoreSettings::default()));
        let handle = SchedulerHandle::with_key_generator(
            store,
            signal.clone(),
            Arc::new(SequenceKeyGenerator::new("trigger")),
        );
        (handle, signal)
    }

    fn hourly() -> TriggerConfig {
        TriggerConfig {
            start_time: t0(),
            ..TriggerConfig::new(ScheduleRule::Simple(SimpleSchedule::every(
                std::time::Duration::from_secs(3600),
            )))
        }
    }

    fn job(name: &str) -> JobDetail {
        JobDetail::new(JobKey::with_default_group(name), "noop")
    }

    #[test]
    fn schedule_job_signals_the_first_fire_time() {
        let (h, signal) = handle();
        let t = h.schedule_job(job("j"), hourly()).unwrap();
        assert_eq!(t.key, TriggerKey::with_default_group("trigger-1"));
        assert_eq!(t.job_key, JobKey::with_default_group("j"));
        assert_eq!(signal.take(), Some(SchedulingChange::At(t0())));
        assert_eq!(h.trigger_state(&t.key).unwrap(), TriggerState::Normal);
    }

    #[test]
    fn add_job_requires_durability() {
        let (h, _) = handle();
        assert!(matches!(
            h.add_job(job("j"), false),
            Err(SchedulerError::NonDurableJob { .. })
        ));
        let durable = JobDetail {
            durable: true,
            ..job("j")
        };
        h.add_job(durable, false).unwrap();
        let t = h
            .schedule_trigger(TriggerConfig {
                job_key: Some(JobKey::with_default_group("j")),
                ..hourly()
            })
            .unwrap();
        assert_eq!(h.triggers_of_job(&t.job_key).unwrap(), vec![t.clone()]);
    }

    #[test]
    fn reschedule_keeps_key_and_job() {
        let (h, signal) = handle();
        let t = h.schedule_job(job("j"), hourly()).unwrap();
        signal.take();
        let later = TriggerConfig {
            start_time: t0() + Duration::days(1),
            ..hourly()
        };
        let replaced = h.reschedule_trigger(&t.key, later).unwrap().unwrap();
        assert_eq!(replaced.key, t.key);
        assert_eq!(replaced.job_key, t.job_key);
        assert_eq!(replaced.next_fire_time, Some(t0() + Duration::days(1)));
        assert_eq!(signal.take(), Some(SchedulingChange::At(t0() + Duration::days(1))));

        let missing = TriggerKey::with_default_group("nope");
        assert!(h.reschedule_trigger(&missing, hourly()).unwrap().is_none());
    }

    #[test]
    fn unschedule_removes_non_durable_job() {
        let (h, _) = handle();
        let t = h.schedule_job(job("j"), hourly()).unwrap();
        assert!(h.unschedule_trigger(&t.key).unwrap());
        assert!(!h.unschedule_trigger(&t.key).unwrap());
        assert!(h.get_job(&t.job_key).unwrap().is_none());
    }

    #[test]
    fn trigger_job_now_uses_manual_group() {
        let (h, _) = handle();
        let durable = JobDetail {
            durable: true,
            ..job("j")
        };
        h.add_job(durable, false).unwrap();
        let t = h
            .trigger_job_now(&JobKey::with_default_group("j"), serde_json::json!({"x": 1}))
            .unwrap();
        assert_eq!(t.key.group, MANUAL_TRIGGER_GROUP);
        assert_eq!(t.job_data["x"], 1);
        assert!(t.next_fire_time.is_some());

        assert!(matches!(
            h.trigger_job_now(&JobKey::with_default_group("ghost"), serde_json::Value::Null),
            Err(SchedulerError::JobNotFound { .. })
        ));
    }

    #[test]
    fn delete_job_removes_triggers() {
        let (h, _) = handle();
        let t = h.schedule_job(job("j"), hourly()).unwrap();
        assert!(h.delete_job(&t.job_key).unwrap());
        assert_eq!(h.trigger_state(&t.key).unwrap(), TriggerState::None);
        assert!(h.get_trigger(&t.key).unwrap().is_none());
    }

    #[test]
    fn pause_and_resume_job() {
        let (h, signal) = handle();
        let t = h.schedule_job(job("j"), hourly()).unwrap();
        h.pause_job(&t.job_key).unwrap();
        assert_eq!(h.trigger_state(&t.key).unwrap(), TriggerState::Paused);
        signal.take();
        h.resume_job(&t.job_key).unwrap();
        assert_eq!(h.trigger_state(&t.key).unwrap(), TriggerState::Normal);
        assert_eq!(signal.take(), Some(SchedulingChange::Unknown));
    }

    #[test]
    fn calendars_are_managed_through_the_handle() {
        let (h, _) = handle();
        h.add_calendar("weekends", Arc::new(WeekdayCalendar::weekends(chrono_tz::UTC)), false, false)
            .unwrap();
        assert!(h.remove_calendar("weekends").unwrap());
        assert!(!h.remove_calendar("weekends").unwrap());
    }

    fn entry(schedule: serde_json::Value) -> JobEntry {
        JobEntry {
            name: "report".into(),
            group: Some("nightly".into()),
            job_type: "log".into(),
            description: None,
            durable: false,
            requests_recovery: false,
            concurrent_execution_disallowed: true,
            schedule,
            priority: None,
            misfire: Some("do_nothing".into()),
            data: serde_json::Value::Null,
        }
    }

    #[test]
    fn register_entry_is_stable_across_restarts() {
        let (h, _) = handle();
        let cron = serde_json::json!({"kind": "cron", "expression": "0 2 * * *"});
        let first = h.register_entry(&entry(cron.clone())).unwrap();
        assert_eq!(first.key, TriggerKey::new("report", "nightly"));
        assert_eq!(first.misfire_instruction, MisfireInstruction::DoNothing);
        let job = h.get_job(&first.job_key).unwrap().unwrap();
        assert!(job.concurrent_execution_disallowed);

        let again = h.register_entry(&entry(cron)).unwrap();
        assert_eq!(again, first);

        let changed = h
            .register_entry(&entry(serde_json::json!({"kind": "cron", "expression": "0 3 * * *"})))
            .unwrap();
        assert_ne!(changed.schedule, first.schedule);
        assert_eq!(h.triggers_of_job(&first.job_key).unwrap().len(), 1);
    }

    #[test]
    fn register_entry_rejects_bad_schedules() {
        let (h, _) = handle();
        let bad = entry(serde_json::json!({"kind": "cron", "expression": "61 * * * *"}));
        assert!(h.register_entry(&bad).is_err());
        let unknown = entry(serde_json::json!({"kind": "sometimes"}));
        assert!(matches!(
            h.register_entry(&unknown),
            Err(SchedulerError::InvalidSchedule(_))
        ));
    }
}
