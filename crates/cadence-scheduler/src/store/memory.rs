use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use super::{
    ops, AcquiredTrigger, Acquisition, CheckIn, FiredRecord, JobStore, Records, RecoveryReport,
    StoreSettings, TriggerFiredBundle,
};
use crate::calendar::Calendar;
use crate::error::{Result, SchedulerError};
use crate::ordering::FireOrderKey;
use crate::trigger::Trigger;
use crate::types::{CompletedExecutionInstruction, JobDetail, JobKey, TriggerKey, TriggerState};

/// Job store living in process memory. Nothing survives a restart.
///
/// Due triggers are found through a fire-ordered index that holds exactly the
/// NORMAL, unacquired triggers with a next fire time.
#[derive(Debug)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    settings: StoreSettings,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobKey, JobDetail>,
    triggers: HashMap<TriggerKey, Trigger>,
    time_index: BTreeSet<FireOrderKey>,
    indexed: HashMap<TriggerKey, FireOrderKey>,
    blocked_jobs: HashSet<JobKey>,
    acquisitions: HashMap<TriggerKey, Acquisition>,
    fired: BTreeMap<String, FiredRecord>,
    calendars: HashMap<String, Arc<dyn Calendar>>,
    check_ins: HashMap<String, CheckIn>,
}

impl MemoryState {
    /// Bring the time index in line with the trigger stored under `key`.
    fn reindex(&mut self, key: &TriggerKey) {
        if let Some(old) = self.indexed.remove(key) {
            self.time_index.remove(&old);
        }
        let Some(trigger) = self.triggers.get(key) else {
            return;
        };
        if trigger.state == TriggerState::Normal
            && trigger.next_fire_time.is_some()
            && !self.acquisitions.contains_key(key)
        {
            let entry = FireOrderKey::from(trigger);
            self.time_index.insert(entry.clone());
            self.indexed.insert(key.clone(), entry);
        }
    }

    fn sorted(mut triggers: Vec<Trigger>) -> Vec<Trigger> {
        triggers.sort_by(|a, b| a.key.cmp(&b.key));
        triggers
    }
}

impl Records for MemoryState {
    fn trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        Ok(self.triggers.get(key).cloned())
    }

    fn put_trigger(&mut self, trigger: &Trigger) -> Result<()> {
        self.triggers.insert(trigger.key.clone(), trigger.clone());
        self.reindex(&trigger.key);
        Ok(())
    }

    fn delete_trigger(&mut self, key: &TriggerKey) -> Result<bool> {
        let removed = self.triggers.remove(key).is_some();
        self.acquisitions.remove(key);
        self.reindex(key);
        Ok(removed)
    }

    fn triggers_of_job(&self, job: &JobKey) -> Result<Vec<Trigger>> {
        Ok(Self::sorted(
            self.triggers
                .values()
                .filter(|t| t.job_key == *job)
                .cloned()
                .collect(),
        ))
    }

    fn triggers_with_calendar(&self, name: &str) -> Result<Vec<Trigger>> {
        Ok(Self::sorted(
            self.triggers
                .values()
                .filter(|t| t.calendar_name.as_deref() == Some(name))
                .cloned()
                .collect(),
        ))
    }

    fn triggers_in_state(&self, state: TriggerState) -> Result<Vec<Trigger>> {
        Ok(Self::sorted(
            self.triggers
                .values()
                .filter(|t| t.state == state)
                .cloned()
                .collect(),
        ))
    }

    fn due_triggers(&self, no_later_than: DateTime<Utc>) -> Result<Vec<Trigger>> {
        // Entries without a fire time are never indexed, so the scan stops at
        // the first entry past the horizon.
        Ok(self
            .time_index
            .iter()
            .take_while(|e| e.next_fire_time.is_some_and(|t| t <= no_later_than))
            .filter_map(|e| self.triggers.get(&e.key).cloned())
            .collect())
    }

    fn acquisition(&self, key: &TriggerKey) -> Result<Option<Acquisition>> {
        Ok(self.acquisitions.get(key).cloned())
    }

    fn set_acquisition(
        &mut self,
        key: &TriggerKey,
        acquisition: Option<&Acquisition>,
    ) -> Result<()> {
        match acquisition {
            Some(a) => {
                self.acquisitions.insert(key.clone(), a.clone());
            }
            None => {
                self.acquisitions.remove(key);
            }
        }
        self.reindex(key);
        Ok(())
    }

    fn acquisitions_of(&self, owner: &str) -> Result<Vec<(TriggerKey, Acquisition)>> {
        let mut owned: Vec<_> = self
            .acquisitions
            .iter()
            .filter(|(_, a)| a.owner == owner)
            .map(|(k, a)| (k.clone(), a.clone()))
            .collect();
        owned.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(owned)
    }

    fn job(&self, key: &JobKey) -> Result<Option<JobDetail>> {
        Ok(self.jobs.get(key).cloned())
    }

    fn put_job(&mut self, job: &JobDetail) -> Result<()> {
        self.jobs.insert(job.key.clone(), job.clone());
        Ok(())
    }

    fn delete_job(&mut self, key: &JobKey) -> Result<bool> {
        self.blocked_jobs.remove(key);
        Ok(self.jobs.remove(key).is_some())
    }

    fn is_job_blocked(&self, key: &JobKey) -> Result<bool> {
        Ok(self.blocked_jobs.contains(key))
    }

    fn set_job_blocked(&mut self, key: &JobKey, blocked: bool) -> Result<()> {
        if blocked {
            self.blocked_jobs.insert(key.clone());
        } else {
            self.blocked_jobs.remove(key);
        }
        Ok(())
    }

    fn insert_fired(&mut self, record: &FiredRecord) -> Result<()> {
        self.fired.insert(record.entry_id.clone(), record.clone());
        Ok(())
    }

    fn delete_fired(&mut self, entry_id: &str) -> Result<()> {
        self.fired.remove(entry_id);
        Ok(())
    }

    fn fired_entries(&self) -> Result<Vec<FiredRecord>> {
        Ok(self.fired.values().cloned().collect())
    }

    fn calendar(&self, name: &str) -> Option<Arc<dyn Calendar>> {
        self.calendars.get(name).cloned()
    }

    fn put_calendar(&mut self, name: &str, calendar: Arc<dyn Calendar>) {
        self.calendars.insert(name.to_string(), calendar);
    }

    fn delete_calendar(&mut self, name: &str) -> bool {
        self.calendars.remove(name).is_some()
    }

    fn record_check_in(&mut self, check_in: &CheckIn) -> Result<()> {
        self.check_ins
            .insert(check_in.instance_id.clone(), check_in.clone());
        Ok(())
    }

    fn check_ins(&self) -> Result<Vec<CheckIn>> {
        Ok(self.check_ins.values().cloned().collect())
    }

    fn delete_check_in(&mut self, instance_id: &str) -> Result<()> {
        self.check_ins.remove(instance_id);
        Ok(())
    }
}

impl MemoryJobStore {
    pub fn new(settings: StoreSettings) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            settings,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| SchedulerError::Persistence("memory store lock poisoned".into()))
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(StoreSettings::default())
    }
}

impl JobStore for MemoryJobStore {
    fn store_job(&self, job: JobDetail, replace: bool) -> Result<()> {
        ops::store_job(&mut *self.lock()?, job, replace)
    }

    fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<Trigger> {
        ops::store_trigger(&mut *self.lock()?, trigger, replace)
    }

    fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<Trigger> {
        ops::store_job_and_trigger(&mut *self.lock()?, job, trigger)
    }

    fn replace_trigger(&self, key: &TriggerKey, trigger: Trigger) -> Result<Option<Trigger>> {
        ops::replace_trigger(&mut *self.lock()?, key, trigger)
    }

    fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
        ops::remove_trigger(&mut *self.lock()?, key)
    }

    fn remove_job(&self, key: &JobKey) -> Result<bool> {
        ops::remove_job(&mut *self.lock()?, key)
    }

    fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        self.lock()?.trigger(key)
    }

    fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>> {
        self.lock()?.job(key)
    }

    fn triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
        self.lock()?.triggers_of_job(key)
    }

    fn trigger_state(&self, key: &TriggerKey) -> Result<TriggerState> {
        ops::trigger_state(&*self.lock()?, key)
    }

    fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
        ops::pause_trigger(&mut *self.lock()?, key)
    }

    fn resume_trigger(&self, key: &TriggerKey, now: DateTime<Utc>) -> Result<()> {
        ops::resume_trigger(&mut *self.lock()?, &self.settings, key, now)
    }

    fn pause_job(&self, key: &JobKey) -> Result<()> {
        ops::pause_job(&mut *self.lock()?, key)
    }

    fn resume_job(&self, key: &JobKey, now: DateTime<Utc>) -> Result<()> {
        ops::resume_job(&mut *self.lock()?, &self.settings, key, now)
    }

    fn store_calendar(
        &self,
        name: &str,
        calendar: Arc<dyn Calendar>,
        replace: bool,
        update_triggers: bool,
    ) -> Result<()> {
        ops::store_calendar(&mut *self.lock()?, name, calendar, replace, update_triggers)
    }

    fn remove_calendar(&self, name: &str) -> Result<bool> {
        ops::remove_calendar(&mut *self.lock()?, name)
    }

    fn retrieve_calendar(&self, name: &str) -> Result<Option<Arc<dyn Calendar>>> {
        Ok(self.lock()?.calendar(name))
    }

    fn acquire_next_triggers(
        &self,
        now: DateTime<Utc>,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<AcquiredTrigger>> {
        ops::acquire_next_triggers(
            &mut *self.lock()?,
            &self.settings,
            now,
            no_later_than,
            max_count,
            time_window,
        )
    }

    fn release_acquired_trigger(&self, acquired: &AcquiredTrigger) -> Result<()> {
        ops::release_acquired_trigger(&mut *self.lock()?, &self.settings, acquired)
    }

    fn triggers_fired(
        &self,
        acquired: &[AcquiredTrigger],
        now: DateTime<Utc>,
    ) -> Result<Vec<Option<TriggerFiredBundle>>> {
        ops::triggers_fired(&mut *self.lock()?, &self.settings, acquired, now)
    }

    fn triggered_job_complete(
        &self,
        bundle: &TriggerFiredBundle,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        ops::triggered_job_complete(&mut *self.lock()?, bundle, instruction)
    }

    fn recover(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        ops::recover(&mut *self.lock()?, &self.settings, now)
    }

    fn check_in(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        ops::check_in(&mut *self.lock()?, &self.settings, now)
    }
}
