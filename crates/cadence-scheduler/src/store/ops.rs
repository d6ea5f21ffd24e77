//! Store operations, written once against [`Records`].
//!
//! Validation happens before the first write in every operation so a failed
//! call leaves the in-memory store untouched; the SQLite store additionally
//! rolls the transaction back.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    later_by, Acquisition, AcquiredTrigger, CheckIn, FiredRecord, Records, RecoveryReport,
    StoreSettings, TriggerFiredBundle,
};
use crate::calendar::Calendar;
use crate::error::{Result, SchedulerError};
use crate::misfire::{apply_misfire, MisfireInstruction};
use crate::ordering::FireOrderKey;
use crate::schedule::{ScheduleRule, SimpleSchedule};
use crate::trigger::{Trigger, TriggerConfig};
use crate::types::{
    CompletedExecutionInstruction, JobDetail, JobKey, TriggerKey, TriggerState, RECOVERY_GROUP,
};

/// Slack added to twice a peer's check-in interval before it is declared dead.
const CHECKIN_GRACE_MS: i64 = 7_500;

fn calendar_for(r: &dyn Records, trigger: &Trigger) -> Result<Option<Arc<dyn Calendar>>> {
    match &trigger.calendar_name {
        None => Ok(None),
        Some(name) => r
            .calendar(name)
            .map(Some)
            .ok_or_else(|| SchedulerError::CalendarNotFound { name: name.clone() }),
    }
}

/// Compute the first fire time (if missing) and the initial state.
fn arm_trigger(r: &dyn Records, mut trigger: Trigger) -> Result<Trigger> {
    let calendar = calendar_for(r, &trigger)?;
    if trigger.next_fire_time.is_none()
        && trigger.compute_first_fire_time(calendar.as_deref()).is_none()
    {
        return Err(SchedulerError::WillNeverFire {
            key: trigger.key.to_string(),
        });
    }
    trigger.state = if r.is_job_blocked(&trigger.job_key)? {
        TriggerState::Blocked
    } else {
        TriggerState::Normal
    };
    Ok(trigger)
}

pub(crate) fn store_job(r: &mut dyn Records, job: JobDetail, replace: bool) -> Result<()> {
    if !replace && r.job(&job.key)?.is_some() {
        return Err(SchedulerError::AlreadyExists {
            key: job.key.to_string(),
        });
    }
    r.put_job(&job)
}

pub(crate) fn store_trigger(
    r: &mut dyn Records,
    trigger: Trigger,
    replace: bool,
) -> Result<Trigger> {
    if r.job(&trigger.job_key)?.is_none() {
        return Err(SchedulerError::JobNotFound {
            key: trigger.job_key.to_string(),
        });
    }
    let existing = r.trigger(&trigger.key)?;
    if existing.is_some() && !replace {
        return Err(SchedulerError::AlreadyExists {
            key: trigger.key.to_string(),
        });
    }
    let trigger = arm_trigger(r, trigger)?;
    r.put_trigger(&trigger)?;
    if existing.is_some() {
        // A replaced trigger is no longer the one an engine claimed.
        r.set_acquisition(&trigger.key, None)?;
    }
    Ok(trigger)
}

pub(crate) fn store_job_and_trigger(
    r: &mut dyn Records,
    job: JobDetail,
    trigger: Trigger,
) -> Result<Trigger> {
    if trigger.job_key != job.key {
        return Err(SchedulerError::InvalidTrigger {
            key: trigger.key.to_string(),
            reason: format!("trigger fires {} but is stored with {}", trigger.job_key, job.key),
        });
    }
    if r.job(&job.key)?.is_some() {
        return Err(SchedulerError::AlreadyExists {
            key: job.key.to_string(),
        });
    }
    if r.trigger(&trigger.key)?.is_some() {
        return Err(SchedulerError::AlreadyExists {
            key: trigger.key.to_string(),
        });
    }
    let trigger = arm_trigger(r, trigger)?;
    r.put_job(&job)?;
    r.put_trigger(&trigger)?;
    Ok(trigger)
}

pub(crate) fn replace_trigger(
    r: &mut dyn Records,
    key: &TriggerKey,
    trigger: Trigger,
) -> Result<Option<Trigger>> {
    let Some(old) = r.trigger(key)? else {
        return Ok(None);
    };
    if trigger.job_key != old.job_key {
        return Err(SchedulerError::InvalidTrigger {
            key: trigger.key.to_string(),
            reason: format!("replacement must fire {}", old.job_key),
        });
    }
    if trigger.key != *key && r.trigger(&trigger.key)?.is_some() {
        return Err(SchedulerError::AlreadyExists {
            key: trigger.key.to_string(),
        });
    }
    let trigger = arm_trigger(r, trigger)?;
    // Delete without the orphan check: the job keeps the replacement.
    r.delete_trigger(key)?;
    r.put_trigger(&trigger)?;
    Ok(Some(trigger))
}

pub(crate) fn remove_trigger(r: &mut dyn Records, key: &TriggerKey) -> Result<bool> {
    let Some(trigger) = r.trigger(key)? else {
        return Ok(false);
    };
    r.delete_trigger(key)?;
    remove_orphaned_job(r, &trigger.job_key)?;
    Ok(true)
}

fn remove_orphaned_job(r: &mut dyn Records, key: &JobKey) -> Result<()> {
    let Some(job) = r.job(key)? else {
        return Ok(());
    };
    if !job.durable && r.triggers_of_job(key)?.is_empty() {
        r.delete_job(key)?;
        debug!(job = %key, "non-durable job removed with its last trigger");
    }
    Ok(())
}

pub(crate) fn remove_job(r: &mut dyn Records, key: &JobKey) -> Result<bool> {
    let triggers = r.triggers_of_job(key)?;
    for trigger in &triggers {
        r.delete_trigger(&trigger.key)?;
    }
    let removed = r.delete_job(key)?;
    Ok(removed || !triggers.is_empty())
}

pub(crate) fn trigger_state(r: &dyn Records, key: &TriggerKey) -> Result<TriggerState> {
    Ok(r.trigger(key)?.map_or(TriggerState::None, |t| t.state))
}

fn require_trigger(r: &dyn Records, key: &TriggerKey) -> Result<Trigger> {
    r.trigger(key)?
        .ok_or_else(|| SchedulerError::TriggerNotFound {
            key: key.to_string(),
        })
}

fn require_job(r: &dyn Records, key: &JobKey) -> Result<JobDetail> {
    r.job(key)?.ok_or_else(|| SchedulerError::JobNotFound {
        key: key.to_string(),
    })
}

pub(crate) fn pause_trigger(r: &mut dyn Records, key: &TriggerKey) -> Result<()> {
    let trigger = require_trigger(r, key)?;
    pause(r, trigger)
}

fn pause(r: &mut dyn Records, mut trigger: Trigger) -> Result<()> {
    if matches!(trigger.state, TriggerState::Normal | TriggerState::Blocked) {
        trigger.state = TriggerState::Paused;
        r.put_trigger(&trigger)?;
        debug!(trigger = %trigger.key, "trigger paused");
    }
    Ok(())
}

pub(crate) fn resume_trigger(
    r: &mut dyn Records,
    settings: &StoreSettings,
    key: &TriggerKey,
    now: DateTime<Utc>,
) -> Result<()> {
    let trigger = require_trigger(r, key)?;
    resume(r, settings, trigger, now)
}

fn resume(
    r: &mut dyn Records,
    settings: &StoreSettings,
    mut trigger: Trigger,
    now: DateTime<Utc>,
) -> Result<()> {
    if trigger.state != TriggerState::Paused {
        return Ok(());
    }
    let calendar = calendar_for(r, &trigger)?;
    trigger.state = if r.is_job_blocked(&trigger.job_key)? {
        TriggerState::Blocked
    } else {
        TriggerState::Normal
    };
    if apply_misfire(&mut trigger, calendar.as_deref(), now, settings.misfire_threshold) {
        warn!(
            trigger = %trigger.key,
            next = ?trigger.next_fire_time,
            "resumed trigger had misfired"
        );
        if trigger.next_fire_time.is_none() {
            trigger.state = TriggerState::Complete;
        }
    }
    r.put_trigger(&trigger)?;
    debug!(trigger = %trigger.key, state = %trigger.state, "trigger resumed");
    Ok(())
}

pub(crate) fn pause_job(r: &mut dyn Records, key: &JobKey) -> Result<()> {
    require_job(r, key)?;
    for trigger in r.triggers_of_job(key)? {
        pause(r, trigger)?;
    }
    Ok(())
}

pub(crate) fn resume_job(
    r: &mut dyn Records,
    settings: &StoreSettings,
    key: &JobKey,
    now: DateTime<Utc>,
) -> Result<()> {
    require_job(r, key)?;
    for trigger in r.triggers_of_job(key)? {
        resume(r, settings, trigger, now)?;
    }
    Ok(())
}

pub(crate) fn store_calendar(
    r: &mut dyn Records,
    name: &str,
    calendar: Arc<dyn Calendar>,
    replace: bool,
    update_triggers: bool,
) -> Result<()> {
    if !replace && r.calendar(name).is_some() {
        return Err(SchedulerError::AlreadyExists {
            key: name.to_string(),
        });
    }
    r.put_calendar(name, Arc::clone(&calendar));
    if !update_triggers {
        return Ok(());
    }
    for mut trigger in r.triggers_with_calendar(name)? {
        if matches!(trigger.state, TriggerState::Complete | TriggerState::Error) {
            continue;
        }
        trigger.update_with_new_calendar(Some(calendar.as_ref()));
        if trigger.next_fire_time.is_none() {
            trigger.state = TriggerState::Complete;
        }
        r.put_trigger(&trigger)?;
    }
    Ok(())
}

pub(crate) fn remove_calendar(r: &mut dyn Records, name: &str) -> Result<bool> {
    if let Some(trigger) = r.triggers_with_calendar(name)?.first() {
        return Err(SchedulerError::CalendarInUse {
            name: name.to_string(),
            trigger: trigger.key.to_string(),
        });
    }
    Ok(r.delete_calendar(name))
}

pub(crate) fn acquire_next_triggers(
    r: &mut dyn Records,
    settings: &StoreSettings,
    now: DateTime<Utc>,
    no_later_than: DateTime<Utc>,
    max_count: usize,
    time_window: Duration,
) -> Result<Vec<AcquiredTrigger>> {
    let mut acquired = Vec::new();
    if max_count == 0 {
        return Ok(acquired);
    }
    let horizon = later_by(no_later_than.max(now), time_window);
    let mut batch_end = no_later_than;
    // Non-concurrent jobs get at most one trigger per batch.
    let mut exclusive_jobs = HashSet::new();

    // Corrected triggers go back into the candidates under their new fire
    // time, so the batch is always taken in fire order.
    let mut candidates: BTreeMap<FireOrderKey, Trigger> = r
        .due_triggers(horizon)?
        .into_iter()
        .map(|t| (FireOrderKey::from(&t), t))
        .collect();

    while let Some((_, mut trigger)) = candidates.pop_first() {
        if acquired.len() >= max_count {
            break;
        }
        let Some(job) = r.job(&trigger.job_key)? else {
            warn!(
                trigger = %trigger.key,
                job = %trigger.job_key,
                "trigger fires a missing job; skipped"
            );
            continue;
        };
        let calendar = match calendar_for(r, &trigger) {
            Ok(calendar) => calendar,
            Err(e) => {
                warn!(trigger = %trigger.key, "skipping trigger: {e}");
                continue;
            }
        };

        if apply_misfire(&mut trigger, calendar.as_deref(), now, settings.misfire_threshold) {
            warn!(
                trigger = %trigger.key,
                next = ?trigger.next_fire_time,
                "misfired trigger corrected"
            );
            if trigger.next_fire_time.is_none() {
                trigger.state = TriggerState::Complete;
            }
            r.put_trigger(&trigger)?;
            if trigger.next_fire_time.is_some_and(|next| next <= horizon) {
                candidates.insert(FireOrderKey::from(&trigger), trigger);
            }
            continue;
        }
        let Some(fire_time) = trigger.next_fire_time else {
            continue;
        };
        if fire_time > batch_end {
            continue;
        }
        if job.concurrent_execution_disallowed && !exclusive_jobs.insert(job.key.clone()) {
            continue;
        }

        let snapshot = trigger.clone();
        trigger.next_fire_time = trigger.next_fire_time_after(fire_time, calendar.as_deref());
        r.put_trigger(&trigger)?;
        r.set_acquisition(
            &trigger.key,
            Some(&Acquisition {
                owner: settings.instance_id.clone(),
                fire_time,
            }),
        )?;
        if acquired.is_empty() {
            batch_end = later_by(fire_time.max(now), time_window);
        }
        debug!(trigger = %trigger.key, %fire_time, "trigger acquired");
        acquired.push(AcquiredTrigger {
            trigger: snapshot,
            fire_time,
        });
    }
    Ok(acquired)
}

/// Undo an acquisition: the trigger's next fire time goes back to the
/// claimed time. Its state is left alone.
fn restore(r: &mut dyn Records, key: &TriggerKey, acquisition: &Acquisition) -> Result<()> {
    if let Some(mut trigger) = r.trigger(key)? {
        trigger.next_fire_time = Some(acquisition.fire_time);
        r.put_trigger(&trigger)?;
    }
    r.set_acquisition(key, None)
}

fn owned_acquisition(
    r: &dyn Records,
    settings: &StoreSettings,
    acquired: &AcquiredTrigger,
) -> Result<Option<Acquisition>> {
    Ok(r.acquisition(&acquired.trigger.key)?.filter(|a| {
        a.owner == settings.instance_id && a.fire_time == acquired.fire_time
    }))
}

pub(crate) fn release_acquired_trigger(
    r: &mut dyn Records,
    settings: &StoreSettings,
    acquired: &AcquiredTrigger,
) -> Result<()> {
    if let Some(acquisition) = owned_acquisition(r, settings, acquired)? {
        restore(r, &acquired.trigger.key, &acquisition)?;
        debug!(trigger = %acquired.trigger.key, "acquired trigger released");
    }
    Ok(())
}

pub(crate) fn triggers_fired(
    r: &mut dyn Records,
    settings: &StoreSettings,
    acquired: &[AcquiredTrigger],
    now: DateTime<Utc>,
) -> Result<Vec<Option<TriggerFiredBundle>>> {
    acquired
        .iter()
        .map(|a| trigger_fired(r, settings, a, now))
        .collect()
}

fn trigger_fired(
    r: &mut dyn Records,
    settings: &StoreSettings,
    acquired: &AcquiredTrigger,
    now: DateTime<Utc>,
) -> Result<Option<TriggerFiredBundle>> {
    let key = &acquired.trigger.key;
    let Some(acquisition) = owned_acquisition(r, settings, acquired)? else {
        return Ok(None);
    };
    let Some(current) = r.trigger(key)? else {
        return Ok(None);
    };
    if current.state != TriggerState::Normal {
        restore(r, key, &acquisition)?;
        return Ok(None);
    }
    let calendar = match &current.calendar_name {
        None => None,
        Some(name) => match r.calendar(name) {
            Some(calendar) => Some(calendar),
            None => {
                restore(r, key, &acquisition)?;
                return Ok(None);
            }
        },
    };
    let Some(job) = r.job(&current.job_key)? else {
        restore(r, key, &acquisition)?;
        return Ok(None);
    };

    let mut fired = acquired.trigger.clone();
    let previous_fire_time = fired.previous_fire_time;
    fired.triggered(calendar.as_deref());
    if fired.next_fire_time.is_none() {
        fired.state = TriggerState::Complete;
    }

    let entry_id = Uuid::now_v7().to_string();
    r.insert_fired(&FiredRecord {
        entry_id: entry_id.clone(),
        instance_id: settings.instance_id.clone(),
        trigger_key: key.clone(),
        job_key: job.key.clone(),
        scheduled_fire_time: acquired.fire_time,
        fired_at: now,
        priority: fired.priority,
        requests_recovery: job.requests_recovery,
    })?;

    if job.concurrent_execution_disallowed {
        for mut sibling in r.triggers_of_job(&job.key)? {
            if sibling.key != *key && sibling.state == TriggerState::Normal {
                sibling.state = TriggerState::Blocked;
                r.put_trigger(&sibling)?;
            }
        }
        if fired.state == TriggerState::Normal {
            fired.state = TriggerState::Blocked;
        }
        r.set_job_blocked(&job.key, true)?;
    }
    r.put_trigger(&fired)?;
    r.set_acquisition(key, None)?;

    Ok(Some(TriggerFiredBundle {
        recovering: key.group == RECOVERY_GROUP,
        next_fire_time: fired.next_fire_time,
        job,
        trigger: fired,
        fire_time: now,
        scheduled_fire_time: acquired.fire_time,
        previous_fire_time,
        entry_id,
    }))
}

fn set_state(r: &mut dyn Records, key: &TriggerKey, state: TriggerState) -> Result<()> {
    if let Some(mut trigger) = r.trigger(key)? {
        trigger.state = state;
        r.put_trigger(&trigger)?;
    }
    Ok(())
}

fn set_job_triggers_state(r: &mut dyn Records, job: &JobKey, state: TriggerState) -> Result<()> {
    for mut trigger in r.triggers_of_job(job)? {
        trigger.state = state;
        r.put_trigger(&trigger)?;
    }
    Ok(())
}

fn unblock_job(r: &mut dyn Records, job: &JobKey) -> Result<()> {
    r.set_job_blocked(job, false)?;
    for mut trigger in r.triggers_of_job(job)? {
        if trigger.state == TriggerState::Blocked {
            trigger.state = TriggerState::Normal;
            r.put_trigger(&trigger)?;
        }
    }
    Ok(())
}

pub(crate) fn triggered_job_complete(
    r: &mut dyn Records,
    bundle: &TriggerFiredBundle,
    instruction: CompletedExecutionInstruction,
) -> Result<()> {
    use CompletedExecutionInstruction as I;

    r.delete_fired(&bundle.entry_id)?;
    let job_key = &bundle.job.key;
    if bundle.job.concurrent_execution_disallowed {
        unblock_job(r, job_key)?;
    }

    let key = &bundle.trigger.key;
    match instruction {
        I::Noop | I::ReExecuteJob => {}
        I::DeleteTrigger => {
            let stored = r.trigger(key)?;
            // The job may have rescheduled its own trigger while running.
            let rescheduled = bundle.trigger.next_fire_time.is_none()
                && stored.as_ref().is_some_and(|t| t.next_fire_time.is_some());
            if stored.is_some() && !rescheduled {
                remove_trigger(r, key)?;
            }
        }
        I::SetTriggerComplete => set_state(r, key, TriggerState::Complete)?,
        I::SetTriggerError => {
            warn!(trigger = %key, "trigger set to error state");
            set_state(r, key, TriggerState::Error)?;
        }
        I::SetAllJobTriggersComplete => set_job_triggers_state(r, job_key, TriggerState::Complete)?,
        I::SetAllJobTriggersError => {
            warn!(job = %job_key, "all triggers of job set to error state");
            set_job_triggers_state(r, job_key, TriggerState::Error)?;
        }
    }
    debug!(trigger = %key, %instruction, "execution completed");
    Ok(())
}

fn schedule_recovery(
    r: &mut dyn Records,
    settings: &StoreSettings,
    job: &JobDetail,
    entry: &FiredRecord,
    now: DateTime<Utc>,
) -> Result<()> {
    let config = TriggerConfig {
        key: Some(TriggerKey::new(
            format!("recover_{}_{}", entry.instance_id, settings.keys.unique_name()),
            RECOVERY_GROUP,
        )),
        job_key: Some(job.key.clone()),
        priority: entry.priority,
        start_time: now,
        misfire_instruction: MisfireInstruction::IgnoreMisfire,
        job_data: serde_json::json!({
            "recovered_trigger": entry.trigger_key.to_string(),
            "scheduled_fire_time": entry.scheduled_fire_time.to_rfc3339(),
        }),
        ..TriggerConfig::new(ScheduleRule::Simple(SimpleSchedule::once()))
    };
    let trigger = arm_trigger(r, Trigger::from_config(config, settings.keys.as_ref())?)?;
    r.put_trigger(&trigger)?;
    info!(job = %job.key, trigger = %trigger.key, "interrupted job scheduled for recovery");
    Ok(())
}

/// Hand back the acquisitions and fired entries `instance` left behind.
fn recover_instance(
    r: &mut dyn Records,
    settings: &StoreSettings,
    instance: &str,
    now: DateTime<Utc>,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    for (key, acquisition) in r.acquisitions_of(instance)? {
        restore(r, &key, &acquisition)?;
        report.released += 1;
    }
    for entry in r.fired_entries()? {
        if entry.instance_id != instance {
            continue;
        }
        if entry.requests_recovery {
            if let Some(job) = r.job(&entry.job_key)? {
                schedule_recovery(r, settings, &job, &entry, now)?;
                report.recovered_jobs += 1;
            }
        }
        if r.is_job_blocked(&entry.job_key)? {
            unblock_job(r, &entry.job_key)?;
        }
        r.delete_fired(&entry.entry_id)?;
    }
    Ok(report)
}

pub(crate) fn recover(
    r: &mut dyn Records,
    settings: &StoreSettings,
    now: DateTime<Utc>,
) -> Result<RecoveryReport> {
    let mut report = recover_instance(r, settings, &settings.instance_id, now)?;

    // Blocked with nothing running anywhere: stale.
    let running: HashSet<JobKey> = r.fired_entries()?.into_iter().map(|e| e.job_key).collect();
    for trigger in r.triggers_in_state(TriggerState::Blocked)? {
        if !running.contains(&trigger.job_key) {
            unblock_job(r, &trigger.job_key)?;
        }
    }

    for mut trigger in r.triggers_in_state(TriggerState::Normal)? {
        if r.acquisition(&trigger.key)?.is_some() {
            continue;
        }
        let Ok(calendar) = calendar_for(r, &trigger) else {
            continue;
        };
        if apply_misfire(&mut trigger, calendar.as_deref(), now, settings.misfire_threshold) {
            if trigger.next_fire_time.is_none() {
                trigger.state = TriggerState::Complete;
            }
            r.put_trigger(&trigger)?;
            report.misfired += 1;
        }
    }
    Ok(report)
}

pub(crate) fn check_in(
    r: &mut dyn Records,
    settings: &StoreSettings,
    now: DateTime<Utc>,
) -> Result<RecoveryReport> {
    r.record_check_in(&CheckIn {
        instance_id: settings.instance_id.clone(),
        last_check_in: now,
        interval: settings.checkin_interval,
    })?;
    let mut report = RecoveryReport::default();
    for peer in r.check_ins()? {
        if peer.instance_id == settings.instance_id {
            continue;
        }
        let Some(deadline) = peer
            .interval
            .checked_mul(2)
            .and_then(|d| d.checked_add(&Duration::milliseconds(CHECKIN_GRACE_MS)))
            .and_then(|d| peer.last_check_in.checked_add_signed(d))
        else {
            continue;
        };
        if deadline >= now {
            continue;
        }
        warn!(
            instance = %peer.instance_id,
            last_check_in = %peer.last_check_in,
            "peer stopped checking in; recovering its work"
        );
        report.absorb(recover_instance(r, settings, &peer.instance_id, now)?);
        r.delete_check_in(&peer.instance_id)?;
        report.failed_instances.push(peer.instance_id);
    }
    Ok(report)
}
