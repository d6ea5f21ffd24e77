//! The persistence and locking collaborator of the engine.
//!
//! [`JobStore`] is the interface the engine and the handle program against.
//! Both bundled stores implement it by running the shared operations in
//! [`ops`] against their own [`Records`]: an in-process map set for
//! [`MemoryJobStore`] and an IMMEDIATE SQLite transaction for
//! [`SqliteJobStore`]. Every operation runs while the store's lock (or the
//! database write lock) is held, so trigger state changes are atomic with
//! respect to other engines sharing the store.

pub mod memory;
mod ops;
pub mod sqlite;

use std::fmt;
use std::sync::Arc;

use cadence_core::SchedulerConfig;
use chrono::{DateTime, Duration, Utc};

use crate::calendar::Calendar;
use crate::error::Result;
use crate::keys::{KeyGenerator, UuidKeyGenerator};
use crate::trigger::Trigger;
use crate::types::{CompletedExecutionInstruction, JobDetail, JobKey, TriggerKey, TriggerState};

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

/// Store-side tunables.
#[derive(Clone)]
pub struct StoreSettings {
    /// Owner recorded on acquired triggers and fired entries.
    pub instance_id: String,
    pub misfire_threshold: Duration,
    pub checkin_interval: Duration,
    /// Names the one-shot triggers created by crash recovery.
    pub keys: Arc<dyn KeyGenerator>,
}

impl StoreSettings {
    pub fn with_key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = keys;
        self
    }
}

impl fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSettings")
            .field("instance_id", &self.instance_id)
            .field("misfire_threshold", &self.misfire_threshold)
            .field("checkin_interval", &self.checkin_interval)
            .finish_non_exhaustive()
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for StoreSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            misfire_threshold: millis(config.misfire_threshold_ms),
            checkin_interval: millis(config.checkin_interval_ms),
            keys: Arc::new(UuidKeyGenerator),
        }
    }
}

/// `time + delta`, pinned to the latest representable instant on overflow.
pub(crate) fn later_by(time: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    time.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

/// A trigger claimed for firing.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredTrigger {
    /// The trigger as it was before the store advanced its next fire time.
    pub trigger: Trigger,
    /// The scheduled time this acquisition is for.
    pub fire_time: DateTime<Utc>,
}

/// Everything an execution needs, produced by [`JobStore::triggers_fired`].
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerFiredBundle {
    pub job: JobDetail,
    /// The trigger after the firing was recorded.
    pub trigger: Trigger,
    /// When the firing actually happened.
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Fired by a recovery trigger after another run of the job was interrupted.
    pub recovering: bool,
    /// Identifies the fired-trigger entry until the execution completes.
    pub entry_id: String,
}

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Acquisitions handed back.
    pub released: usize,
    /// Jobs re-fired through a recovery trigger.
    pub recovered_jobs: usize,
    /// Triggers whose misfire instruction was applied.
    pub misfired: usize,
    /// Peer instances declared dead by a check-in.
    pub failed_instances: Vec<String>,
}

impl RecoveryReport {
    fn absorb(&mut self, other: RecoveryReport) {
        self.released += other.released;
        self.recovered_jobs += other.recovered_jobs;
        self.misfired += other.misfired;
        self.failed_instances.extend(other.failed_instances);
    }
}

/// Durable home of jobs, triggers and calendars, and arbiter of which engine
/// may fire a trigger.
///
/// Operations taking `now` use it for misfire decisions and fire records;
/// callers pass the wall clock.
pub trait JobStore: Send + Sync {
    /// Store a job. Fails with `AlreadyExists` unless `replace` is set.
    fn store_job(&self, job: JobDetail, replace: bool) -> Result<()>;

    /// Store a trigger for an existing job, computing its first fire time if
    /// it has none. Returns the stored trigger.
    fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<Trigger>;

    /// Store a new job together with its first trigger, atomically.
    fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<Trigger>;

    /// Swap the trigger at `key` for `trigger`, which must fire the same job.
    /// `None` when nothing is stored under `key`.
    fn replace_trigger(&self, key: &TriggerKey, trigger: Trigger) -> Result<Option<Trigger>>;

    /// Remove a trigger; a non-durable job losing its last trigger goes with it.
    fn remove_trigger(&self, key: &TriggerKey) -> Result<bool>;

    /// Remove a job and all of its triggers.
    fn remove_job(&self, key: &JobKey) -> Result<bool>;

    fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>>;

    fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>>;

    fn triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>>;

    /// `TriggerState::None` for unknown keys.
    fn trigger_state(&self, key: &TriggerKey) -> Result<TriggerState>;

    fn pause_trigger(&self, key: &TriggerKey) -> Result<()>;

    /// Resume a paused trigger, applying its misfire instruction if its next
    /// fire time has passed.
    fn resume_trigger(&self, key: &TriggerKey, now: DateTime<Utc>) -> Result<()>;

    fn pause_job(&self, key: &JobKey) -> Result<()>;

    fn resume_job(&self, key: &JobKey, now: DateTime<Utc>) -> Result<()>;

    /// Register a calendar. With `update_triggers`, triggers referencing it
    /// get their next fire time recomputed.
    fn store_calendar(
        &self,
        name: &str,
        calendar: Arc<dyn Calendar>,
        replace: bool,
        update_triggers: bool,
    ) -> Result<()>;

    /// Fails with `CalendarInUse` while a trigger references the calendar.
    fn remove_calendar(&self, name: &str) -> Result<bool>;

    fn retrieve_calendar(&self, name: &str) -> Result<Option<Arc<dyn Calendar>>>;

    /// Claim up to `max_count` NORMAL triggers due by `no_later_than`, in fire
    /// order. Triggers due within `time_window` of the first one join the
    /// batch. Misfired triggers are corrected on the way; each claimed
    /// trigger's stored next fire time is advanced past the claimed one.
    fn acquire_next_triggers(
        &self,
        now: DateTime<Utc>,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<AcquiredTrigger>>;

    /// Hand back a claimed trigger that will not be fired.
    fn release_acquired_trigger(&self, acquired: &AcquiredTrigger) -> Result<()>;

    /// Record the firing of claimed triggers. An entry is `None` when its
    /// trigger was removed, paused, replaced or lost its calendar since it
    /// was claimed.
    fn triggers_fired(
        &self,
        acquired: &[AcquiredTrigger],
        now: DateTime<Utc>,
    ) -> Result<Vec<Option<TriggerFiredBundle>>>;

    /// Apply the completion instruction of a finished execution.
    fn triggered_job_complete(
        &self,
        bundle: &TriggerFiredBundle,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()>;

    /// Startup recovery for this instance: release its stale acquisitions,
    /// re-fire interrupted jobs that request recovery, unblock jobs and apply
    /// misfire instructions.
    fn recover(&self, now: DateTime<Utc>) -> Result<RecoveryReport>;

    /// Record this instance's heartbeat and recover the work of peers that
    /// stopped checking in.
    fn check_in(&self, now: DateTime<Utc>) -> Result<RecoveryReport>;
}

/// An engine's claim on a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Acquisition {
    pub owner: String,
    pub fire_time: DateTime<Utc>,
}

/// A firing whose execution has not completed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FiredRecord {
    pub entry_id: String,
    pub instance_id: String,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    pub scheduled_fire_time: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    pub priority: i32,
    pub requests_recovery: bool,
}

/// Last heartbeat of an engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CheckIn {
    pub instance_id: String,
    pub last_check_in: DateTime<Utc>,
    pub interval: Duration,
}

/// Row-level access a store gives to [`ops`].
///
/// Implementations hold no scheduling rules. Writing a trigger keeps its
/// acquisition; deleting one drops it.
pub(crate) trait Records {
    fn trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>>;
    fn put_trigger(&mut self, trigger: &Trigger) -> Result<()>;
    fn delete_trigger(&mut self, key: &TriggerKey) -> Result<bool>;
    fn triggers_of_job(&self, job: &JobKey) -> Result<Vec<Trigger>>;
    fn triggers_with_calendar(&self, name: &str) -> Result<Vec<Trigger>>;
    fn triggers_in_state(&self, state: TriggerState) -> Result<Vec<Trigger>>;
    /// NORMAL, unacquired triggers due by `no_later_than`, in fire order.
    fn due_triggers(&self, no_later_than: DateTime<Utc>) -> Result<Vec<Trigger>>;

    fn acquisition(&self, key: &TriggerKey) -> Result<Option<Acquisition>>;
    fn set_acquisition(&mut self, key: &TriggerKey, acquisition: Option<&Acquisition>)
        -> Result<()>;
    fn acquisitions_of(&self, owner: &str) -> Result<Vec<(TriggerKey, Acquisition)>>;

    fn job(&self, key: &JobKey) -> Result<Option<JobDetail>>;
    fn put_job(&mut self, job: &JobDetail) -> Result<()>;
    fn delete_job(&mut self, key: &JobKey) -> Result<bool>;
    fn is_job_blocked(&self, key: &JobKey) -> Result<bool>;
    fn set_job_blocked(&mut self, key: &JobKey, blocked: bool) -> Result<()>;

    fn insert_fired(&mut self, record: &FiredRecord) -> Result<()>;
    fn delete_fired(&mut self, entry_id: &str) -> Result<()>;
    fn fired_entries(&self) -> Result<Vec<FiredRecord>>;

    fn calendar(&self, name: &str) -> Option<Arc<dyn Calendar>>;
    fn put_calendar(&mut self, name: &str, calendar: Arc<dyn Calendar>);
    fn delete_calendar(&mut self, name: &str) -> bool;

    fn record_check_in(&mut self, check_in: &CheckIn) -> Result<()>;
    fn check_ins(&self) -> Result<Vec<CheckIn>>;
    fn delete_check_in(&mut self, instance_id: &str) -> Result<()>;
}
