use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{
    ops, AcquiredTrigger, Acquisition, CheckIn, FiredRecord, JobStore, Records, RecoveryReport,
    StoreSettings, TriggerFiredBundle,
};
use crate::calendar::Calendar;
use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::trigger::Trigger;
use crate::types::{CompletedExecutionInstruction, JobDetail, JobKey, TriggerKey, TriggerState};

/// Wait this long for another engine's write transaction before failing.
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Job store persisted in SQLite.
///
/// Every operation runs in an IMMEDIATE transaction, so engines sharing the
/// database file serialize on its write lock and never acquire the same
/// trigger twice. Calendars are code, not data: they are registered per
/// store instance and kept in memory.
pub struct SqliteJobStore {
    inner: Mutex<SqliteInner>,
    settings: StoreSettings,
}

struct SqliteInner {
    conn: Connection,
    calendars: HashMap<String, Arc<dyn Calendar>>,
}

impl SqliteJobStore {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection, settings: StoreSettings) -> Result<Self> {
        init_db(&conn)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            inner: Mutex::new(SqliteInner {
                conn,
                calendars: HashMap::new(),
            }),
            settings,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, SqliteInner>> {
        self.inner
            .lock()
            .map_err(|_| SchedulerError::Persistence("sqlite store lock poisoned".into()))
    }

    /// Run `op` inside an IMMEDIATE transaction; commit on `Ok`, roll back on `Err`.
    fn with_tx<T>(&self, op: impl FnOnce(&mut SqliteRecords<'_>) -> Result<T>) -> Result<T> {
        let mut inner = self.lock()?;
        let SqliteInner { conn, calendars } = &mut *inner;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut records = SqliteRecords {
            conn: &tx,
            calendars,
            staged: HashMap::new(),
        };
        let value = op(&mut records)?;
        let staged = std::mem::take(&mut records.staged);
        tx.commit()?;
        // Calendars live outside the database; they only change once the
        // transaction that changed them has committed.
        for (name, calendar) in staged {
            match calendar {
                Some(calendar) => calendars.insert(name, calendar),
                None => calendars.remove(&name),
            };
        }
        Ok(value)
    }
}

fn to_ms(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| SchedulerError::Persistence(format!("timestamp out of range: {ms}")))
}

fn decode<T: serde::de::DeserializeOwned>(bodies: Vec<String>) -> Result<Vec<T>> {
    bodies
        .iter()
        .map(|b| serde_json::from_str(b).map_err(SchedulerError::from))
        .collect()
}

/// [`Records`] over an open transaction.
struct SqliteRecords<'a> {
    conn: &'a Connection,
    calendars: &'a HashMap<String, Arc<dyn Calendar>>,
    /// Calendar writes of this transaction; `None` marks a removal.
    staged: HashMap<String, Option<Arc<dyn Calendar>>>,
}

impl SqliteRecords<'_> {
    fn trigger_bodies(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Trigger>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let bodies = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        decode(bodies)
    }
}

impl Records for SqliteRecords<'_> {
    fn trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM triggers WHERE trigger_group = ?1 AND trigger_name = ?2",
                params![key.group, key.name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    fn put_trigger(&mut self, trigger: &Trigger) -> Result<()> {
        let body = serde_json::to_string(trigger)?;
        self.conn.execute(
            "INSERT INTO triggers
             (trigger_group, trigger_name, job_group, job_name, state,
              next_fire_time, priority, calendar_name, body)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT (trigger_group, trigger_name) DO UPDATE SET
                job_group = excluded.job_group,
                job_name = excluded.job_name,
                state = excluded.state,
                next_fire_time = excluded.next_fire_time,
                priority = excluded.priority,
                calendar_name = excluded.calendar_name,
                body = excluded.body",
            params![
                trigger.key.group,
                trigger.key.name,
                trigger.job_key.group,
                trigger.job_key.name,
                trigger.state.to_string(),
                trigger.next_fire_time.map(to_ms),
                trigger.priority,
                trigger.calendar_name,
                body,
            ],
        )?;
        Ok(())
    }

    fn delete_trigger(&mut self, key: &TriggerKey) -> Result<bool> {
        let n = self.conn.execute(
            "DELETE FROM triggers WHERE trigger_group = ?1 AND trigger_name = ?2",
            params![key.group, key.name],
        )?;
        Ok(n > 0)
    }

    fn triggers_of_job(&self, job: &JobKey) -> Result<Vec<Trigger>> {
        self.trigger_bodies(
            "SELECT body FROM triggers WHERE job_group = ?1 AND job_name = ?2
             ORDER BY trigger_group, trigger_name",
            params![job.group, job.name],
        )
    }

    fn triggers_with_calendar(&self, name: &str) -> Result<Vec<Trigger>> {
        self.trigger_bodies(
            "SELECT body FROM triggers WHERE calendar_name = ?1
             ORDER BY trigger_group, trigger_name",
            [name],
        )
    }

    fn triggers_in_state(&self, state: TriggerState) -> Result<Vec<Trigger>> {
        self.trigger_bodies(
            "SELECT body FROM triggers WHERE state = ?1 ORDER BY trigger_group, trigger_name",
            [state.to_string()],
        )
    }

    fn due_triggers(&self, no_later_than: DateTime<Utc>) -> Result<Vec<Trigger>> {
        // Same order as `FireOrderKey`.
        self.trigger_bodies(
            "SELECT body FROM triggers
             WHERE state = 'normal' AND acquired_by IS NULL
               AND next_fire_time IS NOT NULL AND next_fire_time <= ?1
             ORDER BY next_fire_time ASC, priority DESC, trigger_group, trigger_name",
            [to_ms(no_later_than)],
        )
    }

    fn acquisition(&self, key: &TriggerKey) -> Result<Option<Acquisition>> {
        let row: Option<(Option<String>, Option<i64>)> = self
            .conn
            .query_row(
                "SELECT acquired_by, acquired_fire_time FROM triggers
                 WHERE trigger_group = ?1 AND trigger_name = ?2",
                params![key.group, key.name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((Some(owner), Some(ms))) => Ok(Some(Acquisition {
                owner,
                fire_time: from_ms(ms)?,
            })),
            _ => Ok(None),
        }
    }

    fn set_acquisition(
        &mut self,
        key: &TriggerKey,
        acquisition: Option<&Acquisition>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE triggers SET acquired_by = ?3, acquired_fire_time = ?4
             WHERE trigger_group = ?1 AND trigger_name = ?2",
            params![
                key.group,
                key.name,
                acquisition.map(|a| a.owner.as_str()),
                acquisition.map(|a| to_ms(a.fire_time)),
            ],
        )?;
        Ok(())
    }

    fn acquisitions_of(&self, owner: &str) -> Result<Vec<(TriggerKey, Acquisition)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT trigger_group, trigger_name, acquired_fire_time FROM triggers
             WHERE acquired_by = ?1 ORDER BY trigger_group, trigger_name",
        )?;
        let rows = stmt
            .query_map([owner], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(group, name, ms)| {
                Ok((
                    TriggerKey::new(name, group),
                    Acquisition {
                        owner: owner.to_string(),
                        fire_time: from_ms(ms)?,
                    },
                ))
            })
            .collect()
    }

    fn job(&self, key: &JobKey) -> Result<Option<JobDetail>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM jobs WHERE job_group = ?1 AND job_name = ?2",
                params![key.group, key.name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    fn put_job(&mut self, job: &JobDetail) -> Result<()> {
        let body = serde_json::to_string(job)?;
        self.conn.execute(
            "INSERT INTO jobs (job_group, job_name, body) VALUES (?1,?2,?3)
             ON CONFLICT (job_group, job_name) DO UPDATE SET body = excluded.body",
            params![job.key.group, job.key.name, body],
        )?;
        Ok(())
    }

    fn delete_job(&mut self, key: &JobKey) -> Result<bool> {
        let n = self.conn.execute(
            "DELETE FROM jobs WHERE job_group = ?1 AND job_name = ?2",
            params![key.group, key.name],
        )?;
        Ok(n > 0)
    }

    fn is_job_blocked(&self, key: &JobKey) -> Result<bool> {
        let blocked: Option<bool> = self
            .conn
            .query_row(
                "SELECT blocked FROM jobs WHERE job_group = ?1 AND job_name = ?2",
                params![key.group, key.name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blocked.unwrap_or(false))
    }

    fn set_job_blocked(&mut self, key: &JobKey, blocked: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs SET blocked = ?3 WHERE job_group = ?1 AND job_name = ?2",
            params![key.group, key.name, blocked],
        )?;
        Ok(())
    }

    fn insert_fired(&mut self, record: &FiredRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO fired_triggers
             (entry_id, instance_id, trigger_group, trigger_name, job_group, job_name,
              scheduled_fire_time, fired_at, priority, requests_recovery)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                record.entry_id,
                record.instance_id,
                record.trigger_key.group,
                record.trigger_key.name,
                record.job_key.group,
                record.job_key.name,
                to_ms(record.scheduled_fire_time),
                to_ms(record.fired_at),
                record.priority,
                record.requests_recovery,
            ],
        )?;
        Ok(())
    }

    fn delete_fired(&mut self, entry_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM fired_triggers WHERE entry_id = ?1", [entry_id])?;
        Ok(())
    }

    fn fired_entries(&self) -> Result<Vec<FiredRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT entry_id, instance_id, trigger_group, trigger_name, job_group, job_name,
                    scheduled_fire_time, fired_at, priority, requests_recovery
             FROM fired_triggers ORDER BY entry_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?, // entry_id
                    row.get::<_, String>(1)?, // instance_id
                    TriggerKey::new(row.get::<_, String>(3)?, row.get::<_, String>(2)?),
                    JobKey::new(row.get::<_, String>(5)?, row.get::<_, String>(4)?),
                    row.get::<_, i64>(6)?, // scheduled_fire_time
                    row.get::<_, i64>(7)?, // fired_at
                    row.get::<_, i32>(8)?, // priority
                    row.get::<_, bool>(9)?, // requests_recovery
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(
                |(entry_id, instance_id, trigger_key, job_key, scheduled, fired, priority, recovery)| {
                    Ok(FiredRecord {
                        entry_id,
                        instance_id,
                        trigger_key,
                        job_key,
                        scheduled_fire_time: from_ms(scheduled)?,
                        fired_at: from_ms(fired)?,
                        priority,
                        requests_recovery: recovery,
                    })
                },
            )
            .collect()
    }

    fn calendar(&self, name: &str) -> Option<Arc<dyn Calendar>> {
        match self.staged.get(name) {
            Some(staged) => staged.clone(),
            None => self.calendars.get(name).cloned(),
        }
    }

    fn put_calendar(&mut self, name: &str, calendar: Arc<dyn Calendar>) {
        self.staged.insert(name.to_string(), Some(calendar));
    }

    fn delete_calendar(&mut self, name: &str) -> bool {
        let existed = self.calendar(name).is_some();
        self.staged.insert(name.to_string(), None);
        existed
    }

    fn record_check_in(&mut self, check_in: &CheckIn) -> Result<()> {
        self.conn.execute(
            "INSERT INTO scheduler_state (instance_id, last_checkin, checkin_interval)
             VALUES (?1,?2,?3)
             ON CONFLICT (instance_id) DO UPDATE SET
                last_checkin = excluded.last_checkin,
                checkin_interval = excluded.checkin_interval",
            params![
                check_in.instance_id,
                to_ms(check_in.last_check_in),
                check_in.interval.num_milliseconds(),
            ],
        )?;
        Ok(())
    }

    fn check_ins(&self) -> Result<Vec<CheckIn>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT instance_id, last_checkin, checkin_interval FROM scheduler_state
             ORDER BY instance_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(instance_id, last, interval)| {
                Ok(CheckIn {
                    instance_id,
                    last_check_in: from_ms(last)?,
                    interval: Duration::milliseconds(interval),
                })
            })
            .collect()
    }

    fn delete_check_in(&mut self, instance_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM scheduler_state WHERE instance_id = ?1",
            [instance_id],
        )?;
        Ok(())
    }
}

impl JobStore for SqliteJobStore {
    fn store_job(&self, job: JobDetail, replace: bool) -> Result<()> {
        self.with_tx(|r| ops::store_job(r, job, replace))
    }

    fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<Trigger> {
        self.with_tx(|r| ops::store_trigger(r, trigger, replace))
    }

    fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<Trigger> {
        self.with_tx(|r| ops::store_job_and_trigger(r, job, trigger))
    }

    fn replace_trigger(&self, key: &TriggerKey, trigger: Trigger) -> Result<Option<Trigger>> {
        self.with_tx(|r| ops::replace_trigger(r, key, trigger))
    }

    fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
        self.with_tx(|r| ops::remove_trigger(r, key))
    }

    fn remove_job(&self, key: &JobKey) -> Result<bool> {
        self.with_tx(|r| ops::remove_job(r, key))
    }

    fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        self.with_tx(|r| r.trigger(key))
    }

    fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>> {
        self.with_tx(|r| r.job(key))
    }

    fn triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
        self.with_tx(|r| r.triggers_of_job(key))
    }

    fn trigger_state(&self, key: &TriggerKey) -> Result<TriggerState> {
        self.with_tx(|r| ops::trigger_state(&*r, key))
    }

    fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
        self.with_tx(|r| ops::pause_trigger(r, key))
    }

    fn resume_trigger(&self, key: &TriggerKey, now: DateTime<Utc>) -> Result<()> {
        self.with_tx(|r| ops::resume_trigger(r, &self.settings, key, now))
    }

    fn pause_job(&self, key: &JobKey) -> Result<()> {
        self.with_tx(|r| ops::pause_job(r, key))
    }

    fn resume_job(&self, key: &JobKey, now: DateTime<Utc>) -> Result<()> {
        self.with_tx(|r| ops::resume_job(r, &self.settings, key, now))
    }

    fn store_calendar(
        &self,
        name: &str,
        calendar: Arc<dyn Calendar>,
        replace: bool,
        update_triggers: bool,
    ) -> Result<()> {
        self.with_tx(|r| ops::store_calendar(r, name, calendar, replace, update_triggers))
    }

    fn remove_calendar(&self, name: &str) -> Result<bool> {
        self.with_tx(|r| ops::remove_calendar(r, name))
    }

    fn retrieve_calendar(&self, name: &str) -> Result<Option<Arc<dyn Calendar>>> {
        Ok(self.lock()?.calendars.get(name).cloned())
    }

    fn acquire_next_triggers(
        &self,
        now: DateTime<Utc>,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<AcquiredTrigger>> {
        self.with_tx(|r| {
            ops::acquire_next_triggers(r, &self.settings, now, no_later_than, max_count, time_window)
        })
    }

    fn release_acquired_trigger(&self, acquired: &AcquiredTrigger) -> Result<()> {
        self.with_tx(|r| ops::release_acquired_trigger(r, &self.settings, acquired))
    }

    fn triggers_fired(
        &self,
        acquired: &[AcquiredTrigger],
        now: DateTime<Utc>,
    ) -> Result<Vec<Option<TriggerFiredBundle>>> {
        self.with_tx(|r| ops::triggers_fired(r, &self.settings, acquired, now))
    }

    fn triggered_job_complete(
        &self,
        bundle: &TriggerFiredBundle,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        self.with_tx(|r| ops::triggered_job_complete(r, bundle, instruction))
    }

    fn recover(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        self.with_tx(|r| ops::recover(r, &self.settings, now))
    }

    fn check_in(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        self.with_tx(|r| ops::check_in(r, &self.settings, now))
    }
}
