use rusqlite::Connection;

use crate::error::Result;

/// Initialise the job store schema in `conn`.
///
/// Idempotent. Times are stored as Unix milliseconds. Each row carries its
/// full record as JSON in `body`; the other columns are copies kept for
/// selection and locking.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            job_group   TEXT    NOT NULL,
            job_name    TEXT    NOT NULL,
            body        TEXT    NOT NULL,   -- JSON-encoded JobDetail
            blocked     INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (job_group, job_name)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS triggers (
            trigger_group       TEXT    NOT NULL,
            trigger_name        TEXT    NOT NULL,
            job_group           TEXT    NOT NULL,
            job_name            TEXT    NOT NULL,
            state               TEXT    NOT NULL,
            next_fire_time      INTEGER,            -- NULL once exhausted
            priority            INTEGER NOT NULL,
            calendar_name       TEXT,
            acquired_by         TEXT,               -- instance id, NULL when free
            acquired_fire_time  INTEGER,
            body                TEXT    NOT NULL,   -- JSON-encoded Trigger
            PRIMARY KEY (trigger_group, trigger_name)
        ) STRICT;

        -- Acquisition: WHERE state = 'normal' AND next_fire_time <= ? ORDER BY next_fire_time
        CREATE INDEX IF NOT EXISTS idx_triggers_due ON triggers (state, next_fire_time);
        CREATE INDEX IF NOT EXISTS idx_triggers_job ON triggers (job_group, job_name);

        CREATE TABLE IF NOT EXISTS fired_triggers (
            entry_id            TEXT    NOT NULL PRIMARY KEY,
            instance_id         TEXT    NOT NULL,
            trigger_group       TEXT    NOT NULL,
            trigger_name        TEXT    NOT NULL,
            job_group           TEXT    NOT NULL,
            job_name            TEXT    NOT NULL,
            scheduled_fire_time INTEGER NOT NULL,
            fired_at            INTEGER NOT NULL,
            priority            INTEGER NOT NULL,
            requests_recovery   INTEGER NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS scheduler_state (
            instance_id         TEXT    NOT NULL PRIMARY KEY,
            last_checkin        INTEGER NOT NULL,
            checkin_interval    INTEGER NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
