use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// Misfires and job failures are not errors: the first is handled by the
/// misfire policy, the second travels through the completion protocol as a
/// [`crate::completion::JobExecutionError`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A persisted record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The schedule rule parameters are malformed (bad cron field, zero interval, ...).
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The trigger configuration is inconsistent (unbound job, end before start, ...).
    #[error("Invalid trigger {key}: {reason}")]
    InvalidTrigger { key: String, reason: String },

    /// The trigger's schedule produces no fire time at all.
    #[error("Trigger {key} will never fire with its configured schedule")]
    WillNeverFire { key: String },

    /// A trigger or job with the same key is already stored and replacement was not requested.
    #[error("Object already exists: {key}")]
    AlreadyExists { key: String },

    /// No trigger with the given key exists in the store.
    #[error("Trigger not found: {key}")]
    TriggerNotFound { key: String },

    /// No job with the given key exists in the store.
    #[error("Job not found: {key}")]
    JobNotFound { key: String },

    /// A job without triggers was added without being durable.
    #[error("Job {key} is not durable and has no trigger")]
    NonDurableJob { key: String },

    /// A trigger references a calendar that is not registered.
    #[error("Calendar not found: {name}")]
    CalendarNotFound { name: String },

    /// The calendar is still referenced by at least one trigger.
    #[error("Calendar {name} is referenced by trigger {trigger}")]
    CalendarInUse { name: String, trigger: String },

    /// The store is unusable (poisoned lock, inconsistent row, ...).
    #[error("Persistence error: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
