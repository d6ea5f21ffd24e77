//! `cadence-scheduler`: trigger scheduling engine with pluggable persistence.
//!
//! # Overview
//!
//! Jobs are bound to one or more triggers. A trigger pairs a schedule rule
//! with mutable state (next/previous fire time, times triggered, lifecycle
//! state). The [`engine::SchedulerEngine`] asks a [`store::JobStore`] for due
//! triggers in fire order, waits for their fire time, records the firing and
//! runs the job on a bounded worker pool. Each finished execution reports a
//! completion instruction back to the store.
//!
//! # Schedule rules
//!
//! | Variant            | Behaviour                                               |
//! |--------------------|---------------------------------------------------------|
//! | `Simple`           | Fixed interval in absolute time, optional repeat count  |
//! | `CalendarInterval` | Every N units of wall-clock time in a time zone         |
//! | `Cron`             | 5/6-field cron expression evaluated in a time zone      |
//!
//! # Stores
//!
//! | Store              | Persistence | Sharing                                    |
//! |--------------------|-------------|--------------------------------------------|
//! | `MemoryJobStore`   | none        | one engine                                 |
//! | `SqliteJobStore`   | SQLite file | many engines, serialized by IMMEDIATE txns |

pub mod calendar;
pub mod completion;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handle;
pub mod keys;
pub mod misfire;
pub mod ordering;
pub mod schedule;
pub mod signal;
pub mod store;
pub mod trigger;
pub mod types;

pub use calendar::{Calendar, WeekdayCalendar};
pub use completion::{JobExecutionError, JobOutcome};
pub use engine::{EngineSettings, FiredJob, SchedulerEngine};
pub use error::{Result, SchedulerError};
pub use executor::{Job, JobExecutionContext, JobRegistry};
pub use handle::SchedulerHandle;
pub use misfire::MisfireInstruction;
pub use schedule::{
    CalendarIntervalSchedule, CronExpression, CronSchedule, IntervalUnit, ScheduleRule,
    SimpleSchedule,
};
pub use store::{JobStore, MemoryJobStore, SqliteJobStore, StoreSettings};
pub use trigger::{Trigger, TriggerConfig};
pub use types::{
    CompletedExecutionInstruction, FailurePolicy, JobDetail, JobKey, TriggerKey, TriggerState,
};
