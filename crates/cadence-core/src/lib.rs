//! `cadence-core`: configuration and error types shared by the scheduler
//! crates and the daemon.

pub mod config;
pub mod error;

pub use config::{CadenceConfig, JobEntry, SchedulerConfig, StoreKind};
pub use error::{CadenceError, Result};
