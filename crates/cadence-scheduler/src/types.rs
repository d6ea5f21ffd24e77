use std::fmt;

use serde::{Deserialize, Serialize};

/// Group used when a key is created without one.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Group of the one-shot triggers created by `trigger_job_now`.
pub const MANUAL_TRIGGER_GROUP: &str = "MANUAL_TRIGGER";

/// Group of the one-shot triggers that re-fire recovered jobs after a crash.
pub const RECOVERY_GROUP: &str = "RECOVERING_JOBS";

macro_rules! scheduling_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        // Field order drives the derived `Ord`: group first, then name.
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            pub group: String,
            pub name: String,
        }

        impl $name {
            pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
                Self {
                    group: group.into(),
                    name: name.into(),
                }
            }

            /// Key in [`DEFAULT_GROUP`].
            pub fn with_default_group(name: impl Into<String>) -> Self {
                Self::new(name, DEFAULT_GROUP)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", self.group, self.name)
            }
        }
    };
}

scheduling_key!(
    /// Identity of a trigger, unique within the store.
    TriggerKey
);

scheduling_key!(
    /// Identity of a job, unique within the store.
    JobKey
);

/// Lifecycle state of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Not stored yet, or no longer exists.
    None,
    /// Eligible for selection.
    Normal,
    /// Excluded from selection; keeps its next fire time.
    Paused,
    /// Schedule exhausted or explicitly completed.
    Complete,
    /// Marked as failed by a completion instruction.
    Error,
    /// Its job disallows concurrent execution and an instance is running.
    Blocked,
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerState::None => "none",
            TriggerState::Normal => "normal",
            TriggerState::Paused => "paused",
            TriggerState::Complete => "complete",
            TriggerState::Error => "error",
            TriggerState::Blocked => "blocked",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(TriggerState::None),
            "normal" => Ok(TriggerState::Normal),
            "paused" => Ok(TriggerState::Paused),
            "complete" => Ok(TriggerState::Complete),
            "error" => Ok(TriggerState::Error),
            "blocked" => Ok(TriggerState::Blocked),
            other => Err(format!("unknown trigger state: {other}")),
        }
    }
}

/// Outcome of one firing attempt, applied by the store to trigger/job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletedExecutionInstruction {
    Noop,
    ReExecuteJob,
    SetTriggerComplete,
    DeleteTrigger,
    SetAllJobTriggersComplete,
    SetTriggerError,
    SetAllJobTriggersError,
}

impl fmt::Display for CompletedExecutionInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompletedExecutionInstruction::Noop => "noop",
            CompletedExecutionInstruction::ReExecuteJob => "re_execute_job",
            CompletedExecutionInstruction::SetTriggerComplete => "set_trigger_complete",
            CompletedExecutionInstruction::DeleteTrigger => "delete_trigger",
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                "set_all_job_triggers_complete"
            }
            CompletedExecutionInstruction::SetTriggerError => "set_trigger_error",
            CompletedExecutionInstruction::SetAllJobTriggersError => "set_all_job_triggers_error",
        };
        write!(f, "{s}")
    }
}

/// What a failed execution does to the trigger(s) of its job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep the schedule running as if the job had succeeded.
    #[default]
    Ignore,
    /// Move the firing trigger to ERROR.
    ErrorTrigger,
    /// Move every trigger of the job to ERROR.
    ErrorAllTriggers,
}

/// A stored job definition. The payload is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub key: JobKey,
    /// Name under which the implementation is registered in the job registry.
    pub job_type: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Durable jobs survive losing their last trigger.
    #[serde(default)]
    pub durable: bool,
    /// Re-run once after an abnormal shutdown interrupted an execution.
    #[serde(default)]
    pub requests_recovery: bool,
    /// At most one execution at a time; extra firings block the triggers.
    #[serde(default)]
    pub concurrent_execution_disallowed: bool,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl JobDetail {
    pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
        Self {
            key,
            job_type: job_type.into(),
            description: None,
            durable: false,
            requests_recovery: false,
            concurrent_execution_disallowed: false,
            failure_policy: FailurePolicy::Ignore,
            data: serde_json::Value::Null,
        }
    }
}
