//! Choosing the [`CompletedExecutionInstruction`] for a finished execution.

use thiserror::Error;

use crate::trigger::Trigger;
use crate::types::{CompletedExecutionInstruction, FailurePolicy, JobDetail};

/// Failure reported by a job. The flags steer the completion instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct JobExecutionError {
    pub message: String,
    /// Run the job again immediately, in the same execution slot.
    pub refire_immediately: bool,
    /// Complete the trigger that fired this execution.
    pub unschedule_firing_trigger: bool,
    /// Complete every trigger of the job.
    pub unschedule_all_triggers: bool,
}

impl JobExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn refire(message: impl Into<String>) -> Self {
        Self {
            refire_immediately: true,
            ..Self::new(message)
        }
    }

    pub fn unschedule_trigger(message: impl Into<String>) -> Self {
        Self {
            unschedule_firing_trigger: true,
            ..Self::new(message)
        }
    }

    pub fn unschedule_all(message: impl Into<String>) -> Self {
        Self {
            unschedule_all_triggers: true,
            ..Self::new(message)
        }
    }
}

/// Result of one job execution.
pub type JobOutcome = std::result::Result<(), JobExecutionError>;

/// Instruction for the store after `job` ran from `trigger`.
///
/// `trigger` is the post-firing snapshot, so its next fire time is already
/// advanced.
pub fn instruction_for(
    trigger: &Trigger,
    job: &JobDetail,
    outcome: &JobOutcome,
) -> CompletedExecutionInstruction {
    use CompletedExecutionInstruction as I;

    if let Err(err) = outcome {
        if err.refire_immediately {
            return I::ReExecuteJob;
        }
        if err.unschedule_firing_trigger {
            return I::SetTriggerComplete;
        }
        if err.unschedule_all_triggers {
            return I::SetAllJobTriggersComplete;
        }
        match job.failure_policy {
            FailurePolicy::ErrorTrigger => return I::SetTriggerError,
            FailurePolicy::ErrorAllTriggers => return I::SetAllJobTriggersError,
            FailurePolicy::Ignore => {}
        }
    }
    if !trigger.may_fire_again() {
        return I::DeleteTrigger;
    }
    I::Noop
}
