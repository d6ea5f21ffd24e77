//! Job types the daemon registers out of the box.

use async_trait::async_trait;
use cadence_scheduler::{Job, JobExecutionContext, JobExecutionError, JobOutcome, JobRegistry};
use std::sync::Arc;
use tracing::info;

/// Writes each firing to the log. `data.message` is used as the log line
/// when present.
pub struct LogJob;

#[async_trait]
impl Job for LogJob {
    async fn execute(&self, ctx: &JobExecutionContext) -> JobOutcome {
        let message = ctx
            .data
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("fired");
        info!(
            job = %ctx.job.key,
            trigger = %ctx.trigger.key,
            scheduled = %ctx.scheduled_fire_time,
            recovering = ctx.recovering,
            "{message}"
        );
        Ok(())
    }
}

/// Always fails. `data.refire = true` asks for an immediate re-execution,
/// which is handy when exercising failure policies from a config file.
pub struct FailJob;

#[async_trait]
impl Job for FailJob {
    async fn execute(&self, ctx: &JobExecutionContext) -> JobOutcome {
        let refire = ctx.data.get("refire").and_then(|r| r.as_bool()) == Some(true);
        // bounded, so a refiring failure cannot loop forever
        if refire && ctx.refire_count < 3 {
            return Err(JobExecutionError::refire("requested failure"));
        }
        Err(JobExecutionError::new("requested failure"))
    }
}

pub fn builtin_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register("log", Arc::new(LogJob));
    registry.register("fail", Arc::new(FailJob));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_scheduler::keys::SequenceKeyGenerator;
    use cadence_scheduler::store::TriggerFiredBundle;
    use cadence_scheduler::{
        JobDetail, JobKey, ScheduleRule, SimpleSchedule, Trigger, TriggerConfig,
    };
    use chrono::Utc;

    fn context(data: serde_json::Value) -> JobExecutionContext {
        let job = JobDetail {
            data,
            ..JobDetail::new(JobKey::new("j", "DEFAULT"), "log")
        };
        let config = TriggerConfig {
            job_key: Some(job.key.clone()),
            ..TriggerConfig::new(ScheduleRule::Simple(SimpleSchedule::once()))
        };
        let trigger = Trigger::from_config(config, &SequenceKeyGenerator::new("t"))
            .expect("valid trigger");
        let now = Utc::now();
        JobExecutionContext::from_bundle(&TriggerFiredBundle {
            job,
            trigger,
            fire_time: now,
            scheduled_fire_time: now,
            previous_fire_time: None,
            next_fire_time: None,
            recovering: false,
            entry_id: "e".into(),
        })
    }

    #[test]
    fn registry_lists_builtins() {
        assert_eq!(builtin_registry().job_types(), vec!["fail", "log"]);
    }

    #[tokio::test]
    async fn log_job_succeeds() {
        let ctx = context(serde_json::json!({"message": "hello"}));
        assert!(LogJob.execute(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn fail_job_refires_a_bounded_number_of_times() {
        let mut ctx = context(serde_json::json!({"refire": true}));
        let err = FailJob.execute(&ctx).await.unwrap_err();
        assert!(err.refire_immediately);
        ctx.refire_count = 3;
        let err = FailJob.execute(&ctx).await.unwrap_err();
        assert!(!err.refire_immediately);
    }
}
