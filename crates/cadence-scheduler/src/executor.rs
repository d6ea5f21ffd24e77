//! Running fired jobs: the job trait, the registry mapping job types to
//! implementations, and the bounded worker pool.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::completion::{instruction_for, JobExecutionError, JobOutcome};
use crate::store::{JobStore, TriggerFiredBundle};
use crate::trigger::Trigger;
use crate::types::{CompletedExecutionInstruction, JobDetail};

/// Work run when a trigger fires.
#[async_trait]
pub trait Job: Send + Sync {
    async fn execute(&self, ctx: &JobExecutionContext) -> JobOutcome;
}

/// What a running job knows about its firing.
#[derive(Debug, Clone)]
pub struct JobExecutionContext {
    pub job: JobDetail,
    pub trigger: Trigger,
    /// When the firing actually happened.
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    /// How many times this firing was re-executed on request.
    pub refire_count: u32,
    pub recovering: bool,
    /// Job data with the trigger's data merged over it.
    pub data: serde_json::Value,
}

impl JobExecutionContext {
    pub fn from_bundle(bundle: &TriggerFiredBundle) -> Self {
        Self {
            job: bundle.job.clone(),
            trigger: bundle.trigger.clone(),
            fire_time: bundle.fire_time,
            scheduled_fire_time: bundle.scheduled_fire_time,
            previous_fire_time: bundle.previous_fire_time,
            next_fire_time: bundle.next_fire_time,
            refire_count: 0,
            recovering: bundle.recovering,
            data: merge_data(&bundle.job.data, &bundle.trigger.job_data),
        }
    }
}

/// Shallow merge of two JSON objects, `overlay` winning. A non-object overlay
/// other than null replaces the base.
fn merge_data(base: &serde_json::Value, overlay: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match (base, overlay) {
        (_, Value::Null) => base.clone(),
        (Value::Object(b), Value::Object(o)) => {
            let mut merged = b.clone();
            merged.extend(o.iter().map(|(k, v)| (k.clone(), v.clone())));
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

/// Job implementations by job type name.
#[derive(Default, Clone)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` under `job_type`, replacing any earlier registration.
    pub fn register(&mut self, job_type: impl Into<String>, job: Arc<dyn Job>) {
        self.jobs.insert(job_type.into(), job);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

/// Bounded set of running executions.
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity.max(1))),
            tasks: JoinSet::new(),
        }
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Resolve once at least one slot is free.
    pub async fn wait_for_slot(&self) {
        // The semaphore is never closed.
        if let Ok(permit) = self.slots.acquire().await {
            drop(permit);
        }
    }

    /// Run `task` in a free slot, waiting for one if all are busy.
    pub async fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let permit: Option<OwnedSemaphorePermit> =
            Arc::clone(&self.slots).acquire_owned().await.ok();
        self.tasks.spawn(async move {
            task.await;
            drop(permit);
        });
    }

    /// Collect finished tasks, logging any that panicked outside the job.
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                error!("worker task failed: {e}");
            }
        }
    }

    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every running execution, or abort them when `wait` is false.
    pub async fn shutdown(mut self, wait: bool) {
        if !wait {
            self.tasks.abort_all();
        }
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!("worker task failed: {e}"),
                Ok(()) => {}
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}

async fn execute_once(job: &dyn Job, ctx: &JobExecutionContext) -> JobOutcome {
    match AssertUnwindSafe(job.execute(ctx)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => Err(JobExecutionError::new(format!(
            "job panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

/// Execute one fired bundle and report its completion to the store.
///
/// Returns the instruction that was applied.
pub async fn run_bundle(
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    bundle: TriggerFiredBundle,
    store_retry: Duration,
) -> CompletedExecutionInstruction {
    let instruction = match registry.get(&bundle.job.job_type) {
        None => {
            error!(
                job = %bundle.job.key,
                job_type = %bundle.job.job_type,
                "no job registered for this type; erroring its triggers"
            );
            CompletedExecutionInstruction::SetAllJobTriggersError
        }
        Some(job) => {
            let mut ctx = JobExecutionContext::from_bundle(&bundle);
            loop {
                let outcome = execute_once(job.as_ref(), &ctx).await;
                if let Err(e) = &outcome {
                    warn!(job = %bundle.job.key, trigger = %bundle.trigger.key, "job failed: {e}");
                }
                let instruction = instruction_for(&bundle.trigger, &bundle.job, &outcome);
                if instruction != CompletedExecutionInstruction::ReExecuteJob {
                    break instruction;
                }
                ctx.refire_count += 1;
                debug!(job = %bundle.job.key, refire = ctx.refire_count, "re-executing job");
            }
        }
    };

    // The store must learn about the completion, or the job stays blocked.
    let recorded = record_with_retry(store_retry, || {
        store.triggered_job_complete(&bundle, instruction)
    })
    .await;
    if !recorded {
        error!(
            trigger = %bundle.trigger.key,
            attempts = COMPLETE_ATTEMPTS,
            "giving up on recording completion; the firing stays open until recovery"
        );
    }
    instruction
}

/// Attempts made to record a completion before leaving it to recovery.
const COMPLETE_ATTEMPTS: u32 = 10;

/// Call `record` until it succeeds or [`COMPLETE_ATTEMPTS`] calls have
/// failed, sleeping `retry` between calls. Returns whether it succeeded.
async fn record_with_retry(
    retry: Duration,
    mut record: impl FnMut() -> crate::error::Result<()>,
) -> bool {
    for attempt in 1..=COMPLETE_ATTEMPTS {
        match record() {
            Ok(()) => return true,
            Err(e) => warn!(attempt, "recording completion failed: {e}"),
        }
        if attempt < COMPLETE_ATTEMPTS {
            tokio::time::sleep(retry).await;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SequenceKeyGenerator;
    use crate::schedule::{ScheduleRule, SimpleSchedule};
    use crate::store::{MemoryJobStore, StoreSettings};
    use crate::trigger::TriggerConfig;
    use crate::types::{JobKey, TriggerState};
    use std::sync::atomic::{AtomicU32, Ordering};

    const RETRY: Duration = Duration::from_millis(10);

    struct Flaky {
        calls: AtomicU32,
        fail_times: u32,
    }

    #[async_trait]
    impl Job for Flaky {
        async fn execute(&self, ctx: &JobExecutionContext) -> JobOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(ctx.refire_count, n);
            if n < self.fail_times {
                Err(JobExecutionError::refire("not yet"))
            } else {
                Ok(())
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl Job for Panics {
        async fn execute(&self, _ctx: &JobExecutionContext) -> JobOutcome {
            panic!("kaboom");
        }
    }

    fn fired(store: &MemoryJobStore, job_type: &str, rule: SimpleSchedule) -> TriggerFiredBundle {
        let now = Utc::now();
        let job = JobDetail {
            data: serde_json::json!({"a": 1, "b": 1}),
            ..JobDetail::new(JobKey::with_default_group("j"), job_type)
        };
        let config = TriggerConfig {
            job_key: Some(job.key.clone()),
            start_time: now,
            job_data: serde_json::json!({"b": 2}),
            ..TriggerConfig::new(ScheduleRule::Simple(rule))
        };
        let trigger = Trigger::from_config(config, &SequenceKeyGenerator::new("t")).unwrap();
        store.store_job_and_trigger(job, trigger).unwrap();
        let acquired = store
            .acquire_next_triggers(now, now, 1, chrono::Duration::zero())
            .unwrap();
        store.triggers_fired(&acquired, now).unwrap().pop().flatten().unwrap()
    }

    #[test]
    fn context_merges_trigger_data_over_job_data() {
        let store = MemoryJobStore::new(StoreSettings::default());
        let bundle = fired(&store, "noop", SimpleSchedule::once());
        let ctx = JobExecutionContext::from_bundle(&bundle);
        assert_eq!(ctx.data, serde_json::json!({"a": 1, "b": 2}));
        assert_eq!(ctx.refire_count, 0);
    }

    #[tokio::test]
    async fn refire_runs_again_in_the_same_slot() {
        let store = Arc::new(MemoryJobStore::new(StoreSettings::default()));
        let bundle = fired(&store, "flaky", SimpleSchedule::once());
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_times: 2,
        });
        let mut registry = JobRegistry::new();
        registry.register("flaky", flaky.clone());

        let instruction = run_bundle(store.clone(), Arc::new(registry), bundle, RETRY).await;
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(instruction, CompletedExecutionInstruction::DeleteTrigger);
    }

    #[tokio::test]
    async fn panic_becomes_a_failed_execution() {
        let store = Arc::new(MemoryJobStore::new(StoreSettings::default()));
        let bundle = fired(&store, "panics", SimpleSchedule::every(Duration::from_secs(60)));
        let mut registry = JobRegistry::new();
        registry.register("panics", Arc::new(Panics));
        let instruction =
            run_bundle(store.clone(), Arc::new(registry), bundle.clone(), RETRY).await;
        // Default failure policy keeps the schedule going.
        assert_eq!(instruction, CompletedExecutionInstruction::Noop);
        assert_eq!(
            store.trigger_state(&bundle.trigger.key).unwrap(),
            TriggerState::Normal
        );
    }

    #[tokio::test]
    async fn unknown_job_type_errors_all_triggers() {
        let store = Arc::new(MemoryJobStore::new(StoreSettings::default()));
        let bundle = fired(&store, "missing", SimpleSchedule::every(Duration::from_secs(60)));
        let registry = Arc::new(JobRegistry::new());
        let instruction = run_bundle(store.clone(), registry, bundle.clone(), RETRY).await;
        assert_eq!(instruction, CompletedExecutionInstruction::SetAllJobTriggersError);
        assert_eq!(
            store.trigger_state(&bundle.trigger.key).unwrap(),
            TriggerState::Error
        );
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let mut pool = WorkerPool::new(2);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        pool.spawn(async move {
            let _ = rx.await;
        })
        .await;
        pool.spawn(async {}).await;
        assert!(pool.available() <= 1);
        tx.send(()).unwrap();
        pool.shutdown(true).await;
    }

    #[test]
    fn registry_lists_types_sorted() {
        let mut registry = JobRegistry::new();
        registry.register("b", Arc::new(Panics));
        registry.register("a", Arc::new(Panics));
        assert_eq!(registry.job_types(), vec!["a", "b"]);
        assert!(registry.get("c").is_none());
    }

    #[tokio::test]
    async fn completion_is_retried_until_recorded() {
        let calls = AtomicU32::new(0);
        let recorded = record_with_retry(Duration::from_millis(1), || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(crate::error::SchedulerError::Persistence("busy".into()))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(recorded);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn completion_retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let recorded = record_with_retry(Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(crate::error::SchedulerError::Persistence("gone".into()))
        })
        .await;
        assert!(!recorded);
        assert_eq!(calls.load(Ordering::SeqCst), COMPLETE_ATTEMPTS);
    }
}
