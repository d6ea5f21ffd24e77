use std::sync::Arc;
use std::time::Duration;

use cadence_core::SchedulerConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::executor::{run_bundle, JobExecutionContext, JobRegistry, WorkerPool};
use crate::handle::SchedulerHandle;
use crate::signal::SchedulerSignal;
use crate::store::{
    later_by, AcquiredTrigger, JobStore, RecoveryReport, StoreSettings, TriggerFiredBundle,
};
use crate::types::{JobKey, TriggerKey};

/// Engine tunables, resolved from [`SchedulerConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub instance_id: String,
    pub worker_threads: usize,
    pub misfire_threshold: Duration,
    /// Longest the loop sleeps when nothing is due.
    pub idle_wait: Duration,
    pub batch_max_size: usize,
    pub batch_time_window: Duration,
    /// Pause after a store failure before trying again.
    pub store_retry: Duration,
    pub checkin_interval: Duration,
    pub wait_for_jobs_on_shutdown: bool,
}

impl From<&SchedulerConfig> for EngineSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            worker_threads: config.worker_threads,
            misfire_threshold: Duration::from_millis(config.misfire_threshold_ms),
            idle_wait: Duration::from_millis(config.idle_wait_ms),
            batch_max_size: config.batch_max_size,
            batch_time_window: Duration::from_millis(config.batch_time_window_ms),
            store_retry: Duration::from_millis(config.store_retry_ms),
            checkin_interval: Duration::from_millis(config.checkin_interval_ms),
            wait_for_jobs_on_shutdown: config.wait_for_jobs_on_shutdown,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl EngineSettings {
    /// The part of the settings the job store needs.
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            instance_id: self.instance_id.clone(),
            misfire_threshold: to_chrono(self.misfire_threshold),
            checkin_interval: to_chrono(self.checkin_interval),
            ..StoreSettings::default()
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Copy of a dispatched firing, sent to the optional fired-job channel.
#[derive(Debug, Clone, Serialize)]
pub struct FiredJob {
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
    pub job_type: String,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub recovering: bool,
    pub data: serde_json::Value,
}

impl From<&TriggerFiredBundle> for FiredJob {
    fn from(bundle: &TriggerFiredBundle) -> Self {
        Self {
            job_key: bundle.job.key.clone(),
            trigger_key: bundle.trigger.key.clone(),
            job_type: bundle.job.job_type.clone(),
            fire_time: bundle.fire_time,
            scheduled_fire_time: bundle.scheduled_fire_time,
            next_fire_time: bundle.next_fire_time,
            recovering: bundle.recovering,
            data: JobExecutionContext::from_bundle(bundle).data,
        }
    }
}

/// How waiting for a batch's fire time ended.
enum Wait {
    Due,
    /// An earlier trigger may exist; release the batch and look again.
    Rescan,
    Shutdown,
}

/// The scheduler loop: acquires due triggers from the store, waits for their
/// fire time, fires them and hands the executions to a bounded worker pool.
pub struct SchedulerEngine {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    settings: EngineSettings,
    signal: SchedulerSignal,
    pool: WorkerPool,
    /// If set, every dispatched firing is copied here.
    fired_tx: Option<mpsc::Sender<FiredJob>>,
}

impl SchedulerEngine {
    /// Pass `Some(tx)` to receive a [`FiredJob`] per dispatched execution.
    /// The sender is non-blocking (`try_send`), so a slow consumer never
    /// stalls the loop.
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: JobRegistry,
        settings: EngineSettings,
        fired_tx: Option<mpsc::Sender<FiredJob>>,
    ) -> Self {
        let pool = WorkerPool::new(settings.worker_threads);
        Self {
            store,
            registry: Arc::new(registry),
            settings,
            signal: SchedulerSignal::new(),
            pool,
            fired_tx,
        }
    }

    /// A handle for managing jobs and triggers while the engine runs.
    ///
    /// Changes made through it wake the loop.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(Arc::clone(&self.store), self.signal.clone())
    }

    /// Main loop. Runs until `shutdown` broadcasts `true` (or its sender is
    /// dropped), then releases unfired acquisitions and stops the workers.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            instance = %self.settings.instance_id,
            workers = self.settings.worker_threads,
            "scheduler engine started"
        );
        match self.store.recover(Utc::now()) {
            Ok(report) => log_recovery("startup recovery", &report),
            Err(e) => error!("startup recovery failed: {e}"),
        }

        // `interval` rejects a zero period.
        let period = self.settings.checkin_interval.max(Duration::from_millis(1));
        let mut checkin = tokio::time::interval(period);
        checkin.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.pool.reap();
            tokio::select! {
                _ = self.pool.wait_for_slot() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }

            let now = Utc::now();
            let max_count = self
                .pool
                .available()
                .min(self.settings.batch_max_size)
                .max(1);
            let acquired = match self.store.acquire_next_triggers(
                now,
                later_by(now, to_chrono(self.settings.idle_wait)),
                max_count,
                to_chrono(self.settings.batch_time_window),
            ) {
                Ok(acquired) => acquired,
                Err(e) => {
                    error!("acquiring triggers failed: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.store_retry) => continue,
                        _ = wait_for_shutdown(&mut shutdown) => break,
                    }
                }
            };

            if acquired.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.idle_wait) => {}
                    _ = self.signal.changed() => {}
                    _ = checkin.tick() => self.check_in(),
                    _ = wait_for_shutdown(&mut shutdown) => break,
                }
                continue;
            }

            let wait = self
                .wait_until_due(&acquired, &mut checkin, &mut shutdown)
                .await;
            match wait {
                Wait::Due => self.fire(acquired).await,
                Wait::Rescan => self.release_all(&acquired),
                Wait::Shutdown => {
                    self.release_all(&acquired);
                    break;
                }
            }
        }

        info!(running = self.pool.running(), "scheduler engine shutting down");
        self.pool
            .shutdown(self.settings.wait_for_jobs_on_shutdown)
            .await;
        info!("scheduler engine stopped");
    }

    // --- private helpers ---------------------------------------------------

    async fn wait_until_due(
        &self,
        acquired: &[AcquiredTrigger],
        checkin: &mut Interval,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Wait {
        let Some(first) = acquired.iter().map(|a| a.fire_time).min() else {
            return Wait::Due;
        };
        loop {
            // Negative remaining time fails `to_std`: already due.
            let Ok(remaining) = (first - Utc::now()).to_std() else {
                return Wait::Due;
            };
            tokio::select! {
                _ = tokio::time::sleep(remaining) => return Wait::Due,
                change = self.signal.changed() => {
                    if change.is_some_and(|c| c.is_earlier_than(first)) {
                        debug!(%first, "earlier trigger scheduled; rescanning");
                        return Wait::Rescan;
                    }
                }
                _ = checkin.tick() => self.check_in(),
                _ = wait_for_shutdown(shutdown) => return Wait::Shutdown,
            }
        }
    }

    async fn fire(&mut self, acquired: Vec<AcquiredTrigger>) {
        let bundles = match self.store.triggers_fired(&acquired, Utc::now()) {
            Ok(bundles) => bundles,
            Err(e) => {
                error!("recording fired triggers failed: {e}");
                self.release_all(&acquired);
                return;
            }
        };

        for (claimed, bundle) in acquired.iter().zip(bundles) {
            let Some(bundle) = bundle else {
                debug!(trigger = %claimed.trigger.key, "trigger changed before firing; skipped");
                continue;
            };
            info!(
                job = %bundle.job.key,
                trigger = %bundle.trigger.key,
                scheduled = %bundle.scheduled_fire_time,
                "firing job"
            );

            // Forward the firing to the listener (non-blocking).
            if let Some(ref tx) = self.fired_tx {
                if tx.try_send(FiredJob::from(&bundle)).is_err() {
                    warn!(
                        trigger = %bundle.trigger.key,
                        "fired-job channel full or closed; record dropped"
                    );
                }
            }

            let store = Arc::clone(&self.store);
            let registry = Arc::clone(&self.registry);
            let retry = self.settings.store_retry;
            self.pool
                .spawn(async move {
                    run_bundle(store, registry, bundle, retry).await;
                })
                .await;
        }
    }

    fn release_all(&self, acquired: &[AcquiredTrigger]) {
        for claimed in acquired {
            if let Err(e) = self.store.release_acquired_trigger(claimed) {
                error!(trigger = %claimed.trigger.key, "releasing trigger failed: {e}");
            }
        }
    }

    fn check_in(&self) {
        match self.store.check_in(Utc::now()) {
            Ok(report) if !report.failed_instances.is_empty() => {
                log_recovery("cluster recovery", &report);
                // Recovered work may be due right away.
                self.signal.scheduling_changed(None);
            }
            Ok(_) => {}
            Err(e) => error!("scheduler check-in failed: {e}"),
        }
    }
}

fn log_recovery(context: &str, report: &RecoveryReport) {
    if *report == RecoveryReport::default() {
        debug!("{context}: nothing to recover");
        return;
    }
    warn!(
        released = report.released,
        recovered_jobs = report.recovered_jobs,
        misfired = report.misfired,
        failed_instances = ?report.failed_instances,
        "{context} applied"
    );
}

/// Resolves once shutdown is requested or can no longer be requested.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::JobOutcome;
    use crate::executor::Job;
    use crate::schedule::{ScheduleRule, SimpleSchedule};
    use crate::store::MemoryJobStore;
    use crate::trigger::TriggerConfig;
    use crate::types::{JobDetail, TriggerState};
    use async_trait::async_trait;

    /// Reports every execution's trigger key.
    struct Recorder(mpsc::UnboundedSender<TriggerKey>);

    #[async_trait]
    impl Job for Recorder {
        async fn execute(&self, ctx: &JobExecutionContext) -> JobOutcome {
            let _ = self.0.send(ctx.trigger.key.clone());
            Ok(())
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            worker_threads: 2,
            idle_wait: Duration::from_secs(10),
            ..EngineSettings::default()
        }
    }

    fn engine(
        fired_tx: Option<mpsc::Sender<FiredJob>>,
    ) -> (SchedulerEngine, Arc<MemoryJobStore>, mpsc::UnboundedReceiver<TriggerKey>) {
        let settings = settings();
        let store = Arc::new(MemoryJobStore::new(settings.store_settings()));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = JobRegistry::new();
        registry.register("record", Arc::new(Recorder(tx)));
        let engine = SchedulerEngine::new(store.clone(), registry, settings, fired_tx);
        (engine, store, rx)
    }

    fn once_at(name: &str, at: DateTime<Utc>) -> TriggerConfig {
        TriggerConfig {
            key: Some(TriggerKey::with_default_group(name)),
            start_time: at,
            ..TriggerConfig::new(ScheduleRule::Simple(SimpleSchedule::once()))
        }
    }

    fn job(name: &str) -> JobDetail {
        JobDetail::new(JobKey::with_default_group(name), "record")
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn fires_due_trigger_and_cleans_up() {
        let (engine, store, mut ran) = engine(None);
        let handle = engine.handle();
        handle
            .schedule_job(job("j"), once_at("t", Utc::now()))
            .unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(stop_rx));

        let key = tokio::time::timeout(WAIT, ran.recv()).await.unwrap().unwrap();
        assert_eq!(key, TriggerKey::with_default_group("t"));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        // The one-shot trigger completed and was deleted, taking its job along.
        assert_eq!(
            store.trigger_state(&TriggerKey::with_default_group("t")).unwrap(),
            TriggerState::None
        );
        assert!(store.retrieve_job(&JobKey::with_default_group("j")).unwrap().is_none());
    }

    #[tokio::test]
    async fn new_trigger_wakes_an_idle_engine() {
        let (engine, _store, mut ran) = engine(None);
        let handle = engine.handle();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(stop_rx));

        // Let the engine go idle, then schedule well inside its idle wait.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle
            .schedule_job(
                job("j"),
                once_at("t", Utc::now() + chrono::Duration::milliseconds(200)),
            )
            .unwrap();

        let key = tokio::time::timeout(Duration::from_secs(3), ran.recv())
            .await
            .expect("fired before the idle wait ran out")
            .unwrap();
        assert_eq!(key.name, "t");
        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn fired_jobs_are_forwarded() {
        let (fired_tx, mut fired_rx) = mpsc::channel(8);
        let (engine, _store, _ran) = engine(Some(fired_tx));
        let handle = engine.handle();
        let j = JobDetail {
            data: serde_json::json!({"greeting": "hi"}),
            ..job("j")
        };
        handle.schedule_job(j, once_at("t", Utc::now())).unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(stop_rx));
        let fired = tokio::time::timeout(WAIT, fired_rx.recv()).await.unwrap().unwrap();
        assert_eq!(fired.job_key, JobKey::with_default_group("j"));
        assert_eq!(fired.job_type, "record");
        assert_eq!(fired.next_fire_time, None);
        assert_eq!(fired.data["greeting"], "hi");
        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_releases_the_waiting_batch() {
        let (engine, store, _ran) = engine(None);
        let handle = engine.handle();
        let at = Utc::now() + chrono::Duration::seconds(5);
        handle.schedule_job(job("j"), once_at("t", at)).unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(stop_rx));
        // Within the idle wait, so the engine claims it and sleeps until `at`.
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        let stored = store
            .retrieve_trigger(&TriggerKey::with_default_group("t"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.next_fire_time, Some(at));
        let now = Utc::now();
        let again = store
            .acquire_next_triggers(now, at, 1, chrono::Duration::zero())
            .unwrap();
        assert_eq!(again.len(), 1, "trigger is free again after shutdown");
    }

    #[test]
    fn settings_follow_config() {
        let config = SchedulerConfig {
            instance_id: "node-1".into(),
            misfire_threshold_ms: 5_000,
            ..SchedulerConfig::default()
        };
        let settings = EngineSettings::from(&config);
        assert_eq!(settings.misfire_threshold, Duration::from_secs(5));
        let store = settings.store_settings();
        assert_eq!(store.instance_id, "node-1");
        assert_eq!(store.misfire_threshold, chrono::Duration::seconds(5));
    }
}
