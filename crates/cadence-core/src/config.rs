use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::CadenceError;

pub const DEFAULT_INSTANCE_ID: &str = "NON_CLUSTERED";
pub const DEFAULT_WORKER_THREADS: usize = 10;
pub const DEFAULT_MISFIRE_THRESHOLD_MS: u64 = 60_000;
pub const DEFAULT_IDLE_WAIT_MS: u64 = 30_000;
pub const DEFAULT_STORE_RETRY_MS: u64 = 15_000;
pub const DEFAULT_CHECKIN_INTERVAL_MS: u64 = 7_500;
/// Upper bound for every `*_ms` setting: 365 days.
pub const MAX_DURATION_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Jobs registered by the daemon at startup.
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
}

/// Which job store backs the scheduler.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    /// Volatile, single-process store. Nothing survives a restart.
    #[default]
    Memory,
    /// SQLite file at `database.path`; several processes may share it.
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Identifies this engine as the owner of acquired triggers.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    /// Maximum number of jobs executing at once.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// How late a trigger may be before its misfire instruction kicks in.
    #[serde(default = "default_misfire_threshold_ms")]
    pub misfire_threshold_ms: u64,
    /// Look-ahead window of one acquisition scan and the idle sleep between scans.
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
    /// Maximum triggers acquired per scan.
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,
    /// Triggers due up to this long after the first one join the same batch.
    #[serde(default)]
    pub batch_time_window_ms: u64,
    /// Back-off after a failed store operation.
    #[serde(default = "default_store_retry_ms")]
    pub store_retry_ms: u64,
    /// Cluster heartbeat cadence (sqlite store only).
    #[serde(default = "default_checkin_interval_ms")]
    pub checkin_interval_ms: u64,
    /// When true, shutdown waits for executing jobs to finish.
    #[serde(default = "bool_true")]
    pub wait_for_jobs_on_shutdown: bool,
    #[serde(default)]
    pub store: StoreKind,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            worker_threads: DEFAULT_WORKER_THREADS,
            misfire_threshold_ms: DEFAULT_MISFIRE_THRESHOLD_MS,
            idle_wait_ms: DEFAULT_IDLE_WAIT_MS,
            batch_max_size: default_batch_max_size(),
            batch_time_window_ms: 0,
            store_retry_ms: DEFAULT_STORE_RETRY_MS,
            checkin_interval_ms: DEFAULT_CHECKIN_INTERVAL_MS,
            wait_for_jobs_on_shutdown: true,
            store: StoreKind::Memory,
        }
    }
}

impl SchedulerConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |msg: String| Err(CadenceError::Config(format!("scheduler.{msg}")));
        if self.instance_id.trim().is_empty() {
            return invalid("instance_id must not be empty".into());
        }
        if self.worker_threads == 0 {
            return invalid("worker_threads must be at least 1".into());
        }
        if self.batch_max_size == 0 {
            return invalid("batch_max_size must be at least 1".into());
        }
        for (name, value, min) in [
            ("misfire_threshold_ms", self.misfire_threshold_ms, 0),
            ("idle_wait_ms", self.idle_wait_ms, 1),
            ("batch_time_window_ms", self.batch_time_window_ms, 0),
            ("store_retry_ms", self.store_retry_ms, 1),
            ("checkin_interval_ms", self.checkin_interval_ms, 1),
        ] {
            if value < min || value > MAX_DURATION_MS {
                return invalid(format!(
                    "{name} = {value} is outside {min}..={MAX_DURATION_MS}"
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl DatabaseConfig {
    /// Create the directory the database file lives in.
    pub fn ensure_parent_dir(&self) -> crate::error::Result<()> {
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// A job + trigger pair declared in the config file.
///
/// `schedule` and `misfire` stay untyped here; the scheduler crate owns their
/// shape and validates them when the daemon registers the entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    /// Registered job implementation to run, e.g. "log".
    pub job_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub requests_recovery: bool,
    #[serde(default)]
    pub concurrent_execution_disallowed: bool,
    pub schedule: serde_json::Value,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub misfire: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

fn bool_true() -> bool {
    true
}
fn default_instance_id() -> String {
    DEFAULT_INSTANCE_ID.to_string()
}
fn default_worker_threads() -> usize {
    DEFAULT_WORKER_THREADS
}
fn default_misfire_threshold_ms() -> u64 {
    DEFAULT_MISFIRE_THRESHOLD_MS
}
fn default_idle_wait_ms() -> u64 {
    DEFAULT_IDLE_WAIT_MS
}
fn default_batch_max_size() -> usize {
    1
}
fn default_store_retry_ms() -> u64 {
    DEFAULT_STORE_RETRY_MS
}
fn default_checkin_interval_ms() -> u64 {
    DEFAULT_CHECKIN_INTERVAL_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CADENCE_SCHEDULER__WORKER_THREADS=4`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))?;
        config.scheduler.validate()?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = CadenceConfig::load(Some("/nonexistent/cadence.toml")).expect("load");
        assert_eq!(cfg.scheduler.instance_id, DEFAULT_INSTANCE_ID);
        assert_eq!(cfg.scheduler.worker_threads, DEFAULT_WORKER_THREADS);
        assert_eq!(cfg.scheduler.store, StoreKind::Memory);
        assert!(cfg.jobs.is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            r#"
[scheduler]
instance_id = "node-a"
worker_threads = 3
misfire_threshold_ms = 30000
store = "sqlite"

[[jobs]]
name = "heartbeat"
job_type = "log"
schedule = {{ kind = "simple", interval_ms = 60000 }}
"#
        )
        .expect("write");

        let cfg = CadenceConfig::load(file.path().to_str()).expect("load");
        assert_eq!(cfg.scheduler.instance_id, "node-a");
        assert_eq!(cfg.scheduler.worker_threads, 3);
        assert_eq!(cfg.scheduler.misfire_threshold_ms, 30_000);
        assert_eq!(cfg.scheduler.store, StoreKind::Sqlite);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.scheduler.idle_wait_ms, DEFAULT_IDLE_WAIT_MS);
        assert_eq!(cfg.jobs.len(), 1);
        assert_eq!(cfg.jobs[0].schedule["kind"], "simple");
    }

    #[test]
    fn database_parent_dir_is_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = DatabaseConfig {
            path: dir.path().join("a/b/cadence.db").to_string_lossy().into_owned(),
        };
        db.ensure_parent_dir().expect("created");
        assert!(dir.path().join("a/b").is_dir());
    }

    #[test]
    fn database_parent_dir_failure_is_an_io_error() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        // A regular file cannot act as a directory.
        let db = DatabaseConfig {
            path: file.path().join("cadence.db").to_string_lossy().into_owned(),
        };
        let err = db.ensure_parent_dir().unwrap_err();
        assert!(matches!(err, CadenceError::Io(_)), "{err}");
    }

    #[test]
    fn defaults_are_valid() {
        SchedulerConfig::default().validate().expect("valid");
    }

    #[test]
    fn rejects_values_the_engine_cannot_run_with() {
        let cases: [fn(&mut SchedulerConfig); 6] = [
            |c| c.worker_threads = 0,
            |c| c.batch_max_size = 0,
            |c| c.checkin_interval_ms = 0,
            |c| c.idle_wait_ms = 0,
            |c| c.idle_wait_ms = u64::MAX,
            |c| c.instance_id = " ".into(),
        ];
        for tweak in cases {
            let mut cfg = SchedulerConfig::default();
            tweak(&mut cfg);
            let err = cfg.validate().unwrap_err();
            assert!(matches!(err, CadenceError::Config(_)), "{err}");
        }
    }

    #[test]
    fn load_rejects_zero_checkin_interval() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[scheduler]\ncheckin_interval_ms = 0").expect("write");
        let err = CadenceConfig::load(file.path().to_str()).unwrap_err();
        assert!(err.to_string().contains("checkin_interval_ms"), "{err}");
    }
}
