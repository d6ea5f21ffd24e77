use std::sync::Arc;

use cadence_core::config::{CadenceConfig, StoreKind};
use cadence_scheduler::signal::SchedulerSignal;
use cadence_scheduler::{
    EngineSettings, FiredJob, JobStore, MemoryJobStore, SchedulerEngine, SchedulerHandle,
    SqliteJobStore,
};
use clap::Parser;
use tracing::{info, warn};

mod jobs;

#[derive(Parser, Debug)]
#[command(name = "cadence-daemon", version, about = "Cadence trigger scheduler")]
struct Cli {
    /// Config file path. Falls back to CADENCE_CONFIG, then ~/.cadence/cadence.toml.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the scheduler until Ctrl-C (the default).
    Run,
    /// Validate the configured jobs and print their next fire times.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_daemon=info,cadence_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // config: --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli.config.or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Check => check(&config),
    }
}

async fn run(config: CadenceConfig) -> anyhow::Result<()> {
    let settings = EngineSettings::from(&config.scheduler);
    let store = open_store(&config, &settings)?;

    let registry = jobs::builtin_registry();
    info!(job_types = ?registry.job_types(), "job types registered");

    // Fired-job channel: SchedulerEngine → audit log task
    let (fired_tx, mut fired_rx) = tokio::sync::mpsc::channel::<FiredJob>(256);
    tokio::spawn(async move {
        while let Some(fired) = fired_rx.recv().await {
            info!(
                job = %fired.job_key,
                trigger = %fired.trigger_key,
                late_ms = (fired.fire_time - fired.scheduled_fire_time).num_milliseconds(),
                next = ?fired.next_fire_time,
                "job dispatched"
            );
        }
    });

    let engine = SchedulerEngine::new(store, registry, settings, Some(fired_tx));
    let handle = engine.handle();
    register_jobs(&handle, &config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(async move { engine.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");

    // signal scheduler to stop and wait for it to drain
    let _ = shutdown_tx.send(true);
    engine_task.await?;
    Ok(())
}

/// Register every configured job against a throwaway in-memory store and
/// print when each one fires next.
fn check(config: &CadenceConfig) -> anyhow::Result<()> {
    let settings = EngineSettings::from(&config.scheduler);
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new(settings.store_settings()));
    let handle = SchedulerHandle::new(store, SchedulerSignal::new());
    let registry = jobs::builtin_registry();

    let mut failed = 0usize;
    for entry in &config.jobs {
        if registry.get(&entry.job_type).is_none() {
            println!("{:<32} unknown job type {:?}", entry.name, entry.job_type);
            failed += 1;
            continue;
        }
        match handle.register_entry(entry) {
            Ok(trigger) => {
                let key = trigger.key.to_string();
                match trigger.next_fire_time {
                    Some(next) => println!("{key:<32} next fire {}", next.to_rfc3339()),
                    None => println!("{key:<32} never fires"),
                }
            }
            Err(e) => {
                println!("{:<32} {}", entry.name, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} configured jobs are invalid", config.jobs.len());
    }
    println!("{} configured jobs ok", config.jobs.len());
    Ok(())
}

fn open_store(
    config: &CadenceConfig,
    settings: &EngineSettings,
) -> anyhow::Result<Arc<dyn JobStore>> {
    let store: Arc<dyn JobStore> = match config.scheduler.store {
        StoreKind::Memory => {
            info!("using in-memory job store");
            Arc::new(MemoryJobStore::new(settings.store_settings()))
        }
        StoreKind::Sqlite => {
            let db_path = &config.database.path;
            config.database.ensure_parent_dir()?;
            info!(path = %db_path, "opening SQLite job store");

            let db = rusqlite::Connection::open(db_path)?;
            db.execute_batch("PRAGMA journal_mode=WAL;")?;
            Arc::new(SqliteJobStore::new(db, settings.store_settings())?)
        }
    };
    Ok(store)
}

/// Failures are logged and skipped so one bad entry does not keep the rest
/// from running.
fn register_jobs(handle: &SchedulerHandle, config: &CadenceConfig) {
    for entry in &config.jobs {
        if let Err(e) = handle.register_entry(entry) {
            warn!(job = %entry.name, "configured job rejected: {e}");
        }
    }
}
