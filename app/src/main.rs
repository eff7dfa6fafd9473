use async_trait::async_trait;
use ch_config::Config;
use ch_core::telemetry;
use ch_core::Result;
use ch_db::Db;
use ch_sched::{HandlerRegistry, JobView, TaskHandler, Worker, WorkerOptions};
use ch_store::{JobStore, JobFilter};
use clap::{Parser, Subcommand};
use std::{process, sync::Arc, time::Duration};

#[derive(Parser)]
#[command(name = "chronos")]
#[command(about = "Chronos durable job scheduling engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker (default)
    Start,
    /// Print store statistics and exit
    Stats,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env = std::env::var("CHRONOS_ENV").unwrap_or_else(|_| "development".to_string());
    telemetry::init_tracing(&env, "chronos");

    // Load configuration - exit with non-zero if invalid
    let config = match Config::load() {
        Ok(config) => {
            tracing::debug!(?config, "Configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    // Initialize database with schema setup
    let db = match Db::new(&config.database.path).await {
        Ok(db) => {
            tracing::info!("Database initialized successfully");
            db
        }
        Err(e) => {
            tracing::error!("Failed to initialize database: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = db.health_check().await {
        tracing::error!("Database health check failed: {}", e);
        process::exit(1);
    }

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Stats => {
            if let Err(e) = print_stats(&db).await {
                tracing::error!("Failed to gather statistics: {}", e);
                process::exit(1);
            }
        }
        Commands::Start => {
            tracing::info!("chronos starting");
            if let Err(e) = run(config, db).await {
                tracing::error!("Worker exited with error: {}", e);
                process::exit(1);
            }
        }
    }
}

async fn print_stats(db: &Db) -> Result<()> {
    let store = JobStore::new(db.pool().clone());
    let stats = store.stats().await?;
    let waiting = store
        .list(&JobFilter {
            status: Some(ch_store::JobStatus::Waiting),
            ..Default::default()
        })
        .await?
        .len();

    println!("{}", serde_json::json!({
        "totalJobs": stats.total_jobs,
        "activeJobs": stats.active_jobs,
        "waitingOnDependencies": waiting,
        "byStatus": stats.by_status,
        "byTaskType": stats.by_task_type,
        "avgExecutionMs": stats.avg_execution_ms,
    }));
    Ok(())
}

/// Diagnostic handler available in every deployment; real task handlers are
/// registered here by the embedding service.
struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn run(&self, payload: &serde_json::Value, _job: &JobView) -> Result<serde_json::Value> {
        Ok(payload.clone())
    }
}

fn build_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("echo", Arc::new(EchoHandler));
    registry
}

async fn run(config: Config, db: Db) -> Result<()> {
    if config.worker.disabled {
        tracing::warn!("Worker startup suppressed (DISABLE_WORKER); idling until a signal arrives");
        wait_for_shutdown_signal().await;
        return Ok(());
    }

    let options = WorkerOptions {
        poll_interval: Duration::from_millis(config.worker.poll_interval_ms),
        concurrency: config.worker.concurrency,
        lock_timeout_ms: config.worker.lock_timeout_ms as i64,
        drain_timeout: Duration::from_millis(config.worker.drain_timeout_ms),
        stale_sweep_interval: Duration::from_millis(config.worker.stale_sweep_interval_ms),
        ttl_sweep_interval: Duration::from_millis(config.worker.ttl_sweep_interval_ms),
        worker_id: config.worker.worker_id.clone(),
    };

    let worker = Worker::new(&db, Arc::new(build_registry()), options);
    worker.start().await?;
    tracing::info!(worker_id = %worker.worker_id(), "Worker running");

    wait_for_shutdown_signal().await;

    tracing::info!("Shutdown signal received; draining");
    worker.stop().await?;

    let stats = worker.stats();
    tracing::info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        "Worker drained cleanly"
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
        _ = sigterm.recv() => tracing::info!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Interrupt received");
}
