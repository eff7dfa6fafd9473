//! ABOUTME: Database layer with SQLite pool, schema setup, and health checks
//! ABOUTME: Owns the connection options and table/index definitions

use ch_core::{Error, Result};
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Sqlite, SqlitePool,
};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Database connection retry configuration
#[derive(Debug, Clone)]
pub struct DatabaseRetryConfig {
    /// Maximum number of retry attempts
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for DatabaseRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl DatabaseRetryConfig {
    fn delay(&self, attempt: u32) -> Duration {
        let delay_ms =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms.min(30_000.0) as u64)
    }
}

/// Database connection pool and operations
#[derive(Debug, Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Create a new database connection with schema setup and default retry configuration
    #[instrument(skip(db_path))]
    pub async fn new(db_path: &str) -> Result<Self> {
        Self::new_with_retry(db_path, DatabaseRetryConfig::default()).await
    }

    /// Create a new database connection with schema setup and custom retry configuration
    pub async fn new_with_retry(db_path: &str, retry: DatabaseRetryConfig) -> Result<Self> {
        info!(path = %db_path, max_attempts = retry.max_attempts, "Initializing database");

        let database_url = format!("sqlite://{}", db_path);
        let mut last_error = None;

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                let delay = retry.delay(attempt - 1);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Database initialization failed, retrying after delay"
                );
                tokio::time::sleep(delay).await;
            }

            match Self::try_initialize(db_path, &database_url).await {
                Ok(db) => match db.migrate().await {
                    Ok(_) => {
                        info!(attempts = attempt + 1, "Database initialized");
                        return Ok(db);
                    }
                    Err(e) => last_error = Some(e),
                },
                Err(e) => last_error = Some(e),
            }
        }

        Err(Error::Database(format!(
            "Failed to initialize database after {} attempts: {}",
            retry.max_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Try to initialize the database connection (single attempt)
    async fn try_initialize(db_path: &str, database_url: &str) -> Result<Self> {
        if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
            debug!("Creating database: {}", database_url);
            Sqlite::create_database(database_url)
                .await
                .map_err(|e| Error::Database(format!("Failed to create database: {}", e)))?;
        }

        // WAL mode so concurrent workers sharing one file do not serialize reads,
        // and a generous busy timeout for claim contention.
        let connect_options = SqliteConnectOptions::new()
            .filename(db_path)
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true)
            .pragma("foreign_keys", "ON")
            .pragma("synchronous", "NORMAL")
            .pragma("busy_timeout", "30000");

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .connect_with(connect_options)
            .await
            .map_err(|e| Error::Database(format!("Failed to create connection pool: {}", e)))?;

        Ok(Self { pool })
    }

    /// Create the schema if it does not exist; safe to run repeatedly
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        debug!("Running database schema setup");

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Database(format!("Schema setup failed: {}", e)))?;
        }

        debug!("Database schema setup completed");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a Db instance from an existing pool (for testing/reuse)
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }
}

/// Table and index definitions.
///
/// All timestamps are integer Unix epoch milliseconds so that predicates
/// mixing a timestamp column with a per-row timeout column stay inside a
/// single statement (e.g. `locked_at + lock_timeout_ms < now`).
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        job_number INTEGER NOT NULL UNIQUE,
        name TEXT NOT NULL,
        description TEXT,
        tags TEXT NOT NULL DEFAULT '[]',
        timezone TEXT NOT NULL DEFAULT 'UTC',
        created_by TEXT,
        kind TEXT NOT NULL,
        schedule_time INTEGER,
        cron_expression TEXT,
        interval_ms INTEGER,
        start_time INTEGER,
        end_time INTEGER,
        task_type TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}',
        priority INTEGER NOT NULL DEFAULT 5,
        status TEXT NOT NULL,
        next_run_at INTEGER,
        last_run_at INTEGER,
        retry_count INTEGER NOT NULL DEFAULT 0,
        execution_duration_ms INTEGER,
        last_error TEXT,
        last_error_stack TEXT,
        last_result TEXT,
        max_retries INTEGER NOT NULL DEFAULT 3,
        retry_delay_ms INTEGER NOT NULL DEFAULT 60000,
        use_exponential_backoff INTEGER NOT NULL DEFAULT 1,
        max_retry_delay_ms INTEGER,
        retry_strategy TEXT,
        jitter_enabled INTEGER NOT NULL DEFAULT 1,
        jitter_factor REAL NOT NULL DEFAULT 0.2,
        locked_by TEXT,
        locked_at INTEGER,
        lock_timeout_ms INTEGER NOT NULL DEFAULT 300000,
        depends_on_job_id TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        expire_at INTEGER,
        paused_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs (status, next_run_at, is_active)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_retry ON jobs (status, next_run_at, retry_count)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_lock ON jobs (locked_by, locked_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_active ON jobs (is_active, status, updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_tags ON jobs (tags)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_name ON jobs (name)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_depends_on ON jobs (depends_on_job_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_expire ON jobs (expire_at)",
    r#"
    CREATE TABLE IF NOT EXISTS execution_logs (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL,
        job_number INTEGER NOT NULL,
        job_name TEXT NOT NULL,
        job_kind TEXT NOT NULL,
        task_type TEXT NOT NULL,
        scheduled_for INTEGER,
        started_at INTEGER NOT NULL,
        finished_at INTEGER,
        duration_ms INTEGER,
        status TEXT NOT NULL,
        retry_attempt INTEGER NOT NULL DEFAULT 0,
        is_retry INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        error_stack TEXT,
        error_code TEXT,
        worker_id TEXT,
        worker_host TEXT,
        payload TEXT,
        result TEXT,
        metadata TEXT,
        expire_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_logs_job ON execution_logs (job_id, started_at)",
    "CREATE INDEX IF NOT EXISTS idx_logs_status ON execution_logs (status)",
    "CREATE INDEX IF NOT EXISTS idx_logs_expire ON execution_logs (expire_at)",
    r#"
    CREATE TABLE IF NOT EXISTS locks (
        lock_id TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        acquired_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        renew_count INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_locks_expires ON locks (expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS counters (
        name TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    )
    "#,
];
