//! ABOUTME: Configuration management with validation and environment loading
//! ABOUTME: Handles all scheduler settings from environment variables and files

use ch_core::{Error, Result};
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Main configuration struct
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub worker: WorkerConfig,
    #[validate(nested)]
    pub retry: RetryConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DatabaseConfig {
    #[validate(length(min = 1))]
    pub path: String,
    #[validate(range(min = 1, max = 100))]
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "chronos.db".to_string(),
            pool_size: 10,
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct WorkerConfig {
    /// Poll tick cadence in milliseconds
    #[validate(range(min = 100, max = 3_600_000))]
    pub poll_interval_ms: u64,
    /// Maximum in-flight executions per worker
    #[validate(range(min = 1, max = 100))]
    pub concurrency: usize,
    /// Stale-lock threshold and default handler deadline, milliseconds
    #[validate(range(min = 1000, max = 86_400_000))]
    pub lock_timeout_ms: u64,
    /// How long stop() waits for in-flight jobs before releasing them
    #[validate(range(min = 1000, max = 600_000))]
    pub drain_timeout_ms: u64,
    /// Cadence of the stale-lock recovery sweep
    #[validate(range(min = 1000, max = 3_600_000))]
    pub stale_sweep_interval_ms: u64,
    /// Cadence of the TTL purge sweep (completed jobs, old logs, expired locks)
    #[validate(range(min = 1000, max = 86_400_000))]
    pub ttl_sweep_interval_ms: u64,
    /// Suppress worker startup (DISABLE_WORKER); the binary only serves queries
    pub disabled: bool,
    /// Fixed worker id; auto-generated from host/pid when unset
    pub worker_id: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            concurrency: 5,
            lock_timeout_ms: 300_000,
            drain_timeout_ms: 30_000,
            stale_sweep_interval_ms: 60_000,
            ttl_sweep_interval_ms: 300_000,
            disabled: false,
            worker_id: None,
        }
    }
}

/// Default retry policy applied to jobs that do not carry their own
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RetryConfig {
    #[validate(range(min = 0, max = 10))]
    pub max_retries: u32,
    #[validate(range(min = 1000, max = 86_400_000))]
    pub base_delay_ms: u64,
    #[validate(range(min = 1000, max = 86_400_000))]
    pub max_delay_ms: u64,
    /// One of: fixed, exponential, linear, fibonacci
    #[validate(length(min = 1))]
    pub strategy: String,
    pub jitter_enabled: bool,
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 60_000,
            max_delay_ms: 3_600_000,
            strategy: "exponential".to_string(),
            jitter_enabled: true,
            jitter_factor: 0.2,
        }
    }
}

impl Config {
    /// Load configuration from environment variables and optional .env file
    pub fn load() -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        // Set defaults first
        builder = builder
            .set_default("database.path", "chronos.db")?
            .set_default("database.pool_size", 10)?
            .set_default("worker.poll_interval_ms", 5000)?
            .set_default("worker.concurrency", 5)?
            .set_default("worker.lock_timeout_ms", 300_000)?
            .set_default("worker.drain_timeout_ms", 30_000)?
            .set_default("worker.stale_sweep_interval_ms", 60_000)?
            .set_default("worker.ttl_sweep_interval_ms", 300_000)?
            .set_default("worker.disabled", false)?
            .set_default("retry.max_retries", 3)?
            .set_default("retry.base_delay_ms", 60_000)?
            .set_default("retry.max_delay_ms", 3_600_000)?
            .set_default("retry.strategy", "exponential")?
            .set_default("retry.jitter_enabled", true)?
            .set_default("retry.jitter_factor", 0.2)?;

        // Multi-word keys do not survive the single-underscore separator,
        // so the documented knobs are wired up explicitly.
        let overrides: [(&str, &str); 9] = [
            ("CHRONOS_POLL_INTERVAL", "worker.poll_interval_ms"),
            ("CHRONOS_CONCURRENCY", "worker.concurrency"),
            ("CHRONOS_LOCK_TIMEOUT", "worker.lock_timeout_ms"),
            ("CHRONOS_MAX_RETRIES", "retry.max_retries"),
            ("CHRONOS_BASE_RETRY_DELAY", "retry.base_delay_ms"),
            ("CHRONOS_MAX_RETRY_DELAY", "retry.max_delay_ms"),
            ("CHRONOS_RETRY_STRATEGY", "retry.strategy"),
            ("CHRONOS_JITTER_FACTOR", "retry.jitter_factor"),
            ("CHRONOS_DATABASE_PATH", "database.path"),
        ];
        for (env_key, config_key) in overrides {
            if let Ok(value) = std::env::var(env_key) {
                builder = builder.set_override(config_key, value)?;
            }
        }
        if let Ok(value) = std::env::var("CHRONOS_JITTER_ENABLED") {
            builder = builder.set_override("retry.jitter_enabled", value == "true" || value == "1")?;
        }
        if let Ok(value) = std::env::var("CHRONOS_WORKER_ID") {
            builder = builder.set_override("worker.worker_id", value)?;
        }

        // DISABLE_WORKER is honored without the prefix; any non-empty value
        // other than "false"/"0" suppresses the worker.
        if let Ok(value) = std::env::var("DISABLE_WORKER") {
            let disabled = !value.is_empty() && value != "false" && value != "0";
            builder = builder.set_override("worker.disabled", disabled)?;
        }

        // Try to load from .env file if it exists (optional)
        if std::path::Path::new(".env").exists() {
            builder = builder.add_source(File::with_name(".env").required(false));
        }

        // Load from environment variables with CHRONOS_ prefix (highest priority)
        builder = builder.add_source(
            Environment::with_prefix("CHRONOS")
                .try_parsing(true)
                .separator("_"),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build config: {}", e)))?;

        let parsed: Config = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize config: {}", e)))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("Config validation failed: {}", e)))?;

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Use a mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 7] = [
        "CHRONOS_POLL_INTERVAL",
        "CHRONOS_CONCURRENCY",
        "CHRONOS_LOCK_TIMEOUT",
        "CHRONOS_MAX_RETRIES",
        "CHRONOS_RETRY_STRATEGY",
        "CHRONOS_DATABASE_PATH",
        "DISABLE_WORKER",
    ];

    fn clear_vars() {
        for key in VARS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();

        let config = Config::load().expect("Should load with defaults");

        assert_eq!(config.database.path, "chronos.db");
        assert_eq!(config.worker.poll_interval_ms, 5000);
        assert_eq!(config.worker.concurrency, 5);
        assert_eq!(config.worker.lock_timeout_ms, 300_000);
        assert!(!config.worker.disabled);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.strategy, "exponential");
        assert!(config.retry.jitter_enabled);
    }

    #[test]
    fn test_config_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();

        env::set_var("CHRONOS_POLL_INTERVAL", "750");
        env::set_var("CHRONOS_CONCURRENCY", "12");
        env::set_var("CHRONOS_RETRY_STRATEGY", "linear");

        let config = Config::load().expect("Should load from env");

        assert_eq!(config.worker.poll_interval_ms, 750);
        assert_eq!(config.worker.concurrency, 12);
        assert_eq!(config.retry.strategy, "linear");

        clear_vars();
    }

    #[test]
    fn test_disable_worker_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();

        env::set_var("DISABLE_WORKER", "1");
        let config = Config::load().expect("Should load");
        assert!(config.worker.disabled);

        env::set_var("DISABLE_WORKER", "false");
        let config = Config::load().expect("Should load");
        assert!(!config.worker.disabled);

        clear_vars();
    }

    #[test]
    fn test_config_validation_failure() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();

        env::set_var("CHRONOS_CONCURRENCY", "500"); // Out of range

        let result = Config::load();
        assert!(result.is_err());

        clear_vars();
    }
}
