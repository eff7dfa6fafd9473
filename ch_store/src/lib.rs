//! ABOUTME: Data model and SQL-owning store layer for the scheduling engine
//! ABOUTME: Jobs, execution logs, counters, and every conditional write live here

pub mod counter;
pub mod jobs;
pub mod logs;
pub mod schedule;
pub mod types;

pub use counter::CounterStore;
pub use jobs::JobStore;
pub use logs::{ExecutionLogStore, FinishLog};
pub use types::{
    ExecutionLog, HourlyBucket, Job, JobFilter, JobKind, JobStatus, LogStatus, NewJob,
    RetryPolicy, RetryStrategy, StoreStats, COMPLETED_JOB_TTL_MS, DEFAULT_LOCK_TIMEOUT_MS,
    EXECUTION_LOG_TTL_MS, MAX_INTERVAL_MS, MIN_INTERVAL_MS,
};
