//! ABOUTME: Scheduling engine for durable jobs coordinated through the shared store
//! ABOUTME: Provides the handler registry, lock manager, picker, executor, and worker

pub mod backoff;
pub mod classify;
pub mod executor;
pub mod lock;
pub mod picker;
pub mod registry;
pub mod worker;

pub use classify::{classify, classify_message, is_non_retryable, ErrorCode};
pub use executor::{ExecutionOutcome, FailureReason, JobExecutor};
pub use lock::{Lock, LockManager, LockOutcome, RenewedLock};
pub use picker::JobPicker;
pub use registry::{HandlerRegistry, JobView, TaskHandler};
pub use worker::{Worker, WorkerEvent, WorkerOptions, WorkerState, WorkerStatsSnapshot};
