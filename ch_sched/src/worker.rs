//! ABOUTME: Worker orchestrating the poll-claim-execute loop with bounded concurrency
//! ABOUTME: Owns the picker, executor, and lock manager; drains gracefully on stop

use crate::executor::{ExecutionOutcome, JobExecutor};
use crate::lock::LockManager;
use crate::picker::JobPicker;
use crate::registry::HandlerRegistry;
use ch_core::time::to_millis;
use ch_core::{Result, WorkerId};
use ch_db::Db;
use ch_store::{ExecutionLogStore, Job, JobStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
    Paused,
    Draining,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Paused,
            3 => Self::Draining,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Draining => "draining",
        }
    }
}

/// Worker tuning knobs
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub poll_interval: Duration,
    pub concurrency: usize,
    /// Stale-lock threshold and default handler deadline, milliseconds
    pub lock_timeout_ms: i64,
    pub drain_timeout: Duration,
    pub stale_sweep_interval: Duration,
    pub ttl_sweep_interval: Duration,
    /// Fixed worker id; auto-generated when unset
    pub worker_id: Option<String>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            concurrency: 5,
            lock_timeout_ms: 300_000,
            drain_timeout: Duration::from_secs(30),
            stale_sweep_interval: Duration::from_secs(60),
            ttl_sweep_interval: Duration::from_secs(300),
            worker_id: None,
        }
    }
}

/// Lifecycle and per-job events for external observers
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started { worker_id: String },
    Stopped { worker_id: String },
    Paused,
    Resumed,
    Error { message: String },
    JobStart {
        job_id: String,
        task_type: String,
        attempt: u32,
    },
    JobComplete {
        job_id: String,
        result: serde_json::Value,
        duration_ms: i64,
    },
    JobRetry {
        job_id: String,
        error: String,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
        remaining_retries: u32,
    },
    JobFailed {
        job_id: String,
        error: String,
        attempt: u32,
        reason: String,
    },
    JobError { job_id: String, error: String },
}

/// Running totals; incremented only from this worker's execution tasks
#[derive(Debug, Default)]
struct WorkerStats {
    jobs_processed: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    total_retries: AtomicU64,
    successful_retries: AtomicU64,
    total_execution_ms: AtomicU64,
    /// Epoch millis of the last finished attempt; 0 means never
    last_job_at_ms: AtomicI64,
}

/// Point-in-time view of worker statistics
#[derive(Debug, Clone)]
pub struct WorkerStatsSnapshot {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub total_retries: u64,
    pub successful_retries: u64,
    pub total_execution_ms: u64,
    pub last_job_at: Option<DateTime<Utc>>,
    pub active_jobs: usize,
    pub uptime_ms: u64,
    /// Percentage of processed attempts that succeeded
    pub success_rate: f64,
    pub avg_execution_ms: f64,
    /// Percentage of scheduled retries that later succeeded
    pub retry_success_rate: f64,
}

struct WorkerInner {
    options: WorkerOptions,
    worker_id: WorkerId,
    jobs: JobStore,
    logs: ExecutionLogStore,
    picker: JobPicker,
    executor: JobExecutor,
    locks: LockManager,
    state: AtomicU8,
    active_count: AtomicUsize,
    active: Mutex<HashMap<String, JoinHandle<()>>>,
    events: broadcast::Sender<WorkerEvent>,
    stats: WorkerStats,
    started_at: std::sync::Mutex<Option<Instant>>,
    shutdown: std::sync::Mutex<CancellationToken>,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// The scheduling worker.
///
/// Holds no timers for job occurrences; all timing lives in next_run_at in
/// the store, so the worker survives restarts without losing anything.
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn new(db: &Db, registry: Arc<HandlerRegistry>, options: WorkerOptions) -> Self {
        let worker_id = options
            .worker_id
            .as_ref()
            .map(|id| WorkerId::from_string(id.clone()))
            .unwrap_or_default();

        let jobs = JobStore::new(db.pool().clone());
        let logs = ExecutionLogStore::new(db.pool().clone());
        let picker = JobPicker::new(jobs.clone(), worker_id.clone());
        let executor = JobExecutor::new(
            jobs.clone(),
            logs.clone(),
            registry,
            worker_id.clone(),
            options.lock_timeout_ms,
        );
        let locks = LockManager::new(db.pool().clone(), worker_id.clone());
        let (events, _) = broadcast::channel(256);

        info!(worker_id = %worker_id, "Worker created");

        Self {
            inner: Arc::new(WorkerInner {
                options,
                worker_id,
                jobs,
                logs,
                picker,
                executor,
                locks,
                state: AtomicU8::new(0),
                active_count: AtomicUsize::new(0),
                active: Mutex::new(HashMap::new()),
                events,
                stats: WorkerStats::default(),
                started_at: std::sync::Mutex::new(None),
                shutdown: std::sync::Mutex::new(CancellationToken::new()),
                loop_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.inner.worker_id
    }

    pub fn state(&self) -> WorkerState {
        self.inner.state()
    }

    /// Named advisory locks sharing this worker's identity
    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.inner.snapshot()
    }

    /// Start the poll, stale-recovery, and TTL sweep loops
    pub async fn start(&self) -> Result<()> {
        if self.inner.state() != WorkerState::Stopped {
            debug!("Worker already started");
            return Ok(());
        }

        let token = CancellationToken::new();
        *self.inner.shutdown.lock().expect("shutdown token poisoned") = token.clone();
        *self.inner.started_at.lock().expect("start instant poisoned") = Some(Instant::now());
        self.inner.set_state(WorkerState::Running);

        let mut handles = self.inner.loop_handles.lock().await;
        handles.push(spawn_poll_loop(Arc::clone(&self.inner), token.clone()));
        handles.push(spawn_stale_loop(Arc::clone(&self.inner), token.clone()));
        handles.push(spawn_ttl_loop(Arc::clone(&self.inner), token));
        drop(handles);

        info!(
            worker_id = %self.inner.worker_id,
            poll_interval_ms = self.inner.options.poll_interval.as_millis() as u64,
            concurrency = self.inner.options.concurrency,
            "Worker started"
        );
        self.inner.emit(WorkerEvent::Started {
            worker_id: self.inner.worker_id.to_string(),
        });
        Ok(())
    }

    /// Stop claiming new jobs; in-flight executions keep running
    pub fn pause(&self) {
        if self.inner.state() == WorkerState::Running {
            self.inner.set_state(WorkerState::Paused);
            info!(worker_id = %self.inner.worker_id, "Worker paused");
            self.inner.emit(WorkerEvent::Paused);
        }
    }

    pub fn resume(&self) {
        if self.inner.state() == WorkerState::Paused {
            self.inner.set_state(WorkerState::Running);
            info!(worker_id = %self.inner.worker_id, "Worker resumed");
            self.inner.emit(WorkerEvent::Resumed);
        }
    }

    /// Graceful shutdown: stop polling, wait for in-flight jobs up to the
    /// drain deadline, then durably release anything still held so another
    /// worker can retry it.
    pub async fn stop(&self) -> Result<()> {
        match self.inner.state() {
            WorkerState::Stopped => return Ok(()),
            WorkerState::Draining => return Ok(()),
            _ => {}
        }
        self.inner.set_state(WorkerState::Draining);
        info!(worker_id = %self.inner.worker_id, "Worker draining");

        self.inner
            .shutdown
            .lock()
            .expect("shutdown token poisoned")
            .cancel();

        let deadline = Instant::now() + self.inner.options.drain_timeout;
        while self.inner.active_count.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let leftover = self.inner.active_count.load(Ordering::Acquire);
        if leftover > 0 {
            warn!(
                in_flight = leftover,
                "Drain deadline hit; releasing held jobs for other workers"
            );
            if let Err(e) = self.inner.picker.release_all().await {
                error!(error = %e, "Failed to release held jobs during drain");
            }
            let mut active = self.inner.active.lock().await;
            for (_, handle) in active.drain() {
                handle.abort();
            }
            self.inner.active_count.store(0, Ordering::Release);
        }

        if let Err(e) = self.inner.locks.release_all().await {
            warn!(error = %e, "Failed to release named locks during shutdown");
        }

        let mut handles = self.inner.loop_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        drop(handles);

        self.inner.set_state(WorkerState::Stopped);
        info!(worker_id = %self.inner.worker_id, "Worker stopped");
        self.inner.emit(WorkerEvent::Stopped {
            worker_id: self.inner.worker_id.to_string(),
        });
        Ok(())
    }
}

impl WorkerInner {
    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn emit(&self, event: WorkerEvent) {
        // No receivers is fine; events are strictly observational
        let _ = self.events.send(event);
    }

    async fn poll_once(self: &Arc<Self>) {
        let slots = self
            .options
            .concurrency
            .saturating_sub(self.active_count.load(Ordering::Acquire));
        if slots == 0 {
            debug!("All execution slots busy; skipping tick");
            return;
        }

        match self.picker.pick_many(slots).await {
            Ok(jobs) => {
                for job in jobs {
                    self.spawn_execution(job).await;
                }
            }
            Err(e) => {
                error!(error = %e, "Polling for due jobs failed");
                self.emit(WorkerEvent::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn spawn_execution(self: &Arc<Self>, job: Job) {
        let key = job.id.clone();
        let public_id = job.public_id();

        self.active_count.fetch_add(1, Ordering::AcqRel);
        self.emit(WorkerEvent::JobStart {
            job_id: public_id.clone(),
            task_type: job.task_type.clone(),
            attempt: job.retry_count,
        });

        let inner = Arc::clone(self);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let outcome = inner.executor.execute(job).await;
            inner.record_outcome(public_id, outcome);
            inner.active_count.fetch_sub(1, Ordering::AcqRel);
            inner.active.lock().await.remove(&task_key);
        });

        self.active.lock().await.insert(key, handle);
    }

    fn record_outcome(&self, public_id: String, outcome: Result<ExecutionOutcome>) {
        self.stats
            .last_job_at_ms
            .store(to_millis(Utc::now()), Ordering::Relaxed);

        match outcome {
            Ok(ExecutionOutcome::Succeeded {
                job_id,
                attempt,
                duration_ms,
                result,
                ..
            }) => {
                self.stats.jobs_processed.fetch_add(1, Ordering::Relaxed);
                self.stats.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .total_execution_ms
                    .fetch_add(duration_ms.max(0) as u64, Ordering::Relaxed);
                if attempt > 0 {
                    self.stats.successful_retries.fetch_add(1, Ordering::Relaxed);
                }
                self.emit(WorkerEvent::JobComplete {
                    job_id,
                    result,
                    duration_ms,
                });
            }
            Ok(ExecutionOutcome::Retrying {
                job_id,
                error,
                attempt,
                next_retry_at,
                remaining_retries,
                ..
            }) => {
                self.stats.jobs_processed.fetch_add(1, Ordering::Relaxed);
                self.stats.total_retries.fetch_add(1, Ordering::Relaxed);
                self.emit(WorkerEvent::JobRetry {
                    job_id,
                    error,
                    attempt,
                    next_retry_at,
                    remaining_retries,
                });
            }
            Ok(ExecutionOutcome::Failed {
                job_id,
                error,
                attempt,
                reason,
                ..
            }) => {
                self.stats.jobs_processed.fetch_add(1, Ordering::Relaxed);
                self.stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
                self.emit(WorkerEvent::JobFailed {
                    job_id,
                    error,
                    attempt,
                    reason: reason.as_str().to_string(),
                });
            }
            Ok(ExecutionOutcome::Skipped { job_id }) => {
                debug!(job_id = %job_id, "Execution skipped; lock no longer held");
            }
            Err(e) => {
                error!(job_id = %public_id, error = %e, "Execution attempt errored");
                self.emit(WorkerEvent::JobError {
                    job_id: public_id,
                    error: e.to_string(),
                });
            }
        }
    }

    fn snapshot(&self) -> WorkerStatsSnapshot {
        let processed = self.stats.jobs_processed.load(Ordering::Relaxed);
        let succeeded = self.stats.jobs_succeeded.load(Ordering::Relaxed);
        let total_retries = self.stats.total_retries.load(Ordering::Relaxed);
        let successful_retries = self.stats.successful_retries.load(Ordering::Relaxed);
        let total_execution_ms = self.stats.total_execution_ms.load(Ordering::Relaxed);
        let last_ms = self.stats.last_job_at_ms.load(Ordering::Relaxed);

        let uptime_ms = self
            .started_at
            .lock()
            .expect("start instant poisoned")
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        WorkerStatsSnapshot {
            jobs_processed: processed,
            jobs_succeeded: succeeded,
            jobs_failed: self.stats.jobs_failed.load(Ordering::Relaxed),
            total_retries,
            successful_retries,
            total_execution_ms,
            last_job_at: (last_ms > 0).then(|| ch_core::time::from_millis(last_ms)),
            active_jobs: self.active_count.load(Ordering::Acquire),
            uptime_ms,
            success_rate: percentage(succeeded, processed),
            avg_execution_ms: if succeeded > 0 {
                total_execution_ms as f64 / succeeded as f64
            } else {
                0.0
            },
            retry_success_rate: percentage(successful_retries, total_retries),
        }
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64) * 100.0
    }
}

fn spawn_poll_loop(inner: Arc<WorkerInner>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(inner.options.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    if inner.state() == WorkerState::Running {
                        inner.poll_once().await;
                    }
                }
            }
        }
        debug!("Poll loop exited");
    })
}

fn spawn_stale_loop(inner: Arc<WorkerInner>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(inner.options.stale_sweep_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await; // skip the immediate first fire
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = inner.picker.recover_stale_jobs(None).await {
                        warn!(error = %e, "Stale-lock recovery sweep failed");
                        inner.emit(WorkerEvent::Error { message: e.to_string() });
                    }
                }
            }
        }
        debug!("Stale-recovery loop exited");
    })
}

fn spawn_ttl_loop(inner: Arc<WorkerInner>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(inner.options.ttl_sweep_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    let now = Utc::now();
                    if let Err(e) = inner.jobs.purge_expired(now).await {
                        warn!(error = %e, "Completed-job purge failed");
                    }
                    if let Err(e) = inner.logs.purge_expired(now).await {
                        warn!(error = %e, "Execution-log purge failed");
                    }
                    if let Err(e) = inner.locks.purge_expired(now).await {
                        warn!(error = %e, "Expired-lock purge failed");
                    }
                }
            }
        }
        debug!("TTL sweep loop exited");
    })
}
