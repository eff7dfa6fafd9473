//! ABOUTME: Job executor: one execution attempt with logging, timeout, retry, dependencies
//! ABOUTME: Every state transition is a conditional write gated on lock ownership

use crate::backoff;
use crate::classify::{classify, is_non_retryable, ErrorCode};
use crate::registry::{HandlerRegistry, JobView};
use ch_core::time::duration_ms;
use ch_core::{Error, Result, WorkerId};
use ch_store::{
    schedule, ExecutionLog, ExecutionLogStore, FinishLog, Job, JobKind, JobStore, LogStatus,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a job ended up permanently failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    NonRetryable,
    RetriesExhausted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonRetryable => "non-retryable",
            Self::RetriesExhausted => "retries exhausted",
        }
    }
}

/// What one execution attempt produced
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Succeeded {
        job_id: String,
        task_type: String,
        attempt: u32,
        duration_ms: i64,
        result: serde_json::Value,
    },
    Retrying {
        job_id: String,
        task_type: String,
        attempt: u32,
        error: String,
        next_retry_at: DateTime<Utc>,
        remaining_retries: u32,
    },
    Failed {
        job_id: String,
        task_type: String,
        attempt: u32,
        error: String,
        reason: FailureReason,
    },
    /// The lock was lost between claim and start; nothing ran
    Skipped { job_id: String },
}

/// Runs one claimed job to its recorded outcome
pub struct JobExecutor {
    jobs: JobStore,
    logs: ExecutionLogStore,
    registry: Arc<HandlerRegistry>,
    worker_id: WorkerId,
    host: String,
    default_timeout_ms: i64,
}

impl JobExecutor {
    pub fn new(
        jobs: JobStore,
        logs: ExecutionLogStore,
        registry: Arc<HandlerRegistry>,
        worker_id: WorkerId,
        default_timeout_ms: i64,
    ) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            jobs,
            logs,
            registry,
            worker_id,
            host,
            default_timeout_ms,
        }
    }

    /// Perform one execution attempt for a job this worker has claimed.
    ///
    /// Store errors bubble up; handler failures are recorded and routed
    /// through the retry policy without escaping.
    pub async fn execute(&self, job: Job) -> Result<ExecutionOutcome> {
        let started = Utc::now();
        let log = ExecutionLog::begin(&job, self.worker_id.as_str(), &self.host, started);
        self.logs.begin(&log).await?;

        let job = match self
            .jobs
            .mark_running(&job.id, self.worker_id.as_str(), started)
            .await?
        {
            Some(job) => job,
            None => {
                warn!(job_id = %job.public_id(), "Lock no longer held; skipping execution");
                self.close_log(
                    &log.id,
                    FinishLog {
                        status: LogStatus::Skipped,
                        finished_at: started,
                        duration_ms: 0,
                        error_message: Some("lock not held at execution start".to_string()),
                        error_stack: None,
                        error_code: None,
                        result: None,
                        metadata: None,
                    },
                )
                .await;
                return Ok(ExecutionOutcome::Skipped {
                    job_id: job.public_id(),
                });
            }
        };

        debug!(
            job_id = %job.public_id(),
            task_type = %job.task_type,
            attempt = job.retry_count,
            "Executing job"
        );

        let timeout_ms = if job.lock_timeout_ms > 0 {
            job.lock_timeout_ms
        } else {
            self.default_timeout_ms
        };

        let run_result = match self.registry.get(&job.task_type) {
            None => Err(Error::Handler(format!(
                "No handler registered for task type: {}",
                job.task_type
            ))),
            Some(handler) => {
                let view = JobView::from(&job);
                // The deadline is raced against the handler; a handler that
                // ignores cancellation keeps running, but its writes are no
                // longer honored because the lock moves on without it.
                match tokio::time::timeout(
                    std::time::Duration::from_millis(timeout_ms as u64),
                    handler.run(&job.payload, &view),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(format!(
                        "Handler timeout after {}ms",
                        timeout_ms
                    ))),
                }
            }
        };

        let finished = Utc::now();
        let elapsed = duration_ms(started, finished);

        match run_result {
            Ok(result) => self.record_success(&job, &log.id, finished, elapsed, result).await,
            Err(err) => self.record_failure(&job, &log.id, finished, elapsed, err).await,
        }
    }

    async fn record_success(
        &self,
        job: &Job,
        log_id: &str,
        finished: DateTime<Utc>,
        elapsed: i64,
        result: serde_json::Value,
    ) -> Result<ExecutionOutcome> {
        let next_run = match job.kind {
            JobKind::OneTime => None,
            JobKind::Recurring => match schedule::next_run(job, finished) {
                Ok(next) => next,
                Err(e) => {
                    warn!(job_id = %job.public_id(), error = %e, "Could not compute next occurrence; completing job");
                    None
                }
            },
        };

        let updated = match next_run {
            Some(next_at) => {
                self.jobs
                    .reschedule_recurring(
                        &job.id,
                        self.worker_id.as_str(),
                        finished,
                        elapsed,
                        Some(&result),
                        next_at,
                    )
                    .await?
            }
            None => {
                self.jobs
                    .complete(&job.id, self.worker_id.as_str(), finished, elapsed, Some(&result))
                    .await?
            }
        };

        let mut metadata = None;
        if updated.is_some() {
            let woken = self.jobs.schedule_dependents(&job.id, finished).await?;
            if woken > 0 {
                info!(job_id = %job.public_id(), dependents = woken, "Scheduled dependent jobs");
            }
        } else {
            warn!(job_id = %job.public_id(), "Lock was taken over mid-execution; outcome not applied");
            metadata = Some(serde_json::json!({ "lockLost": true }));
        }

        self.close_log(
            log_id,
            FinishLog {
                status: LogStatus::Success,
                finished_at: finished,
                duration_ms: elapsed,
                error_message: None,
                error_stack: None,
                error_code: None,
                result: Some(result.clone()),
                metadata,
            },
        )
        .await;

        info!(
            job_id = %job.public_id(),
            duration_ms = elapsed,
            rescheduled = next_run.is_some(),
            "Job succeeded"
        );

        Ok(ExecutionOutcome::Succeeded {
            job_id: job.public_id(),
            task_type: job.task_type.clone(),
            attempt: job.retry_count,
            duration_ms: elapsed,
            result,
        })
    }

    async fn record_failure(
        &self,
        job: &Job,
        log_id: &str,
        finished: DateTime<Utc>,
        elapsed: i64,
        err: Error,
    ) -> Result<ExecutionOutcome> {
        let code = classify(&err);
        let message = err.to_string();
        let non_retryable = is_non_retryable(&message);
        let will_retry = !non_retryable && job.retry_count < job.retry.max_retries;
        let log_status = if code == ErrorCode::Timeout {
            LogStatus::Timeout
        } else {
            LogStatus::Failed
        };

        if will_retry {
            let delay = backoff::retry_delay_ms(&job.retry, job.retry_count);
            let next_retry_at = finished + Duration::milliseconds(delay);
            let remaining = job.retry.max_retries - job.retry_count - 1;

            if self
                .jobs
                .schedule_retry(
                    &job.id,
                    self.worker_id.as_str(),
                    finished,
                    elapsed,
                    &message,
                    None,
                    next_retry_at,
                )
                .await?
                .is_some()
            {
                self.close_log(
                    log_id,
                    FinishLog {
                        status: log_status,
                        finished_at: finished,
                        duration_ms: elapsed,
                        error_message: Some(message.clone()),
                        error_stack: None,
                        error_code: Some(code.as_str().to_string()),
                        result: None,
                        metadata: Some(serde_json::json!({
                            "willRetry": true,
                            "nextRetryAt": next_retry_at.to_rfc3339(),
                            "remainingRetries": remaining,
                            "retryDelayMs": delay,
                        })),
                    },
                )
                .await;

                warn!(
                    job_id = %job.public_id(),
                    error = %message,
                    attempt = job.retry_count,
                    retry_in_ms = delay,
                    "Job failed; retry scheduled"
                );

                return Ok(ExecutionOutcome::Retrying {
                    job_id: job.public_id(),
                    task_type: job.task_type.clone(),
                    attempt: job.retry_count,
                    error: message,
                    next_retry_at,
                    remaining_retries: remaining,
                });
            }

            warn!(job_id = %job.public_id(), "Retry write did not apply; failing permanently");
        }

        let failed = self
            .jobs
            .fail_permanently(
                &job.id,
                self.worker_id.as_str(),
                finished,
                elapsed,
                &message,
                None,
            )
            .await?;

        if failed.is_some() {
            let blocked = self.jobs.block_dependents(&job.id, finished).await?;
            if blocked > 0 {
                warn!(job_id = %job.public_id(), dependents = blocked, "Blocked dependent jobs");
            }
        } else {
            warn!(job_id = %job.public_id(), "Lock was taken over mid-execution; failure not applied");
        }

        let reason = if non_retryable {
            FailureReason::NonRetryable
        } else {
            FailureReason::RetriesExhausted
        };

        self.close_log(
            log_id,
            FinishLog {
                status: log_status,
                finished_at: finished,
                duration_ms: elapsed,
                error_message: Some(message.clone()),
                error_stack: None,
                error_code: Some(code.as_str().to_string()),
                result: None,
                metadata: Some(serde_json::json!({
                    "willRetry": false,
                    "remainingRetries": job.retry.max_retries.saturating_sub(job.retry_count),
                    "reason": reason.as_str(),
                })),
            },
        )
        .await;

        warn!(
            job_id = %job.public_id(),
            error = %message,
            reason = reason.as_str(),
            "Job failed permanently"
        );

        Ok(ExecutionOutcome::Failed {
            job_id: job.public_id(),
            task_type: job.task_type.clone(),
            attempt: job.retry_count,
            error: message,
            reason,
        })
    }

    /// Closing a log is a meta-operation; its failure is logged, never fatal
    async fn close_log(&self, log_id: &str, outcome: FinishLog) {
        match self.logs.finish(log_id, outcome).await {
            Ok(Some(_)) => {}
            Ok(None) => warn!(log_id = %log_id, "Execution log was already closed"),
            Err(e) => warn!(log_id = %log_id, error = %e, "Failed to close execution log"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskHandler;
    use async_trait::async_trait;
    use ch_db::Db;
    use ch_store::{JobStatus, NewJob, RetryPolicy};

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn run(
            &self,
            payload: &serde_json::Value,
            _job: &JobView,
        ) -> Result<serde_json::Value> {
            Ok(payload.clone())
        }
    }

    struct AlwaysFailHandler;

    #[async_trait]
    impl TaskHandler for AlwaysFailHandler {
        async fn run(&self, _: &serde_json::Value, _: &JobView) -> Result<serde_json::Value> {
            Err(Error::Handler("simulated task failure".to_string()))
        }
    }

    struct BadInputHandler;

    #[async_trait]
    impl TaskHandler for BadInputHandler {
        async fn run(&self, _: &serde_json::Value, _: &JobView) -> Result<serde_json::Value> {
            Err(Error::Validation("payload failed validation".to_string()))
        }
    }

    struct NeverReturnHandler;

    #[async_trait]
    impl TaskHandler for NeverReturnHandler {
        async fn run(&self, _: &serde_json::Value, _: &JobView) -> Result<serde_json::Value> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(serde_json::json!({}))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        jobs: JobStore,
        logs: ExecutionLogStore,
        executor: JobExecutor,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("executor_test.db");
        let db = Db::new(path.to_str().unwrap()).await.expect("test db");

        let mut registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(EchoHandler));
        registry.register("always_fail", Arc::new(AlwaysFailHandler));
        registry.register("bad_input", Arc::new(BadInputHandler));
        registry.register("never_return", Arc::new(NeverReturnHandler));

        let jobs = JobStore::new(db.pool().clone());
        let logs = ExecutionLogStore::new(db.pool().clone());
        let executor = JobExecutor::new(
            jobs.clone(),
            logs.clone(),
            Arc::new(registry),
            WorkerId::from_string("w1"),
            300_000,
        );

        Harness {
            _dir: dir,
            jobs,
            logs,
            executor,
        }
    }

    async fn claimed(h: &Harness, new_job: NewJob) -> Job {
        let job = h.jobs.create(new_job).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        h.jobs
            .claim_due("w1", Utc::now())
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("job {} should be claimable", job.public_id()))
    }

    fn imminent(name: &str, task_type: &str) -> NewJob {
        NewJob::one_time(name, task_type, Utc::now() + Duration::milliseconds(10))
    }

    #[tokio::test]
    async fn test_one_time_success() {
        let h = harness().await;
        let payload = serde_json::json!({"x": 1});
        let job = claimed(&h, imminent("echo once", "echo").with_payload(payload.clone())).await;

        let outcome = h.executor.execute(job.clone()).await.unwrap();
        match outcome {
            ExecutionOutcome::Succeeded { result, attempt, .. } => {
                assert_eq!(result, payload);
                assert_eq!(attempt, 0);
            }
            other => panic!("expected success, got {:?}", other),
        }

        let stored = h.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.locked_by.is_none());
        assert_eq!(stored.last_result, Some(payload.clone()));

        let logs = h.logs.list_for_job(&job.id, None).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Success);
        assert_eq!(logs[0].result, Some(payload));
        assert!(logs[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_recurring_success_reschedules() {
        let h = harness().await;
        let job = claimed(&h, {
            let mut j = NewJob::recurring_interval("tick tock", "echo", 5000);
            j.payload = serde_json::json!({"tick": true});
            j
        })
        .await;

        let before = Utc::now();
        let outcome = h.executor.execute(job.clone()).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Succeeded { .. }));

        let stored = h.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Scheduled);
        let next = stored.next_run_at.unwrap();
        assert!(next >= before + Duration::milliseconds(5000));
        assert!(stored.locked_by.is_none());
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_without_retry() {
        let h = harness().await;
        let job = claimed(&h, imminent("ghost type", "no_such_type")).await;

        let outcome = h.executor.execute(job.clone()).await.unwrap();
        match outcome {
            ExecutionOutcome::Failed { reason, error, .. } => {
                assert_eq!(reason, FailureReason::NonRetryable);
                assert!(error.contains("No handler registered"));
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let stored = h.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 0);

        let logs = h.logs.list_for_job(&job.id, None).await.unwrap();
        assert_eq!(logs[0].error_code.as_deref(), Some("HANDLER_ERROR"));
    }

    #[tokio::test]
    async fn test_retryable_failure_schedules_retry() {
        let h = harness().await;
        let retry = RetryPolicy {
            max_retries: 3,
            retry_delay_ms: 2000,
            strategy: Some(ch_store::RetryStrategy::Exponential),
            jitter_enabled: false,
            ..Default::default()
        };
        let job = claimed(&h, imminent("flaky", "always_fail").with_retry(retry)).await;

        let before = Utc::now();
        let outcome = h.executor.execute(job.clone()).await.unwrap();
        match outcome {
            ExecutionOutcome::Retrying {
                attempt,
                remaining_retries,
                next_retry_at,
                ..
            } => {
                assert_eq!(attempt, 0);
                assert_eq!(remaining_retries, 2);
                assert!(next_retry_at >= before + Duration::milliseconds(2000));
            }
            other => panic!("expected retry, got {:?}", other),
        }

        let stored = h.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Scheduled);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.last_error.unwrap().contains("simulated"));

        let logs = h.logs.list_for_job(&job.id, None).await.unwrap();
        let meta = logs[0].metadata.clone().unwrap();
        assert_eq!(meta["willRetry"], serde_json::json!(true));
        assert_eq!(meta["remainingRetries"], serde_json::json!(2));
        assert_eq!(meta["retryDelayMs"], serde_json::json!(2000));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails() {
        let h = harness().await;
        let retry = RetryPolicy {
            max_retries: 0,
            ..Default::default()
        };
        let job = claimed(&h, imminent("hopeless", "always_fail").with_retry(retry)).await;

        let outcome = h.executor.execute(job.clone()).await.unwrap();
        match outcome {
            ExecutionOutcome::Failed { reason, .. } => {
                assert_eq!(reason, FailureReason::RetriesExhausted)
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let stored = h.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_non_retryable_error_skips_budget() {
        let h = harness().await;
        let job = claimed(&h, imminent("bad payload", "bad_input")).await;

        let outcome = h.executor.execute(job.clone()).await.unwrap();
        match outcome {
            ExecutionOutcome::Failed { reason, .. } => {
                assert_eq!(reason, FailureReason::NonRetryable)
            }
            other => panic!("expected failure, got {:?}", other),
        }

        // Budget was 3 but the error is non-retryable
        let stored = h.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 0);

        let logs = h.logs.list_for_job(&job.id, None).await.unwrap();
        assert_eq!(logs[0].error_code.as_deref(), Some("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn test_timeout_closes_log_and_releases_lock() {
        let h = harness().await;
        let retry = RetryPolicy {
            max_retries: 0,
            ..Default::default()
        };
        let job = claimed(
            &h,
            imminent("stuck", "never_return")
                .with_retry(retry)
                .with_lock_timeout_ms(1000),
        )
        .await;

        let outcome = h.executor.execute(job.clone()).await.unwrap();
        match outcome {
            ExecutionOutcome::Failed { error, .. } => assert!(error.contains("timeout")),
            other => panic!("expected timeout failure, got {:?}", other),
        }

        let stored = h.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.locked_by.is_none());

        let logs = h.logs.list_for_job(&job.id, None).await.unwrap();
        assert_eq!(logs[0].status, LogStatus::Timeout);
        assert_eq!(logs[0].error_code.as_deref(), Some("TIMEOUT"));
    }

    #[tokio::test]
    async fn test_success_fans_out_dependents() {
        let h = harness().await;
        let parent = h.jobs.create(imminent("parent", "echo")).await.unwrap();
        let child = h
            .jobs
            .create(imminent("child", "echo").with_depends_on(parent.id.clone()))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let claimed_parent = h.jobs.claim_due("w1", Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed_parent.id, parent.id);

        h.executor.execute(claimed_parent).await.unwrap();

        let woken = h.jobs.get(&child.id).await.unwrap().unwrap();
        assert_eq!(woken.status, JobStatus::Scheduled);
        assert!(woken.next_run_at.is_some());
    }

    #[tokio::test]
    async fn test_permanent_failure_blocks_dependents() {
        let h = harness().await;
        let retry = RetryPolicy {
            max_retries: 0,
            ..Default::default()
        };
        let parent = h
            .jobs
            .create(imminent("doomed parent", "always_fail").with_retry(retry))
            .await
            .unwrap();
        let child = h
            .jobs
            .create(imminent("orphan", "echo").with_depends_on(parent.id.clone()))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let claimed_parent = h.jobs.claim_due("w1", Utc::now()).await.unwrap().unwrap();
        h.executor.execute(claimed_parent).await.unwrap();

        let blocked = h.jobs.get(&child.id).await.unwrap().unwrap();
        assert_eq!(blocked.status, JobStatus::Blocked);
    }

    #[tokio::test]
    async fn test_stolen_lock_skips_execution() {
        let h = harness().await;
        let job = claimed(&h, imminent("contested", "echo")).await;

        // Another worker recovered and re-claimed the job before we started
        h.jobs.recover_stale(Utc::now() + Duration::hours(1), Some(0)).await.unwrap();
        let theirs = h
            .jobs
            .claim_due("w2", Utc::now() + Duration::hours(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(theirs.id, job.id);

        let outcome = h.executor.execute(job).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Skipped { .. }));
    }
}
