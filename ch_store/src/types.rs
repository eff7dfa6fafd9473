//! ABOUTME: Core data types and structures for the scheduling engine
//! ABOUTME: Defines jobs, execution logs, retry policies, and their validation

use ch_core::{Error, Id, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Interval bounds for recurring jobs, milliseconds
pub const MIN_INTERVAL_MS: i64 = 1_000;
pub const MAX_INTERVAL_MS: i64 = 2_592_000_000; // 30 days

/// How long a completed job lingers before the TTL sweep removes it
pub const COMPLETED_JOB_TTL_MS: i64 = 5 * 24 * 3_600_000;

/// How long execution logs are retained
pub const EXECUTION_LOG_TTL_MS: i64 = 30 * 24 * 3_600_000;

/// Default stale-lock threshold and handler deadline
pub const DEFAULT_LOCK_TIMEOUT_MS: i64 = 300_000;

/// Whether a job runs once or on a recurring schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    OneTime,
    Recurring,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneTime => "one_time",
            Self::Recurring => "recurring",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "one_time" => Ok(Self::OneTime),
            "recurring" => Ok(Self::Recurring),
            other => Err(Error::Validation(format!("Unknown job kind: {}", other))),
        }
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Created but not yet scheduled
    Pending,
    /// Waiting for its next_run_at to come due
    Scheduled,
    /// Claimed by a worker, execution not yet started
    Queued,
    /// Handler is executing
    Running,
    /// Finished successfully with no further occurrences
    Completed,
    /// Failed permanently
    Failed,
    /// Suspended by the API; skipped by the picker
    Paused,
    /// Cancelled before execution
    Cancelled,
    /// Gated on a parent job that has not completed yet
    Waiting,
    /// Parent job failed permanently; this job will never run
    Blocked,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Waiting => "waiting",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "scheduled" => Ok(Self::Scheduled),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            "waiting" => Ok(Self::Waiting),
            "blocked" => Ok(Self::Blocked),
            other => Err(Error::Validation(format!("Unknown job status: {}", other))),
        }
    }

    /// Terminal relative to scheduling: the picker will never touch this job again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Blocked
        )
    }
}

/// Backoff strategy between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategy {
    Fixed,
    Exponential,
    Linear,
    Fibonacci,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Fibonacci => "fibonacci",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "fibonacci" => Ok(Self::Fibonacci),
            other => Err(Error::Validation(format!(
                "Unknown retry strategy: {}",
                other
            ))),
        }
    }
}

/// Per-job retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the first failure (0-10)
    pub max_retries: u32,
    /// Base delay before the next attempt, milliseconds
    pub retry_delay_ms: i64,
    /// Legacy toggle kept for records created before strategies existed
    pub use_exponential_backoff: bool,
    /// Cap applied to the computed delay; defaults to one hour when unset
    pub max_retry_delay_ms: Option<i64>,
    /// Explicit strategy; wins over the legacy toggle when set
    pub strategy: Option<RetryStrategy>,
    pub jitter_enabled: bool,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 60_000,
            use_exponential_backoff: true,
            max_retry_delay_ms: None,
            strategy: None,
            jitter_enabled: true,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Resolve the strategy actually in force for this policy
    pub fn effective_strategy(&self) -> RetryStrategy {
        match self.strategy {
            Some(s) => s,
            None if self.use_exponential_backoff => RetryStrategy::Exponential,
            None => RetryStrategy::Fixed,
        }
    }

    /// Effective delay cap, milliseconds
    pub fn delay_cap_ms(&self) -> i64 {
        self.max_retry_delay_ms.unwrap_or(3_600_000)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries > 10 {
            return Err(Error::Validation(
                "max_retries must be at most 10".to_string(),
            ));
        }
        if self.retry_delay_ms < 1000 {
            return Err(Error::Validation(
                "retry_delay_ms must be at least 1000".to_string(),
            ));
        }
        if let Some(cap) = self.max_retry_delay_ms {
            if cap < self.retry_delay_ms {
                return Err(Error::Validation(
                    "max_retry_delay_ms must not be below retry_delay_ms".to_string(),
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(Error::Validation(
                "jitter_factor must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// A persisted job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque surrogate key
    pub id: String,
    /// Sequential human-readable id, rendered as text at the API boundary
    pub job_number: i64,
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    /// IANA timezone name the schedule is evaluated in
    pub timezone: String,
    /// Principal that created the job; opaque to the engine
    pub created_by: Option<String>,
    pub kind: JobKind,
    pub schedule_time: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    pub interval_ms: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Key into the handler registry
    pub task_type: String,
    pub payload: serde_json::Value,
    /// 1 (highest) through 10 (lowest)
    pub priority: i32,
    pub status: JobStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub execution_duration_ms: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_stack: Option<String>,
    pub last_result: Option<serde_json::Value>,
    pub retry: RetryPolicy,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_timeout_ms: i64,
    pub depends_on_job_id: Option<String>,
    pub is_active: bool,
    pub expire_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The human-readable id handed to API consumers
    pub fn public_id(&self) -> String {
        self.job_number.to_string()
    }
}

/// Request to create a new job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub timezone: String,
    pub created_by: Option<String>,
    pub kind: JobKind,
    pub schedule_time: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    pub interval_ms: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub retry: RetryPolicy,
    pub lock_timeout_ms: i64,
    pub depends_on_job_id: Option<String>,
}

impl NewJob {
    /// A one-time job firing at the given absolute time
    pub fn one_time(
        name: impl Into<String>,
        task_type: impl Into<String>,
        schedule_time: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            tags: Vec::new(),
            timezone: "UTC".to_string(),
            created_by: None,
            kind: JobKind::OneTime,
            schedule_time: Some(schedule_time),
            cron_expression: None,
            interval_ms: None,
            start_time: None,
            end_time: None,
            task_type: task_type.into(),
            payload: serde_json::json!({}),
            priority: 5,
            retry: RetryPolicy::default(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            depends_on_job_id: None,
        }
    }

    /// A recurring job driven by a standard 5-field cron expression
    pub fn recurring_cron(
        name: impl Into<String>,
        task_type: impl Into<String>,
        cron_expression: impl Into<String>,
    ) -> Self {
        let mut job = Self::one_time(name, task_type, Utc::now());
        job.kind = JobKind::Recurring;
        job.schedule_time = None;
        job.cron_expression = Some(cron_expression.into());
        job
    }

    /// A recurring job firing every `interval_ms` milliseconds
    pub fn recurring_interval(
        name: impl Into<String>,
        task_type: impl Into<String>,
        interval_ms: i64,
    ) -> Self {
        let mut job = Self::one_time(name, task_type, Utc::now());
        job.kind = JobKind::Recurring;
        job.schedule_time = None;
        job.interval_ms = Some(interval_ms);
        job
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lock_timeout_ms(mut self, lock_timeout_ms: i64) -> Self {
        self.lock_timeout_ms = lock_timeout_ms;
        self
    }

    pub fn with_depends_on(mut self, parent_id: impl Into<String>) -> Self {
        self.depends_on_job_id = Some(parent_id.into());
        self
    }

    pub fn with_bounds(
        mut self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    /// Validate everything checkable at rest; `now` anchors the past-time checks
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        let name_len = self.name.chars().count();
        if !(3..=200).contains(&name_len) {
            return Err(Error::Validation(
                "Job name must be between 3 and 200 characters".to_string(),
            ));
        }
        if let Some(desc) = &self.description {
            if desc.chars().count() > 1000 {
                return Err(Error::Validation(
                    "Job description must be at most 1000 characters".to_string(),
                ));
            }
        }
        if self.task_type.is_empty() {
            return Err(Error::Validation("Task type cannot be empty".to_string()));
        }
        if !(1..=10).contains(&self.priority) {
            return Err(Error::Validation(
                "Priority must be between 1 and 10".to_string(),
            ));
        }
        if self.lock_timeout_ms < 1000 {
            return Err(Error::Validation(
                "lock_timeout_ms must be at least 1000".to_string(),
            ));
        }
        crate::schedule::validate_timezone(&self.timezone)?;
        self.retry.validate()?;

        match self.kind {
            JobKind::OneTime => {
                if self.cron_expression.is_some() || self.interval_ms.is_some() {
                    return Err(Error::Validation(
                        "One-time jobs take a schedule time, not a cron expression or interval"
                            .to_string(),
                    ));
                }
                let at = self.schedule_time.ok_or_else(|| {
                    Error::Validation("One-time jobs require a schedule time".to_string())
                })?;
                if at <= now {
                    return Err(Error::Scheduling(
                        "Schedule time must be in the future".to_string(),
                    ));
                }
            }
            JobKind::Recurring => {
                if self.schedule_time.is_some() {
                    return Err(Error::Validation(
                        "Recurring jobs take a cron expression or interval, not a schedule time"
                            .to_string(),
                    ));
                }
                match (&self.cron_expression, self.interval_ms) {
                    (Some(_), Some(_)) | (None, None) => {
                        return Err(Error::Validation(
                            "Recurring jobs require exactly one of cron expression or interval"
                                .to_string(),
                        ));
                    }
                    (Some(expr), None) => {
                        crate::schedule::parse_cron(expr)?;
                    }
                    (None, Some(interval)) => {
                        if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval) {
                            return Err(Error::Validation(format!(
                                "Interval must be between {} and {} ms",
                                MIN_INTERVAL_MS, MAX_INTERVAL_MS
                            )));
                        }
                    }
                }
            }
        }

        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start >= end {
                return Err(Error::Validation(
                    "start_time must be before end_time".to_string(),
                ));
            }
        }
        if let Some(end) = self.end_time {
            if end <= now {
                return Err(Error::Scheduling(
                    "end_time must be in the future".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Outcome of a single execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStatus {
    Running,
    Success,
    Failed,
    Timeout,
    Skipped,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "skipped" => Ok(Self::Skipped),
            other => Err(Error::Validation(format!("Unknown log status: {}", other))),
        }
    }
}

/// One record per execution attempt, with job identity frozen at execution time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: String,
    pub job_id: String,
    pub job_number: i64,
    pub job_name: String,
    pub job_kind: JobKind,
    pub task_type: String,
    /// The next_run_at the job was claimed for
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: LogStatus,
    /// 0 for the first attempt
    pub retry_attempt: u32,
    pub is_retry: bool,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub error_code: Option<String>,
    pub worker_id: Option<String>,
    pub worker_host: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub expire_at: DateTime<Utc>,
}

impl ExecutionLog {
    /// Open a log record for an attempt that is about to run
    pub fn begin(job: &Job, worker_id: &str, worker_host: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Id::new().to_string(),
            job_id: job.id.clone(),
            job_number: job.job_number,
            job_name: job.name.clone(),
            job_kind: job.kind,
            task_type: job.task_type.clone(),
            scheduled_for: job.next_run_at,
            started_at: now,
            finished_at: None,
            duration_ms: None,
            status: LogStatus::Running,
            retry_attempt: job.retry_count,
            is_retry: job.retry_count > 0,
            error_message: None,
            error_stack: None,
            error_code: None,
            worker_id: Some(worker_id.to_string()),
            worker_host: Some(worker_host.to_string()),
            payload: Some(job.payload.clone()),
            result: None,
            metadata: None,
            expire_at: now + chrono::Duration::milliseconds(EXECUTION_LOG_TTL_MS),
        }
    }
}

/// Filter for job listing queries
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub task_type: Option<String>,
    pub tag: Option<String>,
    pub active_only: bool,
    /// Substring match over name and description
    pub search: Option<String>,
    pub limit: Option<u32>,
}

/// Aggregate store statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_jobs: i64,
    pub active_jobs: i64,
    pub by_status: std::collections::HashMap<String, i64>,
    pub by_task_type: std::collections::HashMap<String, i64>,
    pub avg_execution_ms: Option<f64>,
}

/// One bucket of the hourly execution histogram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub hour_start: DateTime<Utc>,
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base_one_time() -> NewJob {
        NewJob::one_time("nightly export", "export", Utc::now() + Duration::hours(1))
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Scheduled,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Paused,
            JobStatus::Cancelled,
            JobStatus::Waiting,
            JobStatus::Blocked,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::parse("bogus").is_err());
    }

    #[test]
    fn test_one_time_validation() {
        let now = Utc::now();
        assert!(base_one_time().validate(now).is_ok());

        let mut past = base_one_time();
        past.schedule_time = Some(now - Duration::seconds(5));
        assert!(past.validate(now).is_err());

        let mut both = base_one_time();
        both.interval_ms = Some(5000);
        assert!(both.validate(now).is_err());

        let mut short_name = base_one_time();
        short_name.name = "ab".to_string();
        assert!(short_name.validate(now).is_err());
    }

    #[test]
    fn test_recurring_requires_exactly_one_source() {
        let now = Utc::now();

        let cron_job = NewJob::recurring_cron("report rollup", "report", "*/5 * * * *");
        assert!(cron_job.validate(now).is_ok());

        let interval_job = NewJob::recurring_interval("cache warm", "warm", 5000);
        assert!(interval_job.validate(now).is_ok());

        let mut neither = NewJob::recurring_interval("cache warm", "warm", 5000);
        neither.interval_ms = None;
        assert!(neither.validate(now).is_err());

        let mut both = NewJob::recurring_interval("cache warm", "warm", 5000);
        both.cron_expression = Some("*/5 * * * *".to_string());
        assert!(both.validate(now).is_err());

        let mut tiny = NewJob::recurring_interval("cache warm", "warm", 500);
        tiny.interval_ms = Some(500);
        assert!(tiny.validate(now).is_err());
    }

    #[test]
    fn test_priority_bounds() {
        let now = Utc::now();
        for bad in [0, 11, -3] {
            let job = base_one_time().with_priority(bad);
            assert!(job.validate(now).is_err(), "priority {} accepted", bad);
        }
        assert!(base_one_time().with_priority(1).validate(now).is_ok());
        assert!(base_one_time().with_priority(10).validate(now).is_ok());
    }

    #[test]
    fn test_bad_timezone_rejected() {
        let job = base_one_time().with_timezone("Mars/Olympus");
        assert!(job.validate(Utc::now()).is_err());
    }

    #[test]
    fn test_effective_strategy_resolution() {
        let mut policy = RetryPolicy::default();
        assert_eq!(policy.effective_strategy(), RetryStrategy::Exponential);

        policy.use_exponential_backoff = false;
        assert_eq!(policy.effective_strategy(), RetryStrategy::Fixed);

        policy.strategy = Some(RetryStrategy::Fibonacci);
        assert_eq!(policy.effective_strategy(), RetryStrategy::Fibonacci);
    }

    #[test]
    fn test_retry_policy_validation() {
        let mut policy = RetryPolicy {
            max_retries: 11,
            ..Default::default()
        };
        assert!(policy.validate().is_err());

        policy.max_retries = 5;
        policy.retry_delay_ms = 100;
        assert!(policy.validate().is_err());

        policy.retry_delay_ms = 60_000;
        policy.max_retry_delay_ms = Some(1_000);
        assert!(policy.validate().is_err());

        policy.max_retry_delay_ms = Some(120_000);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_log_begin_freezes_identity() {
        let now = Utc::now();
        let job = Job {
            id: "j1".to_string(),
            job_number: 42,
            name: "nightly export".to_string(),
            description: None,
            tags: vec![],
            timezone: "UTC".to_string(),
            created_by: None,
            kind: JobKind::OneTime,
            schedule_time: Some(now),
            cron_expression: None,
            interval_ms: None,
            start_time: None,
            end_time: None,
            task_type: "export".to_string(),
            payload: serde_json::json!({"scope": "full"}),
            priority: 5,
            status: JobStatus::Queued,
            next_run_at: Some(now),
            last_run_at: None,
            retry_count: 2,
            execution_duration_ms: None,
            last_error: None,
            last_error_stack: None,
            last_result: None,
            retry: RetryPolicy::default(),
            locked_by: Some("w1".to_string()),
            locked_at: Some(now),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            depends_on_job_id: None,
            is_active: true,
            expire_at: None,
            paused_at: None,
            created_at: now,
            updated_at: now,
        };

        let log = ExecutionLog::begin(&job, "w1", "host-a", now);
        assert_eq!(log.job_number, 42);
        assert_eq!(log.retry_attempt, 2);
        assert!(log.is_retry);
        assert_eq!(log.status, LogStatus::Running);
        assert_eq!(log.payload, Some(serde_json::json!({"scope": "full"})));
        assert_eq!(
            log.expire_at,
            now + chrono::Duration::milliseconds(EXECUTION_LOG_TTL_MS)
        );
    }
}
