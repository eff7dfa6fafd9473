//! ABOUTME: Job store owning every SQL statement that touches the jobs table
//! ABOUTME: All state transitions are single conditional writes keyed on the job id

use crate::counter::CounterStore;
use crate::schedule;
use crate::types::*;
use ch_core::time::{from_millis, to_millis};
use ch_core::{Error, Id, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::collections::HashMap;
use tracing::debug;

/// Counter that mints sequential job numbers
const JOB_COUNTER: &str = "jobs";
const JOB_COUNTER_SEED: i64 = 1;

/// Store for job records.
///
/// Every mutation is one conditional `UPDATE ... WHERE <expected state>
/// RETURNING *`. SQLite runs a statement atomically, so when two workers race
/// on the same row exactly one sees the match and the other sees nothing.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Validate and insert a new job with a counter-minted sequential number.
    ///
    /// Jobs with a parent start out WAITING; everything else starts SCHEDULED
    /// with its first run time resolved from the schedule.
    pub async fn create(&self, new_job: NewJob) -> Result<Job> {
        let now = Utc::now();
        new_job.validate(now)?;

        let (status, next_run_at) = if new_job.depends_on_job_id.is_some() {
            (JobStatus::Waiting, None)
        } else {
            let first = schedule::initial_run(&new_job, now)?.ok_or_else(|| {
                Error::Scheduling("No occurrence fits before the end time".to_string())
            })?;
            (JobStatus::Scheduled, Some(first))
        };

        let counters = CounterStore::new(self.pool.clone());
        let tags_json = serde_json::to_string(&new_job.tags)
            .map_err(|e| Error::Validation(format!("Failed to serialize tags: {}", e)))?;
        let payload_json = serde_json::to_string(&new_job.payload)
            .map_err(|e| Error::Validation(format!("Failed to serialize payload: {}", e)))?;

        // A seeded counter can collide with rows imported from elsewhere;
        // mint a fresh number and try again.
        let mut last_err = None;
        for _ in 0..3 {
            let job_number = counters.next(JOB_COUNTER, JOB_COUNTER_SEED).await?;
            let id = Id::new().to_string();

            let inserted = sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, job_number, name, description, tags, timezone, created_by,
                    kind, schedule_time, cron_expression, interval_ms, start_time, end_time,
                    task_type, payload, priority, status, next_run_at,
                    max_retries, retry_delay_ms, use_exponential_backoff,
                    max_retry_delay_ms, retry_strategy, jitter_enabled, jitter_factor,
                    lock_timeout_ms, depends_on_job_id, is_active, created_at, updated_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                    ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18,
                    ?19, ?20, ?21,
                    ?22, ?23, ?24, ?25,
                    ?26, ?27, 1, ?28, ?28
                )
                RETURNING *
                "#,
            )
            .bind(&id)
            .bind(job_number)
            .bind(&new_job.name)
            .bind(&new_job.description)
            .bind(&tags_json)
            .bind(&new_job.timezone)
            .bind(&new_job.created_by)
            .bind(new_job.kind.as_str())
            .bind(new_job.schedule_time.map(to_millis))
            .bind(&new_job.cron_expression)
            .bind(new_job.interval_ms)
            .bind(new_job.start_time.map(to_millis))
            .bind(new_job.end_time.map(to_millis))
            .bind(&new_job.task_type)
            .bind(&payload_json)
            .bind(new_job.priority)
            .bind(status.as_str())
            .bind(next_run_at.map(to_millis))
            .bind(new_job.retry.max_retries as i64)
            .bind(new_job.retry.retry_delay_ms)
            .bind(new_job.retry.use_exponential_backoff as i32)
            .bind(new_job.retry.max_retry_delay_ms)
            .bind(new_job.retry.strategy.map(|s| s.as_str()))
            .bind(new_job.retry.jitter_enabled as i32)
            .bind(new_job.retry.jitter_factor)
            .bind(new_job.lock_timeout_ms)
            .bind(&new_job.depends_on_job_id)
            .bind(to_millis(now))
            .fetch_one(&self.pool)
            .await;

            match inserted {
                Ok(row) => {
                    let job = row_to_job(row)?;
                    debug!(job_id = %job.id, number = job.job_number, "Created job");
                    return Ok(job);
                }
                Err(e) if is_unique_violation(&e) => {
                    last_err = Some(e);
                    continue;
                }
                Err(e) => {
                    return Err(Error::Database(format!("Failed to create job: {}", e)));
                }
            }
        }

        Err(Error::Database(format!(
            "Failed to allocate a unique job number: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Find a job by surrogate id
    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get job: {}", e)))?;
        row.map(row_to_job).transpose()
    }

    /// Find a job by its human-readable sequential number
    pub async fn get_by_number(&self, job_number: i64) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_number = ?1")
            .bind(job_number)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get job: {}", e)))?;
        row.map(row_to_job).transpose()
    }

    /// List jobs matching a filter
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut query = "SELECT * FROM jobs WHERE 1=1".to_string();
        let mut params: Vec<String> = Vec::new();

        if filter.active_only {
            query.push_str(" AND is_active = 1");
        }
        if let Some(status) = filter.status {
            query.push_str(" AND status = ?");
            params.push(status.as_str().to_string());
        }
        if let Some(task_type) = &filter.task_type {
            query.push_str(" AND task_type = ?");
            params.push(task_type.clone());
        }
        if let Some(search) = &filter.search {
            query.push_str(" AND (name LIKE ? OR description LIKE ?)");
            let pattern = format!("%{}%", search);
            params.push(pattern.clone());
            params.push(pattern);
        }

        query.push_str(" ORDER BY job_number DESC");
        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {}", limit));
        }

        let mut db_query = sqlx::query(&query);
        for param in &params {
            db_query = db_query.bind(param);
        }

        let rows = db_query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list jobs: {}", e)))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(row_to_job(row)?);
        }

        // Tags live in a JSON column; filter in memory
        if let Some(tag) = &filter.tag {
            jobs.retain(|job| job.tags.iter().any(|t| t == tag));
        }

        Ok(jobs)
    }

    /// Atomically claim the most urgent due job for this worker.
    ///
    /// Filter, sort, and update happen in one statement; at most one worker
    /// can win a given row. A row with a stale lock (locked_at plus its own
    /// lock_timeout_ms in the past) is claimable again.
    pub async fn claim_due(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', locked_by = ?1, locked_at = ?2, updated_at = ?2
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'scheduled'
                  AND is_active = 1
                  AND next_run_at IS NOT NULL
                  AND next_run_at <= ?2
                  AND (locked_by IS NULL OR locked_at IS NULL OR locked_at + lock_timeout_ms < ?2)
                ORDER BY priority ASC, next_run_at ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to claim job: {}", e)))?;

        row.map(row_to_job).transpose()
    }

    /// Count jobs the claim filter would currently match
    pub async fn count_due(&self, now: DateTime<Utc>) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) as count FROM jobs
            WHERE status = 'scheduled'
              AND is_active = 1
              AND next_run_at IS NOT NULL
              AND next_run_at <= ?1
              AND (locked_by IS NULL OR locked_at IS NULL OR locked_at + lock_timeout_ms < ?1)
            "#,
        )
        .bind(to_millis(now))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to count due jobs: {}", e)))?;

        Ok(row.get::<i64, _>("count"))
    }

    /// Move a claimed job into RUNNING, re-asserting lock ownership
    pub async fn mark_running(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', locked_by = ?2, locked_at = ?3, last_run_at = ?3, updated_at = ?3
            WHERE id = ?1 AND status = 'queued' AND locked_by = ?2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to mark job running: {}", e)))?;

        row.map(row_to_job).transpose()
    }

    /// Terminal success: COMPLETED, error fields cleared, lock released, and a
    /// TTL stamped so the sweep eventually purges the record.
    pub async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        duration_ms: i64,
        result: Option<&serde_json::Value>,
    ) -> Result<Option<Job>> {
        let result_json = result
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Validation(format!("Failed to serialize result: {}", e)))?;
        let expire_at = now + Duration::milliseconds(COMPLETED_JOB_TTL_MS);

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', last_result = ?4, execution_duration_ms = ?5,
                last_error = NULL, last_error_stack = NULL,
                locked_by = NULL, locked_at = NULL,
                next_run_at = NULL, expire_at = ?6, updated_at = ?3
            WHERE id = ?1 AND status = 'running' AND locked_by = ?2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(to_millis(now))
        .bind(result_json)
        .bind(duration_ms)
        .bind(to_millis(expire_at))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to complete job: {}", e)))?;

        row.map(row_to_job).transpose()
    }

    /// Successful recurring occurrence: back to SCHEDULED with the next run
    /// time and a fresh retry budget.
    pub async fn reschedule_recurring(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        duration_ms: i64,
        result: Option<&serde_json::Value>,
        next_run_at: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let result_json = result
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Validation(format!("Failed to serialize result: {}", e)))?;

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'scheduled', next_run_at = ?4, retry_count = 0,
                last_result = ?5, execution_duration_ms = ?6,
                last_error = NULL, last_error_stack = NULL,
                locked_by = NULL, locked_at = NULL, updated_at = ?3
            WHERE id = ?1 AND status = 'running' AND locked_by = ?2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(to_millis(now))
        .bind(to_millis(next_run_at))
        .bind(result_json)
        .bind(duration_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to reschedule job: {}", e)))?;

        row.map(row_to_job).transpose()
    }

    /// Retryable failure: back to SCHEDULED after the backoff delay, with the
    /// attempt counted. The retry budget guard keeps retry_count within
    /// max_retries even if a racing caller slips through the executor's check.
    pub async fn schedule_retry(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        duration_ms: i64,
        error_message: &str,
        error_stack: Option<&str>,
        next_run_at: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'scheduled', next_run_at = ?4, retry_count = retry_count + 1,
                last_error = ?5, last_error_stack = ?6, execution_duration_ms = ?7,
                locked_by = NULL, locked_at = NULL, updated_at = ?3
            WHERE id = ?1 AND status = 'running' AND locked_by = ?2
              AND retry_count < max_retries
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(to_millis(now))
        .bind(to_millis(next_run_at))
        .bind(error_message)
        .bind(error_stack)
        .bind(duration_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to schedule retry: {}", e)))?;

        row.map(row_to_job).transpose()
    }

    /// Permanent failure: FAILED, lock released, final error retained
    pub async fn fail_permanently(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        duration_ms: i64,
        error_message: &str,
        error_stack: Option<&str>,
    ) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', last_error = ?4, last_error_stack = ?5,
                execution_duration_ms = ?6, next_run_at = NULL,
                locked_by = NULL, locked_at = NULL, updated_at = ?3
            WHERE id = ?1 AND status = 'running' AND locked_by = ?2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(to_millis(now))
        .bind(error_message)
        .bind(error_stack)
        .bind(duration_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to fail job: {}", e)))?;

        row.map(row_to_job).transpose()
    }

    /// Voluntarily return a held job to SCHEDULED (drain path); the attempt is
    /// not counted against the retry budget.
    pub async fn release(&self, id: &str, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'scheduled', locked_by = NULL, locked_at = NULL, updated_at = ?3
            WHERE id = ?1 AND locked_by = ?2 AND status IN ('queued', 'running')
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to release job: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Release every job this worker holds
    pub async fn release_all(&self, worker_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'scheduled', locked_by = NULL, locked_at = NULL, updated_at = ?2
            WHERE locked_by = ?1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(worker_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to release jobs: {}", e)))?;

        Ok(result.rows_affected())
    }

    /// Reclaim work abandoned by crashed workers.
    ///
    /// The crash counts as an attempt, clamped so retry_count never exceeds
    /// max_retries. Safe to run concurrently on every worker: once a row is
    /// reset its lock is null and it no longer matches.
    pub async fn recover_stale(
        &self,
        now: DateTime<Utc>,
        threshold_ms: Option<i64>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'scheduled', locked_by = NULL, locked_at = NULL,
                retry_count = MIN(retry_count + 1, max_retries), updated_at = ?1
            WHERE status IN ('queued', 'running')
              AND locked_by IS NOT NULL
              AND locked_at IS NOT NULL
              AND locked_at + COALESCE(?2, lock_timeout_ms) < ?1
            "#,
        )
        .bind(to_millis(now))
        .bind(threshold_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to recover stale jobs: {}", e)))?;

        Ok(result.rows_affected())
    }

    /// Fan-out: wake WAITING children of a parent that completed
    pub async fn schedule_dependents(&self, parent_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'scheduled', next_run_at = ?2, updated_at = ?2
            WHERE depends_on_job_id = ?1 AND status = 'waiting' AND is_active = 1
            "#,
        )
        .bind(parent_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to schedule dependents: {}", e)))?;

        Ok(result.rows_affected())
    }

    /// Block: WAITING children of a permanently failed parent never run
    pub async fn block_dependents(&self, parent_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'blocked', last_error = 'parent job ' || ?1 || ' failed', updated_at = ?2
            WHERE depends_on_job_id = ?1 AND status = 'waiting'
            "#,
        )
        .bind(parent_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to block dependents: {}", e)))?;

        Ok(result.rows_affected())
    }

    /// Cancel a job that has not entered execution. A RUNNING job finishes its
    /// current attempt; cancellation only prevents further pickup.
    pub async fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', next_run_at = NULL,
                locked_by = NULL, locked_at = NULL, updated_at = ?2
            WHERE id = ?1 AND status IN ('pending', 'scheduled', 'queued')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to cancel job: {}", e)))?;

        row.map(row_to_job).transpose()
    }

    /// Pause a job; the picker never sees PAUSED rows
    pub async fn pause(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'paused', paused_at = ?2, updated_at = ?2
            WHERE id = ?1 AND status IN ('pending', 'scheduled')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to pause job: {}", e)))?;

        row.map(row_to_job).transpose()
    }

    /// Resume a paused job; a run time that came due while paused fires now
    pub async fn resume(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'scheduled', paused_at = NULL,
                next_run_at = CASE
                    WHEN next_run_at IS NULL OR next_run_at < ?2 THEN ?2
                    ELSE next_run_at
                END,
                updated_at = ?2
            WHERE id = ?1 AND status = 'paused'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to resume job: {}", e)))?;

        row.map(row_to_job).transpose()
    }

    /// Soft delete; the job stays queryable but is never picked again
    pub async fn soft_delete(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE jobs SET is_active = 0, updated_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(to_millis(now))
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to soft delete job: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// TTL sweep: drop completed jobs whose expiry has passed
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status = 'completed' AND expire_at IS NOT NULL AND expire_at < ?1",
        )
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to purge expired jobs: {}", e)))?;

        Ok(result.rows_affected())
    }

    /// Job counts grouped by status
    pub async fn count_by_status(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) as count FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to count by status: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("status"), row.get::<i64, _>("count")))
            .collect())
    }

    /// Job counts grouped by task type
    pub async fn count_by_task_type(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query("SELECT task_type, COUNT(*) as count FROM jobs GROUP BY task_type")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to count by task type: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("task_type"), row.get::<i64, _>("count")))
            .collect())
    }

    /// Aggregate statistics over the whole collection
    pub async fn stats(&self) -> Result<StoreStats> {
        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) as total,
                   COALESCE(SUM(is_active), 0) as active,
                   AVG(execution_duration_ms) as avg_ms
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get job stats: {}", e)))?;

        Ok(StoreStats {
            total_jobs: totals.get::<i64, _>("total"),
            active_jobs: totals.get::<i64, _>("active"),
            by_status: self.count_by_status().await?,
            by_task_type: self.count_by_task_type().await?,
            avg_execution_ms: totals.get::<Option<f64>, _>("avg_ms"),
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

fn row_to_job(row: SqliteRow) -> Result<Job> {
    let tags_json: String = row.get("tags");
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();

    let payload_json: String = row.get("payload");
    let payload = serde_json::from_str(&payload_json)
        .map_err(|e| Error::Validation(format!("Failed to parse payload: {}", e)))?;

    let last_result = row
        .get::<Option<String>, _>("last_result")
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| Error::Validation(format!("Failed to parse result: {}", e)))?;

    let strategy = row
        .get::<Option<String>, _>("retry_strategy")
        .map(|s| RetryStrategy::parse(&s))
        .transpose()?;

    Ok(Job {
        id: row.get("id"),
        job_number: row.get("job_number"),
        name: row.get("name"),
        description: row.get("description"),
        tags,
        timezone: row.get("timezone"),
        created_by: row.get("created_by"),
        kind: JobKind::parse(&row.get::<String, _>("kind"))?,
        schedule_time: opt_millis(&row, "schedule_time"),
        cron_expression: row.get("cron_expression"),
        interval_ms: row.get("interval_ms"),
        start_time: opt_millis(&row, "start_time"),
        end_time: opt_millis(&row, "end_time"),
        task_type: row.get("task_type"),
        payload,
        priority: row.get("priority"),
        status: JobStatus::parse(&row.get::<String, _>("status"))?,
        next_run_at: opt_millis(&row, "next_run_at"),
        last_run_at: opt_millis(&row, "last_run_at"),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        execution_duration_ms: row.get("execution_duration_ms"),
        last_error: row.get("last_error"),
        last_error_stack: row.get("last_error_stack"),
        last_result,
        retry: RetryPolicy {
            max_retries: row.get::<i64, _>("max_retries") as u32,
            retry_delay_ms: row.get("retry_delay_ms"),
            use_exponential_backoff: row.get::<i64, _>("use_exponential_backoff") != 0,
            max_retry_delay_ms: row.get("max_retry_delay_ms"),
            strategy,
            jitter_enabled: row.get::<i64, _>("jitter_enabled") != 0,
            jitter_factor: row.get("jitter_factor"),
        },
        locked_by: row.get("locked_by"),
        locked_at: opt_millis(&row, "locked_at"),
        lock_timeout_ms: row.get("lock_timeout_ms"),
        depends_on_job_id: row.get("depends_on_job_id"),
        is_active: row.get::<i64, _>("is_active") != 0,
        expire_at: opt_millis(&row, "expire_at"),
        paused_at: opt_millis(&row, "paused_at"),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    })
}

fn opt_millis(row: &SqliteRow, column: &str) -> Option<DateTime<Utc>> {
    row.get::<Option<i64>, _>(column).map(from_millis)
}
