//! ABOUTME: Execution log store recording one row per attempt
//! ABOUTME: Rows open as running, close exactly once, and expire after 30 days

use crate::types::{ExecutionLog, HourlyBucket, JobKind, LogStatus};
use ch_core::time::{from_millis, to_millis};
use ch_core::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;

/// Fields written when an attempt finishes
#[derive(Debug, Clone)]
pub struct FinishLog {
    pub status: LogStatus,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub error_code: Option<String>,
    pub result: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

/// Store for execution log records
#[derive(Clone)]
pub struct ExecutionLogStore {
    pool: SqlitePool,
}

impl ExecutionLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert an open (running) log record for an attempt
    pub async fn begin(&self, log: &ExecutionLog) -> Result<()> {
        let payload_json = log
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Validation(format!("Failed to serialize payload: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO execution_logs (
                id, job_id, job_number, job_name, job_kind, task_type,
                scheduled_for, started_at, status, retry_attempt, is_retry,
                worker_id, worker_host, payload, expire_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&log.id)
        .bind(&log.job_id)
        .bind(log.job_number)
        .bind(&log.job_name)
        .bind(log.job_kind.as_str())
        .bind(&log.task_type)
        .bind(log.scheduled_for.map(to_millis))
        .bind(to_millis(log.started_at))
        .bind(log.status.as_str())
        .bind(log.retry_attempt as i64)
        .bind(log.is_retry as i32)
        .bind(&log.worker_id)
        .bind(&log.worker_host)
        .bind(payload_json)
        .bind(to_millis(log.expire_at))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to write execution log: {}", e)))?;

        debug!(log_id = %log.id, job_id = %log.job_id, attempt = log.retry_attempt, "Opened execution log");
        Ok(())
    }

    /// Close an open log record with its outcome. Logs are append-only in
    /// spirit: a record closes once and is never rewritten afterwards.
    pub async fn finish(&self, id: &str, outcome: FinishLog) -> Result<Option<ExecutionLog>> {
        let result_json = outcome
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Validation(format!("Failed to serialize result: {}", e)))?;
        let metadata_json = outcome
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Validation(format!("Failed to serialize metadata: {}", e)))?;

        let row = sqlx::query(
            r#"
            UPDATE execution_logs
            SET status = ?2, finished_at = ?3, duration_ms = ?4,
                error_message = ?5, error_stack = ?6, error_code = ?7,
                result = ?8, metadata = ?9
            WHERE id = ?1 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(outcome.status.as_str())
        .bind(to_millis(outcome.finished_at))
        .bind(outcome.duration_ms)
        .bind(&outcome.error_message)
        .bind(&outcome.error_stack)
        .bind(&outcome.error_code)
        .bind(result_json)
        .bind(metadata_json)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to close execution log: {}", e)))?;

        row.map(row_to_log).transpose()
    }

    pub async fn get(&self, id: &str) -> Result<Option<ExecutionLog>> {
        let row = sqlx::query("SELECT * FROM execution_logs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get execution log: {}", e)))?;
        row.map(row_to_log).transpose()
    }

    /// Logs for a job, newest first
    pub async fn list_for_job(&self, job_id: &str, limit: Option<u32>) -> Result<Vec<ExecutionLog>> {
        let limit_clause = limit.map_or_else(String::new, |l| format!(" LIMIT {}", l));
        let query = format!(
            "SELECT * FROM execution_logs WHERE job_id = ?1 ORDER BY started_at DESC, retry_attempt DESC{}",
            limit_clause
        );

        let rows = sqlx::query(&query)
            .bind(job_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list execution logs: {}", e)))?;

        rows.into_iter().map(row_to_log).collect()
    }

    pub async fn count_for_job(&self, job_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM execution_logs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to count execution logs: {}", e)))?;
        Ok(row.get::<i64, _>("count"))
    }

    /// TTL sweep: drop logs whose retention window has passed
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM execution_logs WHERE expire_at < ?1")
            .bind(to_millis(now))
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to purge execution logs: {}", e)))?;
        Ok(result.rows_affected())
    }

    /// Execution counts bucketed per hour over the trailing window
    pub async fn hourly_histogram(
        &self,
        now: DateTime<Utc>,
        hours: i64,
    ) -> Result<Vec<HourlyBucket>> {
        let window_start = now - Duration::hours(hours);

        let rows = sqlx::query(
            r#"
            SELECT (started_at / 3600000) * 3600000 AS bucket,
                   COUNT(*) as total,
                   SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END) as succeeded,
                   SUM(CASE WHEN status IN ('failed', 'timeout') THEN 1 ELSE 0 END) as failed
            FROM execution_logs
            WHERE started_at >= ?1
            GROUP BY bucket
            ORDER BY bucket
            "#,
        )
        .bind(to_millis(window_start))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to build histogram: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| HourlyBucket {
                hour_start: from_millis(row.get::<i64, _>("bucket")),
                total: row.get("total"),
                succeeded: row.get("succeeded"),
                failed: row.get("failed"),
            })
            .collect())
    }
}

fn row_to_log(row: SqliteRow) -> Result<ExecutionLog> {
    let payload = row
        .get::<Option<String>, _>("payload")
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| Error::Validation(format!("Failed to parse payload: {}", e)))?;
    let result = row
        .get::<Option<String>, _>("result")
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| Error::Validation(format!("Failed to parse result: {}", e)))?;
    let metadata = row
        .get::<Option<String>, _>("metadata")
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| Error::Validation(format!("Failed to parse metadata: {}", e)))?;

    Ok(ExecutionLog {
        id: row.get("id"),
        job_id: row.get("job_id"),
        job_number: row.get("job_number"),
        job_name: row.get("job_name"),
        job_kind: JobKind::parse(&row.get::<String, _>("job_kind"))?,
        task_type: row.get("task_type"),
        scheduled_for: row.get::<Option<i64>, _>("scheduled_for").map(from_millis),
        started_at: from_millis(row.get("started_at")),
        finished_at: row.get::<Option<i64>, _>("finished_at").map(from_millis),
        duration_ms: row.get("duration_ms"),
        status: LogStatus::parse(&row.get::<String, _>("status"))?,
        retry_attempt: row.get::<i64, _>("retry_attempt") as u32,
        is_retry: row.get::<i64, _>("is_retry") != 0,
        error_message: row.get("error_message"),
        error_stack: row.get("error_stack"),
        error_code: row.get("error_code"),
        worker_id: row.get("worker_id"),
        worker_host: row.get("worker_host"),
        payload,
        result,
        metadata,
        expire_at: from_millis(row.get("expire_at")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStore;
    use crate::types::NewJob;
    use ch_db::Db;

    async fn test_stores() -> (tempfile::TempDir, JobStore, ExecutionLogStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs_test.db");
        let db = Db::new(path.to_str().unwrap()).await.expect("test db");
        (
            dir,
            JobStore::new(db.pool().clone()),
            ExecutionLogStore::new(db.pool().clone()),
        )
    }

    async fn seeded_job(store: &JobStore) -> crate::types::Job {
        store
            .create(NewJob::one_time(
                "logged job",
                "echo",
                Utc::now() + Duration::seconds(1),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_begin_and_finish_log() {
        let (_dir, jobs, logs) = test_stores().await;
        let job = seeded_job(&jobs).await;
        let now = Utc::now();

        let log = ExecutionLog::begin(&job, "w1", "host-a", now);
        logs.begin(&log).await.unwrap();

        let open = logs.get(&log.id).await.unwrap().unwrap();
        assert_eq!(open.status, LogStatus::Running);
        assert_eq!(open.job_name, "logged job");
        assert!(open.finished_at.is_none());

        let finished_at = now + Duration::milliseconds(250);
        let closed = logs
            .finish(
                &log.id,
                FinishLog {
                    status: LogStatus::Success,
                    finished_at,
                    duration_ms: 250,
                    error_message: None,
                    error_stack: None,
                    error_code: None,
                    result: Some(serde_json::json!({"ok": true})),
                    metadata: None,
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(closed.status, LogStatus::Success);
        assert_eq!(closed.duration_ms, Some(250));
        assert_eq!(closed.result, Some(serde_json::json!({"ok": true})));

        // A closed record cannot be closed again
        let again = logs
            .finish(
                &log.id,
                FinishLog {
                    status: LogStatus::Failed,
                    finished_at,
                    duration_ms: 1,
                    error_message: Some("late".to_string()),
                    error_stack: None,
                    error_code: None,
                    result: None,
                    metadata: None,
                },
            )
            .await
            .unwrap();
        assert!(again.is_none());
        let still = logs.get(&log.id).await.unwrap().unwrap();
        assert_eq!(still.status, LogStatus::Success);
    }

    #[tokio::test]
    async fn test_list_for_job_orders_newest_first() {
        let (_dir, jobs, logs) = test_stores().await;
        let job = seeded_job(&jobs).await;
        let now = Utc::now();

        for attempt in 0..3u32 {
            let mut log = ExecutionLog::begin(&job, "w1", "host-a", now + Duration::seconds(attempt as i64));
            log.retry_attempt = attempt;
            log.is_retry = attempt > 0;
            logs.begin(&log).await.unwrap();
        }

        assert_eq!(logs.count_for_job(&job.id).await.unwrap(), 3);
        let listed = logs.list_for_job(&job.id, None).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].retry_attempt, 2);
        assert_eq!(listed[2].retry_attempt, 0);

        let limited = logs.list_for_job(&job.id, Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired_logs() {
        let (_dir, jobs, logs) = test_stores().await;
        let job = seeded_job(&jobs).await;
        let now = Utc::now();

        let log = ExecutionLog::begin(&job, "w1", "host-a", now);
        logs.begin(&log).await.unwrap();

        assert_eq!(logs.purge_expired(now).await.unwrap(), 0);
        let past_retention = log.expire_at + Duration::seconds(1);
        assert_eq!(logs.purge_expired(past_retention).await.unwrap(), 1);
        assert!(logs.get(&log.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hourly_histogram_buckets() {
        let (_dir, jobs, logs) = test_stores().await;
        let job = seeded_job(&jobs).await;
        let now = Utc::now();

        for (offset_s, status) in [(0, LogStatus::Success), (1, LogStatus::Failed)] {
            let log = ExecutionLog::begin(&job, "w1", "host-a", now + Duration::seconds(offset_s));
            logs.begin(&log).await.unwrap();
            logs.finish(
                &log.id,
                FinishLog {
                    status,
                    finished_at: now + Duration::seconds(offset_s + 1),
                    duration_ms: 1000,
                    error_message: None,
                    error_stack: None,
                    error_code: None,
                    result: None,
                    metadata: None,
                },
            )
            .await
            .unwrap();
        }

        let buckets = logs.hourly_histogram(now + Duration::minutes(1), 24).await.unwrap();
        let total: i64 = buckets.iter().map(|b| b.total).sum();
        let succeeded: i64 = buckets.iter().map(|b| b.succeeded).sum();
        let failed: i64 = buckets.iter().map(|b| b.failed).sum();
        assert_eq!(total, 2);
        assert_eq!(succeeded, 1);
        assert_eq!(failed, 1);
    }
}
