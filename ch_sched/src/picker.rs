//! ABOUTME: Job picker: atomic claims of due jobs and stale-lock recovery
//! ABOUTME: Thin orchestration over the store's conditional writes

use ch_core::{Result, WorkerId};
use ch_store::{Job, JobStore};
use chrono::Utc;
use tracing::{debug, info, warn};

/// Claims due jobs for one worker.
///
/// Exclusivity rests entirely on the store's atomic find-and-update: at most
/// one worker can match and update a given row, so no in-memory coordination
/// between workers exists or is needed.
pub struct JobPicker {
    store: JobStore,
    worker_id: WorkerId,
}

impl JobPicker {
    pub fn new(store: JobStore, worker_id: WorkerId) -> Self {
        Self { store, worker_id }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Claim the single most urgent due job, or nothing
    pub async fn pick_one(&self) -> Result<Option<Job>> {
        let claimed = self.store.claim_due(self.worker_id.as_str(), Utc::now()).await?;

        if let Some(job) = &claimed {
            info!(
                job_id = %job.public_id(),
                task_type = %job.task_type,
                priority = job.priority,
                attempt = job.retry_count,
                "Claimed job"
            );
        }
        Ok(claimed)
    }

    /// Claim up to `n` due jobs, stopping at the first empty pick
    pub async fn pick_many(&self, n: usize) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for _ in 0..n {
            match self.pick_one().await? {
                Some(job) => jobs.push(job),
                None => break,
            }
        }
        Ok(jobs)
    }

    /// Return a claimed job to SCHEDULED without counting an attempt
    pub async fn release(&self, job: &Job) -> Result<bool> {
        let released = self
            .store
            .release(&job.id, self.worker_id.as_str(), Utc::now())
            .await?;
        if released {
            debug!(job_id = %job.public_id(), "Released job back to the queue");
        } else {
            warn!(job_id = %job.public_id(), "Job was not held by this worker");
        }
        Ok(released)
    }

    /// Release everything this worker holds; used during drain
    pub async fn release_all(&self) -> Result<u64> {
        let released = self
            .store
            .release_all(self.worker_id.as_str(), Utc::now())
            .await?;
        if released > 0 {
            info!(count = released, "Released held jobs back to the queue");
        }
        Ok(released)
    }

    /// Reclaim jobs whose workers stopped renewing their locks.
    ///
    /// `threshold_ms` overrides the per-job lock timeout when set. Idempotent
    /// and safe to run concurrently on every worker.
    pub async fn recover_stale_jobs(&self, threshold_ms: Option<i64>) -> Result<u64> {
        let recovered = self.store.recover_stale(Utc::now(), threshold_ms).await?;
        if recovered > 0 {
            warn!(count = recovered, "Recovered stale jobs from crashed workers");
        }
        Ok(recovered)
    }

    /// Diagnostic count of currently pickable jobs
    pub async fn count_due_jobs(&self) -> Result<i64> {
        self.store.count_due(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ch_db::Db;
    use ch_store::{JobStatus, NewJob};
    use chrono::Duration;

    async fn test_picker(worker: &str) -> (tempfile::TempDir, JobStore, JobPicker) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("picker_test.db");
        let db = Db::new(path.to_str().unwrap()).await.expect("test db");
        let store = JobStore::new(db.pool().clone());
        let picker = JobPicker::new(store.clone(), WorkerId::from_string(worker));
        (dir, store, picker)
    }

    fn imminent(name: &str) -> NewJob {
        NewJob::one_time(name, "echo", Utc::now() + Duration::milliseconds(10))
    }

    #[tokio::test]
    async fn test_pick_one_claims_due_job() {
        let (_dir, store, picker) = test_picker("w1").await;
        let job = store.create(imminent("due job")).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let picked = picker.pick_one().await.unwrap().unwrap();
        assert_eq!(picked.id, job.id);
        assert_eq!(picked.status, JobStatus::Queued);
        assert_eq!(picked.locked_by.as_deref(), Some("w1"));

        // Nothing left
        assert!(picker.pick_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pick_many_stops_at_empty() {
        let (_dir, store, picker) = test_picker("w1").await;
        store.create(imminent("job one")).await.unwrap();
        store.create(imminent("job two")).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let picked = picker.pick_many(5).await.unwrap();
        assert_eq!(picked.len(), 2);
        assert_eq!(picker.count_due_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_returns_job_to_queue() {
        let (_dir, store, picker) = test_picker("w1").await;
        store.create(imminent("bounce job")).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let picked = picker.pick_one().await.unwrap().unwrap();
        assert!(picker.release(&picked).await.unwrap());

        let again = picker.pick_one().await.unwrap().unwrap();
        assert_eq!(again.id, picked.id);
        // A voluntary release does not burn a retry
        assert_eq!(again.retry_count, 0);
    }

    #[tokio::test]
    async fn test_release_all_during_drain() {
        let (_dir, store, picker) = test_picker("w1").await;
        store.create(imminent("held one")).await.unwrap();
        store.create(imminent("held two")).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        assert_eq!(picker.pick_many(2).await.unwrap().len(), 2);
        assert_eq!(picker.release_all().await.unwrap(), 2);
        assert_eq!(picker.count_due_jobs().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_recover_stale_with_threshold_override() {
        let (_dir, store, picker) = test_picker("w1").await;
        store.create(imminent("abandoned job")).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        picker.pick_one().await.unwrap().unwrap();

        // Default per-job timeout (5 min) says not stale yet
        assert_eq!(picker.recover_stale_jobs(None).await.unwrap(), 0);
        // A zero threshold reclaims immediately
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(picker.recover_stale_jobs(Some(0)).await.unwrap(), 1);
    }
}
