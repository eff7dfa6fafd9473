//! ABOUTME: Named advisory locks for cross-worker coordination beyond per-job locks
//! ABOUTME: Acquire/renew/release are single conditional upserts; TTL cures crashed holders

use ch_core::time::{from_millis, to_millis};
use ch_core::{Error, Result, WorkerId};
use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A named lock record as stored
#[derive(Debug, Clone)]
pub struct Lock {
    pub lock_id: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renew_count: i64,
}

/// Result of a scoped lock acquisition
#[derive(Debug)]
pub enum LockOutcome<T> {
    /// Another holder owns the lock; the closure never ran
    NotAcquired,
    Completed(T),
}

/// Manager for named advisory locks backed by the shared store.
///
/// Acquisition atomicity comes from a single conditional upsert: two workers
/// cannot both observe an unheld or expired lock and write their own holder,
/// because exactly one statement wins.
pub struct LockManager {
    pool: SqlitePool,
    worker_id: WorkerId,
    held: Arc<Mutex<HashSet<String>>>,
}

impl LockManager {
    pub fn new(pool: SqlitePool, worker_id: WorkerId) -> Self {
        Self {
            pool,
            worker_id,
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Try to acquire (or renew) a named lock for `ttl_ms`.
    ///
    /// Succeeds when the lock does not exist, has expired, or is already held
    /// by this worker. Returns false when another live holder owns it.
    pub async fn acquire(&self, lock_id: &str, ttl_ms: i64) -> Result<bool> {
        let now = Utc::now();
        let expires_at = now + Duration::milliseconds(ttl_ms);

        let row = sqlx::query(
            r#"
            INSERT INTO locks (lock_id, holder, acquired_at, expires_at, renew_count)
            VALUES (?1, ?2, ?3, ?4, 0)
            ON CONFLICT(lock_id) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at,
                renew_count = 0
            WHERE locks.holder = excluded.holder OR locks.expires_at < ?3
            RETURNING holder
            "#,
        )
        .bind(lock_id)
        .bind(self.worker_id.as_str())
        .bind(to_millis(now))
        .bind(to_millis(expires_at))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to acquire lock {}: {}", lock_id, e)))?;

        let acquired = matches!(row, Some(r) if r.get::<String, _>("holder") == self.worker_id.as_str());
        if acquired {
            debug!(lock_id = %lock_id, holder = %self.worker_id, "Acquired lock");
            self.held.lock().expect("lock set poisoned").insert(lock_id.to_string());
        } else {
            debug!(lock_id = %lock_id, "Lock held by another worker");
        }
        Ok(acquired)
    }

    /// Release a lock this worker holds; true when a record was removed
    pub async fn release(&self, lock_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM locks WHERE lock_id = ?1 AND holder = ?2")
            .bind(lock_id)
            .bind(self.worker_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to release lock {}: {}", lock_id, e)))?;

        self.held.lock().expect("lock set poisoned").remove(lock_id);

        let released = result.rows_affected() > 0;
        if released {
            debug!(lock_id = %lock_id, "Released lock");
        }
        Ok(released)
    }

    /// Extend a held lock's lease; false means the lock was lost
    pub async fn renew(&self, lock_id: &str, ttl_ms: i64) -> Result<bool> {
        let now = Utc::now();
        let expires_at = now + Duration::milliseconds(ttl_ms);

        let result = sqlx::query(
            r#"
            UPDATE locks
            SET expires_at = ?3, renew_count = renew_count + 1
            WHERE lock_id = ?1 AND holder = ?2
            "#,
        )
        .bind(lock_id)
        .bind(self.worker_id.as_str())
        .bind(to_millis(expires_at))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to renew lock {}: {}", lock_id, e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Whether this worker currently holds a live lease on the lock
    pub async fn is_held_by_me(&self, lock_id: &str) -> Result<bool> {
        let now = Utc::now();
        let lock = self.get(lock_id).await?;
        Ok(matches!(
            lock,
            Some(l) if l.holder == self.worker_id.as_str() && l.expires_at >= now
        ))
    }

    pub async fn get(&self, lock_id: &str) -> Result<Option<Lock>> {
        let row = sqlx::query("SELECT * FROM locks WHERE lock_id = ?1")
            .bind(lock_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to read lock {}: {}", lock_id, e)))?;
        Ok(row.map(row_to_lock))
    }

    /// Release every lock this worker holds; used on shutdown
    pub async fn release_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM locks WHERE holder = ?1")
            .bind(self.worker_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to release locks: {}", e)))?;

        self.held.lock().expect("lock set poisoned").clear();

        let released = result.rows_affected();
        if released > 0 {
            info!(count = released, "Released all locks on shutdown");
        }
        Ok(released)
    }

    /// TTL sweep: drop lock records whose lease has lapsed
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM locks WHERE expires_at < ?1")
            .bind(to_millis(now))
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to purge expired locks: {}", e)))?;
        Ok(result.rows_affected())
    }

    /// Acquire with a background renewal loop at `renew_every_ms` (default
    /// ttl/2). Returns None when the lock is held elsewhere. The returned
    /// guard stops renewal and releases on `release()`; if a renewal fails
    /// the loop stops and the lock is forgotten.
    pub async fn acquire_with_renewal(
        self: &Arc<Self>,
        lock_id: &str,
        ttl_ms: i64,
        renew_every_ms: Option<i64>,
    ) -> Result<Option<RenewedLock>> {
        if !self.acquire(lock_id, ttl_ms).await? {
            return Ok(None);
        }

        let cadence = renew_every_ms.unwrap_or(ttl_ms / 2).max(1) as u64;
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let manager = Arc::clone(self);
        let renewed_id = lock_id.to_string();

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(cadence));
            interval.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = interval.tick() => {
                        match manager.renew(&renewed_id, ttl_ms).await {
                            Ok(true) => debug!(lock_id = %renewed_id, "Renewed lock"),
                            Ok(false) => {
                                warn!(lock_id = %renewed_id, "Lock lost during renewal");
                                manager.held.lock().expect("lock set poisoned").remove(&renewed_id);
                                break;
                            }
                            Err(e) => {
                                warn!(lock_id = %renewed_id, error = %e, "Lock renewal failed");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Some(RenewedLock {
            lock_id: lock_id.to_string(),
            manager: Arc::clone(self),
            token,
        }))
    }

    /// Run a closure under a named lock, guaranteeing release on every exit
    /// path. The closure's error is propagated after the lock is released.
    pub async fn with_lock<T, F, Fut>(
        &self,
        lock_id: &str,
        ttl_ms: i64,
        f: F,
    ) -> Result<LockOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.acquire(lock_id, ttl_ms).await? {
            return Ok(LockOutcome::NotAcquired);
        }

        let outcome = f().await;

        if let Err(e) = self.release(lock_id).await {
            warn!(lock_id = %lock_id, error = %e, "Failed to release scoped lock");
        }

        outcome.map(LockOutcome::Completed)
    }
}

/// A lock kept alive by a background renewal loop
pub struct RenewedLock {
    lock_id: String,
    manager: Arc<LockManager>,
    token: CancellationToken,
}

impl RenewedLock {
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Stop the renewal loop and delete the lock record
    pub async fn release(self) -> Result<bool> {
        self.token.cancel();
        self.manager.release(&self.lock_id).await
    }
}

impl Drop for RenewedLock {
    fn drop(&mut self) {
        // Stops renewal; the record itself lapses via its TTL
        self.token.cancel();
    }
}

fn row_to_lock(row: SqliteRow) -> Lock {
    Lock {
        lock_id: row.get("lock_id"),
        holder: row.get("holder"),
        acquired_at: from_millis(row.get("acquired_at")),
        expires_at: from_millis(row.get("expires_at")),
        renew_count: row.get("renew_count"),
    }
}
