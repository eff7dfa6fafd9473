//! ABOUTME: Named atomic counters used to mint sequential job numbers

use ch_core::{Error, Result};
use sqlx::{Row, SqlitePool};

/// Store for named monotonically increasing counters
pub struct CounterStore {
    pool: SqlitePool,
}

impl CounterStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Atomic get-and-increment; the first call for a name returns `seed`.
    ///
    /// The upsert is a single statement, so two concurrent callers can never
    /// observe the same value.
    pub async fn next(&self, name: &str, seed: i64) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO counters (name, value) VALUES (?1, ?2)
            ON CONFLICT(name) DO UPDATE SET value = value + 1
            RETURNING value
            "#,
        )
        .bind(name)
        .bind(seed)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to increment counter {}: {}", name, e)))?;

        Ok(row.get::<i64, _>("value"))
    }

    /// Current value without incrementing; None when the counter was never used
    pub async fn current(&self, name: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT value FROM counters WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to read counter {}: {}", name, e)))?;

        Ok(row.map(|r| r.get::<i64, _>("value")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ch_db::Db;

    async fn test_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("counter_test.db");
        let db = Db::new(path.to_str().unwrap()).await.expect("test db");
        (dir, db)
    }

    #[tokio::test]
    async fn test_counter_sequences_from_seed() {
        let (_dir, db) = test_db().await;
        let counters = CounterStore::new(db.pool().clone());

        assert_eq!(counters.current("jobs").await.unwrap(), None);
        assert_eq!(counters.next("jobs", 1).await.unwrap(), 1);
        assert_eq!(counters.next("jobs", 1).await.unwrap(), 2);
        assert_eq!(counters.next("jobs", 1).await.unwrap(), 3);
        assert_eq!(counters.current("jobs").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_counters_are_independent_per_name() {
        let (_dir, db) = test_db().await;
        let counters = CounterStore::new(db.pool().clone());

        assert_eq!(counters.next("jobs", 1).await.unwrap(), 1);
        assert_eq!(counters.next("reports", 100).await.unwrap(), 100);
        assert_eq!(counters.next("jobs", 1).await.unwrap(), 2);
        assert_eq!(counters.next("reports", 100).await.unwrap(), 101);
    }

    #[tokio::test]
    async fn test_concurrent_increments_never_collide() {
        let (_dir, db) = test_db().await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let counters = CounterStore::new(db.pool().clone());
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..10 {
                    seen.push(counters.next("jobs", 1).await.unwrap());
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 80, "duplicate counter values were handed out");
    }
}
