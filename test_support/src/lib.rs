//! ABOUTME: Shared testing utilities and deterministic task handlers
//! ABOUTME: Common fixtures for store and engine test suites

use async_trait::async_trait;
use ch_core::{Error, Result};
use ch_db::Db;
use ch_sched::{HandlerRegistry, JobView, TaskHandler};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Create a throwaway database in its own temp directory.
///
/// The directory must outlive the Db or SQLite loses its file under us.
pub async fn temp_db() -> (tempfile::TempDir, Db) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("chronos_test.db");
    let db = Db::new(path.to_str().expect("utf8 path"))
        .await
        .expect("test database");
    (dir, db)
}

/// Poll `predicate` until it returns true or `timeout` elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Returns its payload unchanged
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn run(&self, payload: &serde_json::Value, _job: &JobView) -> Result<serde_json::Value> {
        Ok(payload.clone())
    }
}

/// Sleeps for `delay_ms` from its payload (default 100), then echoes
pub struct DelayHandler;

#[async_trait]
impl TaskHandler for DelayHandler {
    async fn run(&self, payload: &serde_json::Value, _job: &JobView) -> Result<serde_json::Value> {
        let delay_ms = payload
            .get("delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(100);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(payload.clone())
    }
}

/// Fails every invocation with a retryable error
pub struct AlwaysFailHandler;

#[async_trait]
impl TaskHandler for AlwaysFailHandler {
    async fn run(&self, _: &serde_json::Value, _: &JobView) -> Result<serde_json::Value> {
        Err(Error::Handler("simulated task failure".to_string()))
    }
}

/// Fails the first `n` invocations, then succeeds
pub struct FailNTimesHandler {
    n: u32,
    calls: AtomicU32,
}

impl FailNTimesHandler {
    pub fn new(n: u32) -> Self {
        Self {
            n,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for FailNTimesHandler {
    async fn run(&self, payload: &serde_json::Value, _: &JobView) -> Result<serde_json::Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.n {
            Err(Error::Handler(format!(
                "simulated failure on invocation {}",
                call + 1
            )))
        } else {
            Ok(payload.clone())
        }
    }
}

/// Never returns; exists to exercise the execution deadline
pub struct NeverReturnHandler;

#[async_trait]
impl TaskHandler for NeverReturnHandler {
    async fn run(&self, _: &serde_json::Value, _: &JobView) -> Result<serde_json::Value> {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

/// Registry preloaded with every deterministic handler
pub fn standard_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("echo", Arc::new(EchoHandler));
    registry.register("delay", Arc::new(DelayHandler));
    registry.register("always_fail", Arc::new(AlwaysFailHandler));
    registry.register("never_return", Arc::new(NeverReturnHandler));
    registry
}
