//! ABOUTME: Handler registry mapping task types to user-supplied task handlers
//! ABOUTME: Built once at startup and read-only afterwards

use async_trait::async_trait;
use ch_core::Result;
use ch_store::{Job, JobKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Frozen view of a job handed to handlers.
///
/// Handlers never touch the store; everything they may want to know about the
/// job travels in this snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: String,
    /// Human-readable sequential id
    pub job_id: String,
    pub name: String,
    pub kind: JobKind,
    pub task_type: String,
    pub priority: i32,
    pub tags: Vec<String>,
    pub timezone: String,
    /// 0 for the first attempt
    pub attempt: u32,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            job_id: job.public_id(),
            name: job.name.clone(),
            kind: job.kind,
            task_type: job.task_type.clone(),
            priority: job.priority,
            tags: job.tags.clone(),
            timezone: job.timezone.clone(),
            attempt: job.retry_count,
            scheduled_for: job.next_run_at,
        }
    }
}

/// A user-supplied task implementation
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run one attempt with the job's payload; the returned value is recorded
    /// as the execution result
    async fn run(&self, payload: &serde_json::Value, job: &JobView) -> Result<serde_json::Value>;
}

/// Map from task type to handler, populated during startup
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        info!(task_type = %task_type, "Registered task handler");
        self.handlers.insert(task_type, handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn task_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UppercaseHandler;

    #[async_trait]
    impl TaskHandler for UppercaseHandler {
        async fn run(
            &self,
            payload: &serde_json::Value,
            _job: &JobView,
        ) -> Result<serde_json::Value> {
            let text = payload.get("text").and_then(|v| v.as_str()).unwrap_or("");
            Ok(serde_json::json!({ "text": text.to_uppercase() }))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register("uppercase", Arc::new(UppercaseHandler));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("uppercase"));
        assert!(registry.get("uppercase").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_handler_invocation() {
        let mut registry = HandlerRegistry::new();
        registry.register("uppercase", Arc::new(UppercaseHandler));

        let view = JobView {
            id: "j1".to_string(),
            job_id: "1".to_string(),
            name: "shout".to_string(),
            kind: JobKind::OneTime,
            task_type: "uppercase".to_string(),
            priority: 5,
            tags: vec![],
            timezone: "UTC".to_string(),
            attempt: 0,
            scheduled_for: None,
        };

        let handler = registry.get("uppercase").unwrap();
        let out = handler
            .run(&serde_json::json!({"text": "hello"}), &view)
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!({"text": "HELLO"}));
    }
}
