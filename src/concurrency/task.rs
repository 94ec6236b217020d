//! Task and result types for the parallel executor

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::utils::extract_domain;

/// Scheduling tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All tiers, highest first
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Re-runnable unit of work; called once per attempt
pub type TaskFn<T> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// A unit of work bound to a URL
pub struct Task<T> {
    pub id: String,
    pub url: String,
    pub domain: String,
    pub priority: Priority,
    pub execute: TaskFn<T>,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl<T> Task<T> {
    /// Build a task; the domain is derived from `url`
    pub fn new<F, Fut>(id: impl Into<String>, url: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let url = url.into();
        Self {
            id: id.into(),
            domain: extract_domain(&url),
            url,
            priority: Priority::Normal,
            execute: Arc::new(move || -> BoxFuture<'static, anyhow::Result<T>> { Box::pin(f()) }),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            url: self.url.clone(),
            domain: self.domain.clone(),
            priority: self.priority,
            execute: Arc::clone(&self.execute),
            created_at: self.created_at,
            metadata: self.metadata.clone(),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("domain", &self.domain)
            .field("priority", &self.priority)
            .field("created_at", &self.created_at)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Outcome of one task; exactly one of `result` / `error` is set
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult<T> {
    pub task_id: String,
    pub url: String,
    pub success: bool,
    pub result: Option<T>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub retries: u32,
}

impl<T> TaskResult<T> {
    pub fn succeeded(task: &Task<T>, value: T, duration_ms: u64, retries: u32) -> Self {
        Self {
            task_id: task.id.clone(),
            url: task.url.clone(),
            success: true,
            result: Some(value),
            error: None,
            duration_ms,
            retries,
        }
    }

    pub fn failed(task: &Task<T>, error: impl Into<String>, duration_ms: u64, retries: u32) -> Self {
        Self {
            task_id: task.id.clone(),
            url: task.url.clone(),
            success: false,
            result: None,
            error: Some(error.into()),
            duration_ms,
            retries,
        }
    }

    /// Convert into a std `Result`, consuming the record
    pub fn into_result(self) -> Result<T, String> {
        match (self.result, self.error) {
            (Some(value), _) => Ok(value),
            (None, Some(error)) => Err(error),
            (None, None) => Err("task produced no result".to_string()),
        }
    }
}

/// Aggregate of a batch, results in input order
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult<T> {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<TaskResult<T>>,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
}

impl<T> BatchResult<T> {
    pub fn from_results(results: Vec<TaskResult<T>>, total_duration_ms: u64) -> Self {
        let total = results.len();
        let succeeded = results.iter().filter(|r| r.success).count();
        let average_duration_ms = if total == 0 {
            0.0
        } else {
            results.iter().map(|r| r.duration_ms as f64).sum::<f64>() / total as f64
        };

        Self {
            total,
            succeeded,
            failed: total - succeeded,
            results,
            total_duration_ms,
            average_duration_ms,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }
}
