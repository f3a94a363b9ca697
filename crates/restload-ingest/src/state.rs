//! Shared state of one pipeline run
//!
//! Extraction and loader tasks all append here; each update is one short
//! critical section under a single async mutex.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::Mutex;
use url::Url;

/// Pipeline stage an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Normalize,
    Load,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Extract => write!(f, "extract"),
            Stage::Normalize => write!(f, "normalize"),
            Stage::Load => write!(f, "load"),
        }
    }
}

/// One entry of the run's error log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunError {
    pub resource: String,
    pub stage: Stage,
    pub cause: String,
    pub at: DateTime<Utc>,
}

/// Per-resource progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceProgress {
    /// URL of the last page fetched successfully
    pub last_cursor: Option<Url>,
    pub pages: usize,
    pub rows_loaded: u64,
}

/// Copy of the run state at one point in time
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStateSnapshot {
    pub resources: BTreeMap<String, ResourceProgress>,
    /// In the order they were recorded
    pub errors: Vec<RunError>,
}

impl RunStateSnapshot {
    pub fn progress(&self, resource: &str) -> Option<&ResourceProgress> {
        self.resources.get(resource)
    }

    pub fn errors_for<'a>(&'a self, resource: &'a str) -> impl Iterator<Item = &'a RunError> + 'a {
        self.errors.iter().filter(move |e| e.resource == resource)
    }
}

#[derive(Debug, Default)]
pub struct RunState {
    inner: Mutex<RunStateSnapshot>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_cursor(&self, resource: &str, cursor: &Url) {
        let mut inner = self.inner.lock().await;
        let progress = inner.resources.entry(resource.to_string()).or_default();
        progress.last_cursor = Some(cursor.clone());
        progress.pages += 1;
    }

    pub async fn add_loaded(&self, resource: &str, rows: u64) {
        let mut inner = self.inner.lock().await;
        inner
            .resources
            .entry(resource.to_string())
            .or_default()
            .rows_loaded += rows;
    }

    pub async fn record_error(&self, resource: &str, stage: Stage, cause: impl ToString) {
        let mut inner = self.inner.lock().await;
        inner.errors.push(RunError {
            resource: resource.to_string(),
            stage,
            cause: cause.to_string(),
            at: Utc::now(),
        });
    }

    pub async fn snapshot(&self) -> RunStateSnapshot {
        self.inner.lock().await.clone()
    }
}
