//! Run summary and trace

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use url::Url;
use uuid::Uuid;

use crate::load::LoadResult;
use crate::resource::MergeStrategy;
use crate::state::RunError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every resource extracted and loaded without error
    Completed,
    /// At least one extraction or batch failed
    Failed,
    /// The run was cancelled before finishing
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceSummary {
    pub name: String,
    pub table: String,
    pub merge_strategy: MergeStrategy,
    pub rows_loaded: u64,
    pub pages: usize,
    pub batches_loaded: usize,
    pub batches_failed: usize,
    pub last_cursor: Option<Url>,
    pub extract_error: Option<String>,
    pub load_errors: Vec<String>,
    pub aborted: bool,
}

impl ResourceSummary {
    pub fn is_success(&self) -> bool {
        self.extract_error.is_none() && self.load_errors.is_empty() && !self.aborted
    }
}

/// Normalize stage figures for one table
#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizeTrace {
    pub rows: usize,
    pub chunks: usize,
    pub columns_added: Vec<String>,
    pub columns_widened: Vec<String>,
}

/// Load stage figures for one table
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadTrace {
    pub rows_affected: u64,
    pub batches_loaded: usize,
    pub batches_failed: usize,
    pub elapsed_ms: u64,
}

/// Per-table figures of the normalize and load stages
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunTrace {
    pub normalize: BTreeMap<String, NormalizeTrace>,
    pub load: BTreeMap<String, LoadTrace>,
}

impl RunTrace {
    pub fn record(&mut self, result: &LoadResult) {
        let normalize = self.normalize.entry(result.table.clone()).or_default();
        normalize.rows += result.rows_normalized;
        normalize.chunks += result.chunks;
        normalize.columns_added.extend(result.columns_added.iter().cloned());
        normalize
            .columns_widened
            .extend(result.columns_widened.iter().cloned());

        let load = self.load.entry(result.table.clone()).or_default();
        load.rows_affected += result.rows_affected;
        load.batches_loaded += result.batches_loaded;
        load.batches_failed += result.batches_failed;
        load.elapsed_ms += result.elapsed.as_millis() as u64;
    }
}

/// Everything one run did
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub load_id: Uuid,
    pub pipeline_name: String,
    pub dataset_name: String,
    pub destination: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resources: Vec<ResourceSummary>,
    /// The run's error log in the order errors were recorded
    pub errors: Vec<RunError>,
    pub trace: RunTrace,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceSummary> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn rows_loaded(&self) -> u64 {
        self.resources.iter().map(|r| r.rows_loaded).sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Pipeline {} load {} {} ({} rows into {}.{} on {})",
            self.pipeline_name,
            self.load_id,
            self.status,
            self.rows_loaded(),
            self.destination,
            self.dataset_name,
            self.finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
        )?;

        for r in &self.resources {
            let status = if r.is_success() { "ok" } else { "FAILED" };
            writeln!(
                f,
                "  {:<20} {:<6} {:>8} rows {:>5} pages  {} -> {}",
                r.name, status, r.rows_loaded, r.pages, r.merge_strategy, r.table
            )?;
            if let Some(err) = &r.extract_error {
                writeln!(f, "    extract: {err}")?;
            }
            for err in &r.load_errors {
                writeln!(f, "    load: {err}")?;
            }
        }

        if !self.trace.normalize.is_empty() {
            writeln!(f, "Normalize:")?;
            for (table, n) in &self.trace.normalize {
                write!(f, "  {table}: {} rows in {} chunk(s)", n.rows, n.chunks)?;
                if !n.columns_added.is_empty() {
                    write!(f, ", new columns: {}", n.columns_added.join(", "))?;
                }
                writeln!(f)?;
            }
        }

        if !self.trace.load.is_empty() {
            writeln!(f, "Load:")?;
            for (table, l) in &self.trace.load {
                writeln!(
                    f,
                    "  {table}: {} rows, {} batch(es) loaded, {} failed, {} ms",
                    l.rows_affected, l.batches_loaded, l.batches_failed, l.elapsed_ms
                )?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn resource(name: &str, extract_error: Option<&str>) -> ResourceSummary {
        ResourceSummary {
            name: name.into(),
            table: name.into(),
            merge_strategy: MergeStrategy::Merge,
            rows_loaded: 3,
            pages: 2,
            batches_loaded: 2,
            batches_failed: 0,
            last_cursor: None,
            extract_error: extract_error.map(String::from),
            load_errors: Vec::new(),
            aborted: false,
        }
    }

    #[test]
    fn test_display_lists_every_resource() {
        let summary = RunSummary {
            load_id: Uuid::new_v4(),
            pipeline_name: "shop".into(),
            dataset_name: "shop_data".into(),
            destination: "memory".into(),
            status: RunStatus::Failed,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            resources: vec![resource("customers", None), resource("orders", Some("HTTP 503"))],
            errors: Vec::new(),
            trace: RunTrace::default(),
        };

        let text = summary.to_string();
        assert!(text.contains("failed"));
        assert!(text.contains("customers"));
        assert!(text.contains("extract: HTTP 503"));
        assert_eq!(summary.rows_loaded(), 6);
        assert!(!summary.resource("orders").unwrap().is_success());

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["resources"][1]["extract_error"], "HTTP 503");
    }

    #[test]
    fn test_trace_accumulates_per_table() {
        let mut trace = RunTrace::default();
        let result = LoadResult {
            resource: "a".into(),
            table: "shared".into(),
            rows_affected: 2,
            batches_loaded: 1,
            rows_normalized: 2,
            chunks: 1,
            elapsed: Duration::from_millis(5),
            ..LoadResult::default()
        };
        trace.record(&result);
        trace.record(&result);

        assert_eq!(trace.load["shared"].rows_affected, 4);
        assert_eq!(trace.normalize["shared"].chunks, 2);
    }
}
