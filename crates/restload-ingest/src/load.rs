//! Loading record batches into the destination
//!
//! Each resource load is a [`LoadSession`]: batches are normalized, checked
//! against the table schema and written chunk by chunk. A failed batch is
//! recorded and the session moves on to the next one; a fatal destination
//! error ends the session.
//!
//! Writes to one table are serialized by a per-table lock held for one batch
//! at a time, so two resources sharing a table interleave by batch.

use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::destination::{Destination, WriteMode};
use crate::error::{DestinationError, LoadError};
use crate::normalize::{NormalizedBatch, Normalizer};
use crate::record::{Record, RecordBatch};
use crate::resource::{MergeStrategy, Resource};
use crate::state::{RunState, Stage};

/// Outcome of loading one resource
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadResult {
    pub resource: String,
    pub table: String,
    /// Rows inserted or updated
    pub rows_affected: u64,
    pub batches_loaded: usize,
    pub batches_failed: usize,
    #[serde(serialize_with = "serialize_errors")]
    pub errors: Vec<LoadError>,
    /// A fatal destination error stopped the load early
    pub aborted: bool,
    pub rows_normalized: usize,
    pub chunks: usize,
    pub columns_added: Vec<String>,
    pub columns_widened: Vec<String>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_errors<S: serde::Serializer>(errors: &[LoadError], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(errors.iter().map(ToString::to_string))
}

fn serialize_millis<S: serde::Serializer>(elapsed: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(elapsed.as_millis() as u64)
}

impl LoadResult {
    /// Empty result for `resource`
    pub(crate) fn for_resource(resource: &Resource) -> Self {
        Self {
            resource: resource.name().to_string(),
            table: resource.table_name().to_string(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.aborted
    }
}

/// Shared entry point for every resource load of one run
#[derive(Clone)]
pub struct LoadCoordinator {
    destination: Arc<dyn Destination>,
    normalizer: Normalizer,
    state: Arc<RunState>,
    table_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    /// Replace resources already started in this run
    replaced: Arc<Mutex<HashSet<String>>>,
    normalize_pool: Arc<Semaphore>,
    load_pool: Arc<Semaphore>,
}

impl LoadCoordinator {
    pub fn new(
        destination: Arc<dyn Destination>,
        normalizer: Normalizer,
        state: Arc<RunState>,
        normalize_workers: usize,
        load_workers: usize,
    ) -> Self {
        Self {
            destination,
            normalizer,
            state,
            table_locks: Arc::new(Mutex::new(HashMap::new())),
            replaced: Arc::new(Mutex::new(HashSet::new())),
            normalize_pool: Arc::new(Semaphore::new(normalize_workers.max(1))),
            load_pool: Arc::new(Semaphore::new(load_workers.max(1))),
        }
    }

    pub fn destination(&self) -> &Arc<dyn Destination> {
        &self.destination
    }

    /// Start loading `resource`.
    ///
    /// A replace resource can only be started once per run; the second
    /// attempt is rejected and recorded in the run state.
    pub async fn begin(&self, resource: &Resource) -> Result<LoadSession, LoadError> {
        if resource.merge_strategy() == MergeStrategy::Replace {
            let first = self.replaced.lock().await.insert(resource.name().to_string());
            if !first {
                let err = LoadError::ReplaceAlreadyLoaded {
                    resource: resource.name().to_string(),
                };
                warn!(resource = %resource.name(), error = %err, "Load rejected");
                self.state.record_error(resource.name(), Stage::Load, &err).await;
                return Err(err);
            }
        }

        debug!(
            resource = %resource.name(),
            table = %resource.table_name(),
            strategy = %resource.merge_strategy(),
            "Load session started"
        );

        Ok(LoadSession {
            coordinator: self.clone(),
            resource: resource.clone(),
            truncated: false,
            started: Instant::now(),
            result: LoadResult::for_resource(resource),
        })
    }

    /// Load every batch of `batches`
    pub async fn load<S>(&self, resource: &Resource, batches: S) -> LoadResult
    where
        S: Stream<Item = RecordBatch> + Send,
    {
        let mut session = match self.begin(resource).await {
            Ok(session) => session,
            Err(e) => return LoadResult::rejected(resource, e),
        };

        let mut batches = std::pin::pin!(batches);
        while let Some(batch) = batches.next().await {
            if session.load_batch(batch).await.is_break() {
                break;
            }
        }
        session.finish()
    }

    /// Load records that did not come from the paginator, as one batch
    pub async fn load_records(&self, resource: &Resource, records: Vec<Record>) -> LoadResult {
        let batch = RecordBatch::from_records(resource, 1, records);
        self.load(resource, futures::stream::iter([batch])).await
    }

    async fn table_lock(&self, table: &str) -> Arc<Mutex<()>> {
        self.table_locks
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .clone()
    }
}

impl LoadResult {
    pub(crate) fn rejected(resource: &Resource, err: LoadError) -> Self {
        Self {
            errors: vec![err],
            ..Self::for_resource(resource)
        }
    }
}

/// Loading state of one resource
pub struct LoadSession {
    coordinator: LoadCoordinator,
    resource: Resource,
    truncated: bool,
    started: Instant,
    result: LoadResult,
}

impl LoadSession {
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Normalize and write one page. Breaks once the session is aborted.
    pub async fn load_batch(&mut self, batch: RecordBatch) -> ControlFlow<()> {
        if self.result.aborted {
            return ControlFlow::Break(());
        }

        let normalized = {
            let _permit = self.coordinator.normalize_pool.acquire().await.ok();
            self.coordinator.normalizer.normalize(batch)
        };

        let outcome = match normalized {
            Ok(batch) => {
                self.result.rows_normalized += batch.rows;
                self.result.chunks += batch.chunks.len();
                self.write(batch).await
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.result.batches_loaded += 1;
                ControlFlow::Continue(())
            },
            Err(e) => {
                let fatal = e.is_fatal();
                self.fail(e).await;
                if fatal {
                    self.result.aborted = true;
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        }
    }

    async fn write(&mut self, batch: NormalizedBatch) -> Result<(), LoadError> {
        let coordinator = self.coordinator.clone();
        let destination = coordinator.destination.as_ref();
        let resource = self.resource.name().to_string();
        let page = batch.page;
        let table = batch.table.as_str();

        let to_load_error = |source: DestinationError| {
            if source.fatal {
                LoadError::Fatal {
                    resource: resource.clone(),
                    source,
                }
            } else {
                LoadError::Destination {
                    resource: resource.clone(),
                    page,
                    source,
                }
            }
        };

        let _permit = coordinator.load_pool.acquire().await.ok();
        let lock = coordinator.table_lock(table).await;
        let _guard = lock.lock().await;

        // The first replace batch starts the table over, schema included
        let reset = batch.merge_strategy == MergeStrategy::Replace && !self.truncated;

        let current = if reset {
            None
        } else {
            destination.table_schema(table).await.map_err(to_load_error)?
        };
        let exists = current.is_some();
        let change = current
            .unwrap_or_default()
            .evolve(table, &batch.schema)
            .map_err(|source| LoadError::Schema {
                resource: resource.clone(),
                page,
                source,
            })?;

        if reset {
            destination.truncate(table).await.map_err(to_load_error)?;
            self.truncated = true;
            info!(resource = %resource, table, "Truncated table before replace");
        }

        if !change.is_empty() || !exists {
            destination
                .evolve_schema(table, &change.schema)
                .await
                .map_err(to_load_error)?;
            if exists && !change.is_empty() {
                info!(
                    resource = %resource,
                    table,
                    added = ?change.added,
                    widened = ?change.widened,
                    "Evolved table schema"
                );
            }
            self.result.columns_added.extend(change.added);
            self.result.columns_widened.extend(change.widened);
        }

        let mode = match batch.merge_strategy {
            MergeStrategy::Merge => WriteMode::Merge {
                primary_key: batch.primary_key.clone(),
            },
            MergeStrategy::Append | MergeStrategy::Replace => WriteMode::Append,
        };

        for chunk in batch.chunks {
            let rows = destination
                .write(table, &mode, chunk)
                .await
                .map_err(to_load_error)?;
            self.result.rows_affected += rows;
            coordinator.state.add_loaded(&resource, rows).await;
        }

        debug!(resource = %resource, table, page, rows = batch.rows, "Batch loaded");
        Ok(())
    }

    async fn fail(&mut self, err: LoadError) {
        let stage = match err {
            LoadError::Data { .. } => Stage::Normalize,
            _ => Stage::Load,
        };
        error!(resource = %self.resource.name(), %stage, error = %err, "Batch failed");
        self.coordinator
            .state
            .record_error(self.resource.name(), stage, &err)
            .await;
        self.result.batches_failed += 1;
        self.result.errors.push(err);
    }

    pub fn finish(mut self) -> LoadResult {
        self.result.elapsed = self.started.elapsed();
        info!(
            resource = %self.result.resource,
            table = %self.result.table,
            rows = self.result.rows_affected,
            batches = self.result.batches_loaded,
            failed = self.result.batches_failed,
            aborted = self.result.aborted,
            elapsed_ms = self.result.elapsed.as_millis() as u64,
            "Load finished"
        );
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::MemoryDestination;
    use crate::error::DataError;
    use serde_json::{json, Value};

    fn records(values: Value) -> Vec<Record> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn ids(rows: &[Record]) -> Vec<i64> {
        rows.iter().filter_map(|r| r["id"].as_i64()).collect()
    }

    fn coordinator(dest: Arc<MemoryDestination>) -> LoadCoordinator {
        LoadCoordinator::new(dest, Normalizer::new(10_000, 50_000_000), Arc::new(RunState::new()), 2, 2)
    }

    #[tokio::test]
    async fn test_merge_twice_converges() {
        let dest = Arc::new(MemoryDestination::new());
        let resource = Resource::new("widgets", "id");
        let rows = records(json!([{"id": 1, "n": "a"}, {"id": 2, "n": "b"}, {"id": 3, "n": "c"}]));

        let first = coordinator(dest.clone()).load_records(&resource, rows.clone()).await;
        let second = coordinator(dest.clone()).load_records(&resource, rows).await;

        assert_eq!(first.rows_affected, 3);
        assert_eq!(second.rows_affected, 3);
        assert_eq!(dest.row_count("widgets").await.unwrap(), 3);
        assert_eq!(first.columns_added.len(), 2);
        assert!(second.columns_added.is_empty());
    }

    #[tokio::test]
    async fn test_append_grows() {
        let dest = Arc::new(MemoryDestination::new());
        let resource = Resource::new("events", "id").with_merge_strategy(MergeStrategy::Append);
        let rows = records(json!([{"id": 1}, {"id": 2}]));

        let coordinator = coordinator(dest.clone());
        coordinator.load_records(&resource, rows.clone()).await;
        coordinator.load_records(&resource, rows).await;
        assert_eq!(dest.row_count("events").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_replace_once_per_run() {
        let dest = Arc::new(MemoryDestination::new());
        let resource = Resource::new("snapshot", "id").with_merge_strategy(MergeStrategy::Replace);

        coordinator(dest.clone())
            .load_records(&resource, records(json!([{"id": 1}, {"id": 2}])))
            .await;

        let coordinator = coordinator(dest.clone());
        let result = coordinator
            .load_records(&resource, records(json!([{"id": 9}])))
            .await;
        assert!(result.is_success());
        assert_eq!(dest.row_count("snapshot").await.unwrap(), 1);

        let again = coordinator
            .load_records(&resource, records(json!([{"id": 10}])))
            .await;
        assert!(matches!(again.errors[..], [LoadError::ReplaceAlreadyLoaded { .. }]));
        assert_eq!(dest.row_count("snapshot").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replace_starts_schema_over() {
        let dest = Arc::new(MemoryDestination::new());
        let resource = Resource::new("snap", "id").with_merge_strategy(MergeStrategy::Replace);

        let first = coordinator(dest.clone())
            .load_records(&resource, records(json!([{"id": 1, "v": "x"}, {"id": 2, "v": "y"}])))
            .await;
        assert!(first.is_success());

        let second = coordinator(dest.clone())
            .load_records(&resource, records(json!([{"id": 3, "v": 5}])))
            .await;
        assert!(second.is_success(), "{:?}", second.errors);
        assert_eq!(ids(&dest.rows("snap").await.unwrap()), vec![3]);

        let schema = dest.table_schema("snap").await.unwrap().unwrap();
        assert_eq!(schema.column("v"), Some(crate::schema::FieldType::Integer));
    }

    #[tokio::test]
    async fn test_rejected_replace_batch_keeps_previous_rows() {
        let dest = Arc::new(MemoryDestination::new());
        let resource = Resource::new("snap", "id").with_merge_strategy(MergeStrategy::Replace);

        coordinator(dest.clone())
            .load_records(&resource, records(json!([{"id": 1}, {"id": 2}])))
            .await;

        // mixed types inside one page cannot be typed at all
        let rejected = coordinator(dest.clone())
            .load_records(&resource, records(json!([{"id": 3, "v": "x"}, {"id": 4, "v": 1}])))
            .await;
        assert!(matches!(rejected.errors[..], [LoadError::Schema { .. }]));
        assert_eq!(ids(&dest.rows("snap").await.unwrap()), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_the_next() {
        let dest = Arc::new(MemoryDestination::new());
        let resource = Resource::new("widgets", "id");
        let batches = vec![
            RecordBatch::from_records(&resource, 1, records(json!([{"id": 1}, {"id": 1}]))),
            RecordBatch::from_records(&resource, 2, records(json!([{"id": 2}]))),
        ];

        let result = coordinator(dest.clone())
            .load(&resource, futures::stream::iter(batches))
            .await;

        assert_eq!(result.batches_failed, 1);
        assert_eq!(result.batches_loaded, 1);
        assert!(matches!(
            &result.errors[0],
            LoadError::Data {
                source: DataError::DuplicateKeys { .. },
                page: 1,
                ..
            }
        ));
        assert_eq!(dest.row_count("widgets").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_schema_conflict_rejects_only_that_batch() {
        let dest = Arc::new(MemoryDestination::new());
        let resource = Resource::new("widgets", "id");
        let batches = vec![
            RecordBatch::from_records(&resource, 1, records(json!([{"id": 1, "qty": 1}]))),
            RecordBatch::from_records(&resource, 2, records(json!([{"id": 2, "qty": "many"}]))),
            RecordBatch::from_records(&resource, 3, records(json!([{"id": 3, "qty": 2.5}]))),
        ];

        let result = coordinator(dest.clone())
            .load(&resource, futures::stream::iter(batches))
            .await;

        assert_eq!(result.batches_loaded, 2);
        assert!(matches!(result.errors[..], [LoadError::Schema { page: 2, .. }]));
        assert_eq!(result.columns_widened, vec!["qty".to_string()]);
        assert_eq!(dest.row_count("widgets").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fatal_destination_error_aborts() {
        let dest = Arc::new(MemoryDestination::new());
        dest.inject_failure("widgets", DestinationError::fatal("connection lost"))
            .await;
        let resource = Resource::new("widgets", "id");
        let batches = vec![
            RecordBatch::from_records(&resource, 1, records(json!([{"id": 1}]))),
            RecordBatch::from_records(&resource, 2, records(json!([{"id": 2}]))),
        ];

        let result = coordinator(dest.clone())
            .load(&resource, futures::stream::iter(batches))
            .await;

        assert!(result.aborted);
        assert_eq!(result.batches_loaded, 0);
        assert_eq!(dest.row_count("widgets").await.unwrap(), 0);
    }
}
