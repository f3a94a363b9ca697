//! Pipeline driver: extraction streamed straight into per-resource loaders

use chrono::Utc;
use futures::StreamExt;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{DestinationKind, PipelineConfig};
use crate::destination::{Destination, LoadEntry, LocalDestination, MemoryDestination};
use crate::error::{FetchError, PipelineError};
use crate::fetcher::ResourceFetcher;
use crate::load::{LoadCoordinator, LoadResult};
use crate::normalize::Normalizer;
use crate::paginator::Paginator;
use crate::resource::Resource;
use crate::scheduler::{ExtractionScheduler, ResourceStream};
use crate::state::RunState;
use crate::summary::{ResourceSummary, RunStatus, RunSummary, RunTrace};

/// Open the destination named by `config`
pub async fn open_destination(config: &PipelineConfig) -> Result<Arc<dyn Destination>, PipelineError> {
    match config.destination.kind {
        DestinationKind::Memory => Ok(Arc::new(MemoryDestination::new())),
        DestinationKind::Local => {
            let local = LocalDestination::open(&config.destination.path, &config.dataset_name)
                .await
                .map_err(PipelineError::Destination)?;
            Ok(Arc::new(local))
        },
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    destination: Arc<dyn Destination>,
    paginator: Paginator,
    normalizer: Normalizer,
    /// Token of the next run; swapped for a fresh one once a run ends cancelled
    cancel: Mutex<CancellationToken>,
}

impl Pipeline {
    /// Fails if the configuration is invalid; no request is made yet
    pub fn new(config: PipelineConfig, destination: Arc<dyn Destination>) -> Result<Self, PipelineError> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let paginator = Paginator::new(&config.http, cancel.clone())?;
        let normalizer = Normalizer::from_config(&config.buffer)?;

        Ok(Self {
            config,
            destination,
            paginator,
            normalizer,
            cancel: Mutex::new(cancel),
        })
    }

    /// Build the pipeline together with the destination its config names
    pub async fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let destination = open_destination(&config).await?;
        Self::new(config, destination)
    }

    /// Cancelling this token stops the current or next run after the
    /// batches in flight. A cancelled run retires its token, so later runs
    /// need a fresh one from here.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn retire_cancelled_token(&self) {
        let mut cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn destination(&self) -> &Arc<dyn Destination> {
        &self.destination
    }

    /// Extract and load every resource.
    ///
    /// Only startup problems are errors. Failures of individual resources
    /// are reported in the returned summary.
    pub async fn run(&self, resources: Vec<Resource>) -> Result<RunSummary, PipelineError> {
        validate_resources(&resources)?;

        let load_id = Uuid::new_v4();
        let span = info_span!(
            "run",
            pipeline = %self.config.pipeline_name,
            dataset = %self.config.dataset_name,
            %load_id
        );

        self.run_inner(load_id, resources).instrument(span).await
    }

    async fn run_inner(&self, load_id: Uuid, resources: Vec<Resource>) -> Result<RunSummary, PipelineError> {
        let cancel = self.cancel_token();
        let result = self.run_with(load_id, resources, &cancel).await;
        self.retire_cancelled_token();
        result
    }

    async fn run_with(
        &self,
        load_id: Uuid,
        resources: Vec<Resource>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        let started_at = Utc::now();
        info!(
            resources = resources.len(),
            destination = self.destination.name(),
            full_refresh = self.config.full_refresh,
            "Pipeline run started"
        );

        if self.config.full_refresh {
            let tables: BTreeSet<&str> = resources.iter().map(Resource::table_name).collect();
            for table in tables {
                self.destination
                    .drop_table(table)
                    .await
                    .map_err(PipelineError::Destination)?;
                info!(table, "Dropped table for full refresh");
            }
        }

        let state = Arc::new(RunState::new());
        let scheduler = ExtractionScheduler::new(
            ResourceFetcher::new(self.paginator.with_cancel(cancel.clone())),
            self.config.workers.extract,
            self.config.buffer.channel_capacity,
            state.clone(),
        );
        let coordinator = LoadCoordinator::new(
            self.destination.clone(),
            self.normalizer,
            state.clone(),
            self.config.workers.normalize,
            self.config.workers.load,
        );

        let (streams, extraction) = scheduler.run(resources).into_parts();

        let loaders: Vec<_> = streams
            .into_iter()
            .map(|stream| {
                let resource = stream.resource().clone();
                let task = tokio::spawn(load_resource(coordinator.clone(), stream, cancel.clone()));
                (resource, task)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(loaders.len());
        for (resource, task) in loaders {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(resource = %resource.name(), error = %e, "Loader task did not complete");
                    ResourceOutcome {
                        resource: resource.clone(),
                        load: LoadResult {
                            aborted: true,
                            ..LoadResult::for_resource(&resource)
                        },
                        extract_error: None,
                    }
                },
            };
            outcomes.push(outcome);
        }
        extraction.join().await;

        let snapshot = state.snapshot().await;
        let mut trace = RunTrace::default();
        let summaries: Vec<ResourceSummary> = outcomes
            .into_iter()
            .map(|outcome| {
                trace.record(&outcome.load);
                let progress = snapshot
                    .progress(outcome.resource.name())
                    .cloned()
                    .unwrap_or_default();

                ResourceSummary {
                    name: outcome.resource.name().to_string(),
                    table: outcome.resource.table_name().to_string(),
                    merge_strategy: outcome.resource.merge_strategy(),
                    rows_loaded: outcome.load.rows_affected,
                    pages: progress.pages,
                    batches_loaded: outcome.load.batches_loaded,
                    batches_failed: outcome.load.batches_failed,
                    last_cursor: progress.last_cursor,
                    extract_error: outcome.extract_error.map(|e| e.to_string()),
                    load_errors: outcome.load.errors.iter().map(ToString::to_string).collect(),
                    aborted: outcome.load.aborted,
                }
            })
            .collect();

        let status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if summaries.iter().all(ResourceSummary::is_success) {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        let summary = RunSummary {
            load_id,
            pipeline_name: self.config.pipeline_name.clone(),
            dataset_name: self.config.dataset_name.clone(),
            destination: self.destination.name().to_string(),
            status,
            started_at,
            finished_at: Utc::now(),
            resources: summaries,
            errors: snapshot.errors,
            trace,
        };

        let entry = LoadEntry {
            load_id,
            pipeline_name: summary.pipeline_name.clone(),
            dataset_name: summary.dataset_name.clone(),
            status: summary.status.to_string(),
            rows_loaded: summary.rows_loaded(),
            started_at: summary.started_at,
            finished_at: summary.finished_at,
        };
        if let Err(e) = self.destination.record_load(&entry).await {
            warn!(error = %e, "Could not record load in destination");
        }

        info!(
            status = %summary.status,
            rows = summary.rows_loaded(),
            errors = summary.errors.len(),
            "Pipeline run finished"
        );

        Ok(summary)
    }
}

struct ResourceOutcome {
    resource: Resource,
    load: LoadResult,
    extract_error: Option<FetchError>,
}

/// Drain one resource stream into its load session
async fn load_resource(
    coordinator: LoadCoordinator,
    mut stream: ResourceStream,
    cancel: CancellationToken,
) -> ResourceOutcome {
    let resource = stream.resource().clone();
    let span = info_span!("load", resource = %resource.name());

    async move {
        let mut session = match coordinator.begin(&resource).await {
            Ok(session) => session,
            Err(e) => {
                return ResourceOutcome {
                    load: LoadResult::rejected(&resource, e),
                    resource,
                    extract_error: None,
                }
            },
        };

        let mut extract_error = None;
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Run cancelled, stopping load");
                    break;
                },
                item = stream.next() => item,
            };

            match item {
                None => break,
                Some(Ok(batch)) => {
                    if session.load_batch(batch).await.is_break() {
                        break;
                    }
                },
                Some(Err(e)) => {
                    extract_error = Some(e);
                    break;
                },
            }
        }

        ResourceOutcome {
            load: session.finish(),
            resource,
            extract_error,
        }
    }
    .instrument(span)
    .await
}

/// Names must be valid and unique
fn validate_resources(resources: &[Resource]) -> Result<(), PipelineError> {
    if resources.is_empty() {
        return Err(PipelineError::Resources("no resources to run".to_string()));
    }

    let mut names = HashSet::new();
    for resource in resources {
        resource.validate().map_err(PipelineError::Resources)?;
        if !names.insert(resource.name()) {
            return Err(PipelineError::Resources(format!(
                "resource {} is listed more than once",
                resource.name()
            )));
        }
    }
    Ok(())
}
