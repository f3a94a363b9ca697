//! Concurrent extraction of many resources
//!
//! Parallel resources share a bounded pool of `workers` permits. Sequential
//! resources run one after another on a single lane task, which overlaps
//! with the pool. Each resource feeds its own bounded channel, so a slow
//! loader only stalls its own extraction.

use futures::future::join_all;
use futures::{FutureExt, Stream, StreamExt};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, info_span, warn, Instrument};

use crate::error::FetchError;
use crate::fetcher::ResourceFetcher;
use crate::record::{Record, RecordBatch};
use crate::resource::{Concurrency, Resource};
use crate::state::{RunState, Stage};

/// One item of a resource stream. An `Err` is always the last item.
pub type Extracted = Result<RecordBatch, FetchError>;

/// Page batches of one resource, in page order
pub struct ResourceStream {
    resource: Resource,
    inner: ReceiverStream<Extracted>,
}

impl ResourceStream {
    pub fn resource(&self) -> &Resource {
        &self.resource
    }
}

impl Stream for ResourceStream {
    type Item = Extracted;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Background extraction tasks of one [`ExtractionScheduler::run`]
pub struct ExtractionHandle {
    tasks: JoinSet<()>,
}

impl ExtractionHandle {
    /// Wait for every extraction task to finish
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Extraction task did not complete");
            }
        }
    }
}

/// Streams handed out by [`ExtractionScheduler::run`], in resource order
pub struct Extraction {
    pub streams: Vec<ResourceStream>,
    handle: ExtractionHandle,
}

impl Extraction {
    pub fn into_parts(self) -> (Vec<ResourceStream>, ExtractionHandle) {
        (self.streams, self.handle)
    }
}

pub struct ExtractionScheduler {
    fetcher: ResourceFetcher,
    workers: usize,
    channel_capacity: usize,
    state: Arc<RunState>,
}

impl ExtractionScheduler {
    pub fn new(
        fetcher: ResourceFetcher,
        workers: usize,
        channel_capacity: usize,
        state: Arc<RunState>,
    ) -> Self {
        Self {
            fetcher,
            workers: workers.max(1),
            channel_capacity: channel_capacity.max(1),
            state,
        }
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    /// Start extracting every resource. Must be called inside a tokio
    /// runtime; the streams should be consumed concurrently.
    pub fn run(&self, resources: Vec<Resource>) -> Extraction {
        let pool = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut streams = Vec::with_capacity(resources.len());
        let mut lane = Vec::new();

        for resource in resources {
            let (tx, rx) = mpsc::channel(self.channel_capacity);
            streams.push(ResourceStream {
                resource: resource.clone(),
                inner: ReceiverStream::new(rx),
            });

            let job = ExtractJob {
                fetcher: self.fetcher.clone(),
                state: self.state.clone(),
                resource,
                tx,
            };

            match job.resource.concurrency() {
                Concurrency::Parallel => {
                    let pool = pool.clone();
                    tasks.spawn(async move {
                        match pool.acquire_owned().await {
                            Ok(_permit) => job.run().await,
                            Err(_) => {
                                let resource = job.resource.name().to_string();
                                job.fail(FetchError::Aborted { resource }).await;
                            },
                        }
                    });
                },
                Concurrency::Sequential => lane.push(job),
            }
        }

        if !lane.is_empty() {
            tasks.spawn(async move {
                for job in lane {
                    job.run().await;
                }
            });
        }

        Extraction {
            streams,
            handle: ExtractionHandle { tasks },
        }
    }

    /// Extract every resource fully into memory, keyed by resource name
    pub async fn collect(
        &self,
        resources: Vec<Resource>,
    ) -> BTreeMap<String, Result<Vec<Record>, FetchError>> {
        let (streams, handle) = self.run(resources).into_parts();

        let drains = streams.into_iter().map(|mut stream| async move {
            let name = stream.resource().name().to_string();
            let mut records = Vec::new();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(batch) => records.extend(batch.records),
                    Err(e) => return (name, Err(e)),
                }
            }
            (name, Ok(records))
        });

        let results = join_all(drains).await;
        handle.join().await;
        results.into_iter().collect()
    }
}

struct ExtractJob {
    fetcher: ResourceFetcher,
    state: Arc<RunState>,
    resource: Resource,
    tx: mpsc::Sender<Extracted>,
}

impl ExtractJob {
    async fn run(self) {
        let span = info_span!("extract", resource = %self.resource.name());

        async {
            if AssertUnwindSafe(self.extract()).catch_unwind().await.is_err() {
                let resource = self.resource.name().to_string();
                self.fail(FetchError::Aborted { resource }).await;
            }
        }
        .instrument(span)
        .await
    }

    async fn extract(&self) {
        let name = self.resource.name();
        let start_url = match self.fetcher.start_url(&self.resource) {
            Ok(url) => url,
            Err(e) => return self.fail(e).await,
        };

        info!(url = %start_url, "Extraction started");

        let mut batches = std::pin::pin!(self.fetcher.batches(&self.resource, start_url));
        let mut pages = 0usize;
        let mut records = 0usize;

        while let Some(item) = batches.next().await {
            match item {
                Ok(batch) => {
                    if let Some(cursor) = &batch.cursor {
                        self.state.record_cursor(name, cursor).await;
                    }
                    pages += 1;
                    records += batch.len();

                    if self.tx.send(Ok(batch)).await.is_err() {
                        warn!(pages, "Consumer went away, stopping extraction");
                        return;
                    }
                },
                Err(e) => return self.fail(e).await,
            }
        }

        info!(pages, records, "Extraction finished");
    }

    async fn fail(&self, err: FetchError) {
        if err.is_cancelled() {
            warn!(error = %err, "Extraction cancelled");
        } else {
            error!(error = %err, "Extraction failed");
        }
        self.state
            .record_error(self.resource.name(), Stage::Extract, &err)
            .await;
        let _ = self.tx.send(Err(err)).await;
    }
}
