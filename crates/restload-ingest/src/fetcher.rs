//! Resource-level view over the paginator

use futures::stream::{self, Stream, StreamExt};
use url::Url;

use crate::error::FetchError;
use crate::paginator::Paginator;
use crate::record::{Record, RecordBatch};
use crate::resource::Resource;

/// Turns a resource's pages into tagged batches or a flat record stream
#[derive(Clone)]
pub struct ResourceFetcher {
    paginator: Paginator,
}

impl ResourceFetcher {
    pub fn new(paginator: Paginator) -> Self {
        Self { paginator }
    }

    /// The resource's start URL under the paginator's base URL
    pub fn start_url(&self, resource: &Resource) -> Result<Url, FetchError> {
        resource.start_url(self.paginator.base_url())
    }

    /// One [`RecordBatch`] per page, in page order. Fetch errors pass through
    /// unchanged and end the stream.
    pub fn batches(
        &self,
        resource: &Resource,
        start_url: Url,
    ) -> impl Stream<Item = Result<RecordBatch, FetchError>> + Send + 'static {
        let resource = resource.clone();
        self.paginator
            .keyed_pages(start_url, resource.primary_key().to_string())
            .map(move |page| {
                page.map(|page| RecordBatch::new(&resource, page.number, page.url, page.records))
            })
    }

    /// Every record of the resource, in page order then within-page order
    pub fn records(
        &self,
        resource: &Resource,
        start_url: Url,
    ) -> impl Stream<Item = Result<Record, FetchError>> + Send + 'static {
        self.batches(resource, start_url).flat_map(|batch| match batch {
            Ok(batch) => stream::iter(batch.records.into_iter().map(Ok).collect::<Vec<_>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        })
    }
}
