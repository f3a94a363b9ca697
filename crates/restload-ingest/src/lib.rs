//! Restload Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
//!
//! Incremental extract-and-load of paginated REST resources.
//!
//! - **Paginator**: walks `Link: rel="next"` pages with bounded retries
//! - **Scheduler**: extracts resources on a bounded pool plus a sequential lane
//! - **Normalizer**: validates primary keys, infers schemas, chunks batches
//! - **Load coordinator**: merge, append or replace into a [`Destination`]
//! - **Pipeline**: streams extraction into loading and reports a [`RunSummary`]
//!
//! # Example
//!
//! ```no_run
//! use restload_ingest::{default_resources, MemoryDestination, Pipeline, PipelineConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = Pipeline::new(PipelineConfig::default(), Arc::new(MemoryDestination::new()))?;
//!     let summary = pipeline.run(default_resources()).await?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod destination;
pub mod error;
pub mod fetcher;
pub mod load;
pub mod normalize;
pub mod paginator;
pub mod pipeline;
pub mod record;
pub mod resource;
pub mod scheduler;
pub mod schema;
pub mod state;
pub mod summary;

pub use config::{DestinationKind, PipelineConfig};
pub use destination::{Destination, LocalDestination, MemoryDestination, WriteMode};
pub use error::{DestinationError, FetchError, HttpError, LoadError, PipelineError};
pub use load::{LoadCoordinator, LoadResult};
pub use paginator::{Page, Paginator};
pub use pipeline::Pipeline;
pub use record::{Record, RecordBatch};
pub use resource::{default_resources, Concurrency, MergeStrategy, Resource};
pub use summary::{RunStatus, RunSummary};
