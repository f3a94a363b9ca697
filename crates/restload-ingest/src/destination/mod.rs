//! Destination interface
//!
//! The pipeline only talks to storage through [`Destination`]. Two
//! implementations ship with the crate: [`MemoryDestination`] for tests and
//! dry runs, and [`LocalDestination`], which keeps one JSON file per table
//! so repeated runs converge on disk.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DestinationError;
use crate::record::Record;
use crate::schema::TableSchema;

mod local;
mod memory;
mod table;

pub use local::LocalDestination;
pub use memory::MemoryDestination;
pub use table::Table;

/// How a chunk is applied to its table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteMode {
    /// Upsert by `primary_key`: incoming fields overwrite the matching row's
    /// fields, unmatched records are inserted
    Merge { primary_key: String },
    /// Insert every record
    Append,
}

/// One completed run, as recorded by destinations that keep a load history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadEntry {
    pub load_id: Uuid,
    pub pipeline_name: String,
    pub dataset_name: String,
    pub status: String,
    pub rows_loaded: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Table storage the loader writes to
#[async_trait]
pub trait Destination: Send + Sync {
    /// Short name used in logs and summaries
    fn name(&self) -> &str;

    /// Current schema of `table`, `None` if the table does not exist
    async fn table_schema(&self, table: &str) -> Result<Option<TableSchema>, DestinationError>;

    /// Store `schema` as the schema of `table`, creating the table if needed.
    ///
    /// Called with an already evolved schema, so it only ever adds columns or
    /// widens their types.
    async fn evolve_schema(&self, table: &str, schema: &TableSchema) -> Result<(), DestinationError>;

    /// Apply `records` to `table`, returning the number of rows written
    async fn write(
        &self,
        table: &str,
        mode: &WriteMode,
        records: Vec<Record>,
    ) -> Result<u64, DestinationError>;

    /// Remove every row, keeping the schema
    async fn truncate(&self, table: &str) -> Result<(), DestinationError>;

    /// Remove the table and its schema; a missing table is not an error
    async fn drop_table(&self, table: &str) -> Result<(), DestinationError>;

    async fn row_count(&self, table: &str) -> Result<u64, DestinationError>;

    /// Every row of `table` in storage order
    async fn rows(&self, table: &str) -> Result<Vec<Record>, DestinationError>;

    async fn record_load(&self, _entry: &LoadEntry) -> Result<(), DestinationError> {
        Ok(())
    }
}
