use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{Mutex, RwLock};

use super::{Destination, LoadEntry, Table, WriteMode};
use crate::error::DestinationError;
use crate::record::Record;
use crate::schema::TableSchema;

/// Tables held in process memory
#[derive(Debug, Default)]
pub struct MemoryDestination {
    tables: RwLock<HashMap<String, Table>>,
    failures: Mutex<HashMap<String, VecDeque<DestinationError>>>,
    loads: Mutex<Vec<LoadEntry>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `write` to `table` fail with `error`. Queued failures
    /// are consumed one per write, in order.
    pub async fn inject_failure(&self, table: &str, error: DestinationError) {
        self.failures
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .push_back(error);
    }

    pub async fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Runs recorded through [`Destination::record_load`]
    pub async fn loads(&self) -> Vec<LoadEntry> {
        self.loads.lock().await.clone()
    }

    async fn take_failure(&self, table: &str) -> Option<DestinationError> {
        self.failures
            .lock()
            .await
            .get_mut(table)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn name(&self) -> &str {
        "memory"
    }

    async fn table_schema(&self, table: &str) -> Result<Option<TableSchema>, DestinationError> {
        Ok(self.tables.read().await.get(table).map(|t| t.schema.clone()))
    }

    async fn evolve_schema(&self, table: &str, schema: &TableSchema) -> Result<(), DestinationError> {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .schema = schema.clone();
        Ok(())
    }

    async fn write(
        &self,
        table: &str,
        mode: &WriteMode,
        records: Vec<Record>,
    ) -> Result<u64, DestinationError> {
        if let Some(error) = self.take_failure(table).await {
            return Err(error);
        }

        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .apply(mode, records)
    }

    async fn truncate(&self, table: &str) -> Result<(), DestinationError> {
        if let Some(existing) = self.tables.write().await.get_mut(table) {
            existing.clear();
        }
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<(), DestinationError> {
        self.tables.write().await.remove(table);
        Ok(())
    }

    async fn row_count(&self, table: &str) -> Result<u64, DestinationError> {
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .map_or(0, |t| t.len() as u64))
    }

    async fn rows(&self, table: &str) -> Result<Vec<Record>, DestinationError> {
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .map(|t| t.rows().to_vec())
            .unwrap_or_default())
    }

    async fn record_load(&self, entry: &LoadEntry) -> Result<(), DestinationError> {
        self.loads.lock().await.push(entry.clone());
        Ok(())
    }
}
