//! JSON files on local disk
//!
//! Layout under `<root>/<dataset>/`:
//!
//! - `<table>.json`: array of rows
//! - `<table>.schema.json`: column types
//! - `_loads.jsonl`: one line per completed run
//!
//! Files are replaced through a temporary file and a rename, so a crash
//! mid-write leaves the previous version in place.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Destination, LoadEntry, Table, WriteMode};
use crate::error::DestinationError;
use crate::record::Record;
use crate::schema::TableSchema;

const LOADS_FILE: &str = "_loads.jsonl";

pub struct LocalDestination {
    dir: PathBuf,
    /// Tables read so far; `None` caches "no such table"
    tables: Mutex<HashMap<String, Arc<Mutex<Option<Table>>>>>,
}

impl LocalDestination {
    /// Open (creating if needed) the dataset directory under `root`
    pub async fn open(root: impl AsRef<Path>, dataset: &str) -> Result<Self, DestinationError> {
        let dir = root.as_ref().join(dataset);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            DestinationError::fatal(format!("cannot create {}: {e}", dir.display()))
        })?;

        Ok(Self {
            dir,
            tables: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn rows_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.json"))
    }

    fn schema_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.schema.json"))
    }

    /// Cached slot for `table`, reading it from disk on first use
    async fn slot(&self, table: &str) -> Result<Arc<Mutex<Option<Table>>>, DestinationError> {
        let mut tables = self.tables.lock().await;
        if let Some(slot) = tables.get(table) {
            return Ok(slot.clone());
        }

        let loaded = self.read_table(table).await?;
        let slot = Arc::new(Mutex::new(loaded));
        tables.insert(table.to_string(), slot.clone());
        Ok(slot)
    }

    async fn read_table(&self, table: &str) -> Result<Option<Table>, DestinationError> {
        let schema = read_json::<TableSchema>(&self.schema_path(table)).await?;
        let rows = read_json::<Vec<Record>>(&self.rows_path(table)).await?;
        if schema.is_none() && rows.is_none() {
            return Ok(None);
        }

        let rows = rows.unwrap_or_default();
        debug!(table, rows = rows.len(), dir = %self.dir.display(), "Read table from disk");
        Ok(Some(Table::new(schema.unwrap_or_default(), rows)))
    }

    async fn persist_rows(&self, table: &str, data: &Table) -> Result<(), DestinationError> {
        write_json(&self.rows_path(table), data.rows()).await
    }

    async fn persist_schema(&self, table: &str, data: &Table) -> Result<(), DestinationError> {
        write_json(&self.schema_path(table), &data.schema).await
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, DestinationError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            DestinationError::fatal(format!("corrupt table file {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), DestinationError> {
    let bytes = serde_json::to_vec(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), DestinationError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Destination for LocalDestination {
    fn name(&self) -> &str {
        "local"
    }

    async fn table_schema(&self, table: &str) -> Result<Option<TableSchema>, DestinationError> {
        let slot = self.slot(table).await?;
        let data = slot.lock().await;
        Ok(data.as_ref().map(|t| t.schema.clone()))
    }

    async fn evolve_schema(&self, table: &str, schema: &TableSchema) -> Result<(), DestinationError> {
        let slot = self.slot(table).await?;
        let mut data = slot.lock().await;
        let existing = data.get_or_insert_with(Table::default);
        existing.schema = schema.clone();
        self.persist_schema(table, existing).await
    }

    async fn write(
        &self,
        table: &str,
        mode: &WriteMode,
        records: Vec<Record>,
    ) -> Result<u64, DestinationError> {
        let slot = self.slot(table).await?;
        let mut data = slot.lock().await;

        let created = data.is_none();
        let existing = data.get_or_insert_with(Table::default);
        let mut next = existing.clone();
        let written = next.apply(mode, records)?;

        self.persist_rows(table, &next).await?;
        if created {
            self.persist_schema(table, &next).await?;
        }
        *existing = next;

        Ok(written)
    }

    async fn truncate(&self, table: &str) -> Result<(), DestinationError> {
        let slot = self.slot(table).await?;
        let mut data = slot.lock().await;
        if let Some(existing) = data.as_mut() {
            existing.clear();
            self.persist_rows(table, existing).await?;
        }
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<(), DestinationError> {
        let slot = self.slot(table).await?;
        let mut data = slot.lock().await;
        remove_if_exists(&self.rows_path(table)).await?;
        remove_if_exists(&self.schema_path(table)).await?;
        *data = None;
        Ok(())
    }

    async fn row_count(&self, table: &str) -> Result<u64, DestinationError> {
        let slot = self.slot(table).await?;
        let data = slot.lock().await;
        Ok(data.as_ref().map_or(0, |t| t.len() as u64))
    }

    async fn rows(&self, table: &str) -> Result<Vec<Record>, DestinationError> {
        let slot = self.slot(table).await?;
        let data = slot.lock().await;
        Ok(data.as_ref().map(|t| t.rows().to_vec()).unwrap_or_default())
    }

    async fn record_load(&self, entry: &LoadEntry) -> Result<(), DestinationError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(LOADS_FILE))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
