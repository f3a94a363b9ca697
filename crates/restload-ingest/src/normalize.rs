//! Batch normalization: key validation, schema inference, chunking

use std::collections::HashMap;
use url::Url;

use crate::config::BufferConfig;
use crate::error::{DataError, LoadError};
use crate::record::{Record, RecordBatch, RecordKey};
use crate::resource::MergeStrategy;
use crate::schema::TableSchema;

/// A validated page ready to be written, split into load chunks
#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    pub resource: String,
    pub table: String,
    pub primary_key: String,
    pub merge_strategy: MergeStrategy,
    pub page: usize,
    pub cursor: Option<Url>,
    /// Schema of this batch alone
    pub schema: TableSchema,
    pub chunks: Vec<Vec<Record>>,
    pub rows: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    buffer_max_items: usize,
    file_rotation_bytes: u64,
}

impl Normalizer {
    pub fn new(buffer_max_items: usize, file_rotation_bytes: u64) -> Self {
        Self {
            buffer_max_items: buffer_max_items.max(1),
            file_rotation_bytes: file_rotation_bytes.max(1),
        }
    }

    pub fn from_config(config: &BufferConfig) -> restload_common::Result<Self> {
        Ok(Self::new(config.buffer_max_items, config.file_rotation_bytes()?))
    }

    /// Validate a page and split it into chunks. A rejected page drops
    /// nothing silently: the whole page is reported as one error.
    pub fn normalize(&self, batch: RecordBatch) -> Result<NormalizedBatch, LoadError> {
        let data_error = |source: DataError| LoadError::Data {
            resource: batch.resource.clone(),
            page: batch.page,
            source,
        };

        check_keys(&batch.records, &batch.primary_key).map_err(data_error)?;

        let schema = TableSchema::infer(&batch.table, &batch.records).map_err(|source| {
            LoadError::Schema {
                resource: batch.resource.clone(),
                page: batch.page,
                source,
            }
        })?;

        let rows = batch.records.len();
        let chunks = self.chunk(batch.records);

        Ok(NormalizedBatch {
            resource: batch.resource,
            table: batch.table,
            primary_key: batch.primary_key,
            merge_strategy: batch.merge_strategy,
            page: batch.page,
            cursor: batch.cursor,
            schema,
            chunks,
            rows,
        })
    }

    /// Split on `buffer_max_items` records or `file_rotation_bytes` of
    /// serialized JSON, whichever comes first. A record larger than the byte
    /// bound gets a chunk of its own.
    fn chunk(&self, records: Vec<Record>) -> Vec<Vec<Record>> {
        let mut chunks = Vec::new();
        let mut current = Vec::new();
        let mut current_bytes = 0u64;

        for record in records {
            let size = serde_json::to_vec(&record)
                .map(|bytes| bytes.len() as u64)
                .unwrap_or_default();

            let full = current.len() >= self.buffer_max_items
                || current_bytes + size > self.file_rotation_bytes;
            if full && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_bytes = 0;
            }

            current_bytes += size;
            current.push(record);
        }

        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

/// Every record has a scalar key and no key repeats within the page
fn check_keys(records: &[Record], primary_key: &str) -> Result<(), DataError> {
    let mut seen: HashMap<RecordKey, usize> = HashMap::with_capacity(records.len());
    let mut duplicates = Vec::new();

    for (index, record) in records.iter().enumerate() {
        let key = RecordKey::of(record, primary_key, index)?;
        let count = seen.entry(key.clone()).or_default();
        *count += 1;
        if *count == 2 {
            duplicates.push(key.to_string());
        }
    }

    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(DataError::DuplicateKeys {
            primary_key: primary_key.to_string(),
            keys: duplicates,
        })
    }
}
