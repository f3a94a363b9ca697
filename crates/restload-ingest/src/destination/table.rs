use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::WriteMode;
use crate::error::DestinationError;
use crate::record::{Record, RecordKey};
use crate::schema::TableSchema;

/// Rows and schema of one table, shared by the bundled destinations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    pub schema: TableSchema,
    rows: Vec<Record>,
    /// Row position by key, for the column named in the first field
    #[serde(skip)]
    index: KeyIndex,
}

impl Table {
    pub fn new(schema: TableSchema, rows: Vec<Record>) -> Self {
        Self {
            schema,
            rows,
            index: None,
        }
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.index = None;
    }

    /// Apply a chunk. Keys are checked before anything is written, so a
    /// rejected chunk leaves the table untouched.
    pub fn apply(&mut self, mode: &WriteMode, records: Vec<Record>) -> Result<u64, DestinationError> {
        let written = records.len() as u64;

        match mode {
            WriteMode::Append => {
                self.rows.extend(records);
                self.index = None;
            },
            WriteMode::Merge { primary_key } => {
                let keys = records
                    .iter()
                    .enumerate()
                    .map(|(i, record)| RecordKey::of(record, primary_key, i))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| DestinationError::recoverable(e.to_string()))?;

                let Table { rows, index, .. } = self;
                let index = key_index(index, rows, primary_key);
                for (key, record) in keys.into_iter().zip(records) {
                    match index.get(&key) {
                        Some(&position) => {
                            let row = &mut rows[position];
                            for (column, value) in record {
                                row.insert(column, value);
                            }
                        },
                        None => {
                            index.insert(key, rows.len());
                            rows.push(record);
                        },
                    }
                }
            },
        }

        Ok(written)
    }
}

type KeyIndex = Option<(String, HashMap<RecordKey, usize>)>;

/// The index for `primary_key`, rebuilt from `rows` when missing or built
/// for another column
fn key_index<'a>(
    slot: &'a mut KeyIndex,
    rows: &[Record],
    primary_key: &str,
) -> &'a mut HashMap<RecordKey, usize> {
    let stale = !matches!(slot, Some((column, _)) if column.as_str() == primary_key);
    if stale {
        let index = rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| RecordKey::of(row, primary_key, i).ok().map(|key| (key, i)))
            .collect();
        *slot = Some((primary_key.to_string(), index));
    }

    let (_, index) = slot.get_or_insert_with(|| (primary_key.to_string(), HashMap::new()));
    index
}
