//! Records and record batches

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use url::Url;

use crate::error::DataError;
use crate::resource::{MergeStrategy, Resource};

/// One JSON object from the source API
pub type Record = serde_json::Map<String, Value>;

/// Hashable form of a primary key value.
///
/// Built from the JSON text of a scalar, so the string `"1"` and the number
/// `1` stay distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey(String);

impl RecordKey {
    /// Key of a scalar value; `None` for null, arrays and objects
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => Some(Self(value.to_string())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Key of `record` under `primary_key`; `index` is only used for the error
    pub fn of(record: &Record, primary_key: &str, index: usize) -> Result<Self, DataError> {
        let value = record.get(primary_key).ok_or_else(|| DataError::MissingKey {
            index,
            primary_key: primary_key.to_string(),
        })?;

        Self::from_value(value).ok_or_else(|| DataError::InvalidKey {
            index,
            primary_key: primary_key.to_string(),
        })
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page of records tagged with the metadata the loader needs
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub resource: String,
    pub table: String,
    pub primary_key: String,
    pub merge_strategy: MergeStrategy,
    /// 1-based page number within the resource
    pub page: usize,
    /// URL the page was fetched from, `None` for records handed in directly
    pub cursor: Option<Url>,
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn new(resource: &Resource, page: usize, cursor: Url, records: Vec<Record>) -> Self {
        Self {
            resource: resource.name().to_string(),
            table: resource.table_name().to_string(),
            primary_key: resource.primary_key().to_string(),
            merge_strategy: resource.merge_strategy(),
            page,
            cursor: Some(cursor),
            records,
        }
    }

    /// A batch of records that did not come from a page fetch
    pub fn from_records(resource: &Resource, page: usize, records: Vec<Record>) -> Self {
        Self {
            resource: resource.name().to_string(),
            table: resource.table_name().to_string(),
            primary_key: resource.primary_key().to_string(),
            merge_strategy: resource.merge_strategy(),
            page,
            cursor: None,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
