//! Table schemas and additive schema evolution
//!
//! Column types are inferred from JSON values. Evolution only ever adds
//! columns or widens `integer` to `float`; every other type change is a
//! [`SchemaConflict`] that the loader reports instead of coercing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::SchemaConflict;
use crate::record::Record;

/// Inferred column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Bool,
    Integer,
    Float,
    Text,
    /// Nested objects and arrays, stored as JSON
    Json,
}

impl FieldType {
    /// Type of a value; `None` for null, which never types a column
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(FieldType::Bool),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(FieldType::Integer),
            Value::Number(_) => Some(FieldType::Float),
            Value::String(_) => Some(FieldType::Text),
            Value::Array(_) | Value::Object(_) => Some(FieldType::Json),
        }
    }

    /// Type able to hold both, when going from `self` to `incoming` is not a
    /// narrowing or a conflict
    pub fn unify(self, incoming: FieldType) -> Option<FieldType> {
        match (self, incoming) {
            (a, b) if a == b => Some(a),
            (FieldType::Integer, FieldType::Float) | (FieldType::Float, FieldType::Integer) => {
                Some(FieldType::Float)
            },
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Bool => "bool",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Text => "text",
            FieldType::Json => "json",
        };
        f.write_str(name)
    }
}

/// Column name to type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    columns: BTreeMap<String, FieldType>,
}

/// Result of evolving a schema with an incoming one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaChange {
    pub added: Vec<String>,
    pub widened: Vec<String>,
    /// The schema after the change
    pub schema: TableSchema,
}

impl SchemaChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.widened.is_empty()
    }
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Infer the schema of a set of records that must agree with each other
    pub fn infer<'a>(
        table: &str,
        records: impl IntoIterator<Item = &'a Record>,
    ) -> Result<Self, SchemaConflict> {
        let mut schema = Self::new();
        for record in records {
            schema.observe(table, record)?;
        }
        Ok(schema)
    }

    /// Fold one record's fields into the schema
    pub fn observe(&mut self, table: &str, record: &Record) -> Result<(), SchemaConflict> {
        for (column, value) in record {
            let Some(incoming) = FieldType::of(value) else {
                continue;
            };
            self.merge_column(table, column, incoming)?;
        }
        Ok(())
    }

    fn merge_column(
        &mut self,
        table: &str,
        column: &str,
        incoming: FieldType,
    ) -> Result<(), SchemaConflict> {
        match self.columns.get(column).copied() {
            None => {
                self.columns.insert(column.to_string(), incoming);
            },
            Some(existing) => {
                let unified = existing.unify(incoming).ok_or_else(|| SchemaConflict {
                    table: table.to_string(),
                    column: column.to_string(),
                    existing,
                    incoming,
                })?;
                self.columns.insert(column.to_string(), unified);
            },
        }
        Ok(())
    }

    /// Evolve this (destination) schema with an incoming batch schema
    pub fn evolve(&self, table: &str, incoming: &TableSchema) -> Result<SchemaChange, SchemaConflict> {
        let mut change = SchemaChange {
            schema: self.clone(),
            ..SchemaChange::default()
        };

        for (column, &incoming_type) in &incoming.columns {
            match self.columns.get(column).copied() {
                None => change.added.push(column.clone()),
                Some(existing) => match existing.unify(incoming_type) {
                    Some(unified) if unified != existing => change.widened.push(column.clone()),
                    Some(_) => {},
                    None => {
                        return Err(SchemaConflict {
                            table: table.to_string(),
                            column: column.clone(),
                            existing,
                            incoming: incoming_type,
                        })
                    },
                },
            }
            change.schema.merge_column(table, column, incoming_type)?;
        }

        Ok(change)
    }

    pub fn column(&self, name: &str) -> Option<FieldType> {
        self.columns.get(name).copied()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, FieldType)> {
        self.columns.iter().map(|(name, ty)| (name.as_str(), *ty))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
