//! Resource definitions
//!
//! A [`Resource`] is one logical entity of the source API (customers,
//! orders, ...). Resources are plain values built at startup, either in code
//! or from the `[[resources]]` array of a pipeline file, and handed to the
//! scheduler explicitly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::FetchError;

/// How a resource's records are written to its table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Upsert by primary key
    #[default]
    Merge,
    /// Insert everything, no dedup
    Append,
    /// Table holds exactly this run's records
    Replace,
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "merge" => Ok(MergeStrategy::Merge),
            "append" => Ok(MergeStrategy::Append),
            "replace" => Ok(MergeStrategy::Replace),
            _ => Err(format!("unknown merge strategy: {s}")),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::Merge => write!(f, "merge"),
            MergeStrategy::Append => write!(f, "append"),
            MergeStrategy::Replace => write!(f, "replace"),
        }
    }
}

/// Whether a resource may be extracted alongside others
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Concurrency {
    /// Runs on the bounded extract worker pool
    #[default]
    Parallel,
    /// Runs on the single sequential lane, one resource at a time
    Sequential,
}

/// One extractable, loadable entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    name: String,
    primary_key: String,
    #[serde(default)]
    merge_strategy: MergeStrategy,
    #[serde(default)]
    concurrency: Concurrency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    table_name: Option<String>,
    /// Path relative to the base URL, or an absolute URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    endpoint: Option<String>,
}

impl Resource {
    /// A merge-by-key, parallel resource read from `/api/v1/<name>?page=1`
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            merge_strategy: MergeStrategy::default(),
            concurrency: Concurrency::default(),
            table_name: None,
            endpoint: None,
        }
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn sequential(self) -> Self {
        self.with_concurrency(Concurrency::Sequential)
    }

    pub fn with_table_name(mut self, table: impl Into<String>) -> Self {
        self.table_name = Some(table.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn merge_strategy(&self) -> MergeStrategy {
        self.merge_strategy
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    pub fn table_name(&self) -> &str {
        self.table_name.as_deref().unwrap_or(&self.name)
    }

    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("/api/v1/{}?page=1", self.name))
    }

    /// First page URL: absolute endpoints are used as-is, relative ones are
    /// appended to the base URL.
    pub fn start_url(&self, base_url: &Url) -> Result<Url, FetchError> {
        let endpoint = self.endpoint();
        if let Ok(absolute) = Url::parse(&endpoint) {
            return Ok(absolute);
        }

        let joined = format!(
            "{}/{}",
            base_url.as_str().trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| FetchError::InvalidUrl {
            url: joined,
            reason: e.to_string(),
        })
    }

    /// Names end up as table and file names, so keep them to identifier
    /// characters.
    pub fn validate(&self) -> Result<(), String> {
        if !is_identifier(&self.name) {
            return Err(format!(
                "resource name {:?} must be non-empty and use only letters, digits, '_' or '-'",
                self.name
            ));
        }
        if !is_identifier(self.table_name()) {
            return Err(format!(
                "table name {:?} of resource {} must use only letters, digits, '_' or '-'",
                self.table_name(),
                self.name
            ));
        }
        if self.primary_key.trim().is_empty() {
            return Err(format!("resource {} has an empty primary key", self.name));
        }
        Ok(())
    }
}

pub(crate) fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// The three jaffle shop resources, keyed on `id` and merged. Orders are
/// extracted sequentially, the others on the worker pool.
pub fn default_resources() -> Vec<Resource> {
    vec![
        Resource::new("customers", "id"),
        Resource::new("orders", "id").sequential(),
        Resource::new("products", "id"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let resource = Resource::new("widgets", "id");
        assert_eq!(resource.table_name(), "widgets");
        assert_eq!(resource.endpoint(), "/api/v1/widgets?page=1");
        assert_eq!(resource.merge_strategy(), MergeStrategy::Merge);
        assert_eq!(resource.concurrency(), Concurrency::Parallel);
    }

    #[test]
    fn test_start_url_appends_to_base() {
        let base = Url::parse("https://api.example.test").unwrap();
        let url = Resource::new("widgets", "id").start_url(&base).unwrap();
        assert_eq!(url.as_str(), "https://api.example.test/api/v1/widgets?page=1");

        let prefixed = Url::parse("https://api.example.test/shop/").unwrap();
        let url = Resource::new("widgets", "id").start_url(&prefixed).unwrap();
        assert_eq!(url.as_str(), "https://api.example.test/shop/api/v1/widgets?page=1");
    }

    #[test]
    fn test_absolute_endpoint_wins() {
        let base = Url::parse("https://api.example.test").unwrap();
        let url = Resource::new("widgets", "id")
            .with_endpoint("https://other.example.test/w?page=3")
            .start_url(&base)
            .unwrap();
        assert_eq!(url.host_str(), Some("other.example.test"));
    }

    #[test]
    fn test_validate_rejects_path_like_names() {
        assert!(Resource::new("../etc", "id").validate().is_err());
        assert!(Resource::new("widgets", " ").validate().is_err());
        assert!(Resource::new("widgets", "id")
            .with_table_name("stock items")
            .validate()
            .is_err());
        assert!(Resource::new("order-lines", "id").validate().is_ok());
    }

    #[test]
    fn test_deserialize_from_toml() {
        let resource: Resource = toml::from_str(
            r#"
            name = "orders"
            primary_key = "id"
            merge_strategy = "append"
            concurrency = "sequential"
            "#,
        )
        .unwrap();
        assert_eq!(resource.merge_strategy(), MergeStrategy::Append);
        assert_eq!(resource.concurrency(), Concurrency::Sequential);
        assert_eq!("REPLACE".parse::<MergeStrategy>().unwrap(), MergeStrategy::Replace);
    }
}
