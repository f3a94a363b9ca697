//! Error taxonomy for extraction and loading
//!
//! Failures are scoped: an [`HttpError`] is one failed attempt, a
//! [`FetchError`] ends one resource's extraction, a [`LoadError`] is one
//! rejected batch (or an aborted resource load), and a [`PipelineError`] is a
//! startup failure that prevents the run from starting at all.

use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::schema::FieldType;

/// Failure of a single HTTP attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("server responded with HTTP {status}")]
    Status { status: u16 },
}

impl HttpError {
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            HttpError::Timeout(timeout_ms)
        } else if let Some(status) = err.status() {
            HttpError::Status {
                status: status.as_u16(),
            }
        } else {
            HttpError::Network(err.to_string())
        }
    }

    /// Whether another attempt could succeed.
    ///
    /// Client errors fail fast except 408 and 429, unless the caller opts
    /// into retrying them as well.
    pub fn is_retryable(&self, retry_client_errors: bool) -> bool {
        match self {
            HttpError::Network(_) | HttpError::Timeout(_) => true,
            HttpError::Status { status } => match status {
                408 | 429 => true,
                400..=499 => retry_client_errors,
                _ => true,
            },
        }
    }
}

/// Terminal failure of one resource's extraction
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("giving up on {url} after {attempts} attempt(s): {last_cause}")]
    Exhausted {
        url: Url,
        attempts: u32,
        last_cause: HttpError,
    },

    #[error("{url} rejected the request: {cause}")]
    Rejected { url: Url, cause: HttpError },

    #[error("could not decode response from {url}: {reason}")]
    Decode { url: Url, reason: String },

    #[error("invalid start url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("extraction of {url} was cancelled")]
    Cancelled { url: Url },

    #[error("extraction task for {resource} stopped unexpectedly")]
    Aborted { resource: String },
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled { .. })
    }
}

/// A field changed type in a way that is not a widening
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("column {column:?} of table {table:?} is {existing}, incoming value is {incoming}")]
pub struct SchemaConflict {
    pub table: String,
    pub column: String,
    pub existing: FieldType,
    pub incoming: FieldType,
}

/// Record-level data problems found while normalizing one page
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DataError {
    #[error("record {index} has no {primary_key:?} field")]
    MissingKey { index: usize, primary_key: String },

    #[error("record {index} has a null or non-scalar {primary_key:?} value")]
    InvalidKey { index: usize, primary_key: String },

    #[error("{primary_key:?} values repeated within one page: {}", .keys.join(", "))]
    DuplicateKeys {
        primary_key: String,
        keys: Vec<String>,
    },
}

/// Error reported by a destination
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DestinationError {
    pub message: String,
    /// Connection or auth style failure; the current resource load stops
    pub fatal: bool,
}

impl DestinationError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

impl From<std::io::Error> for DestinationError {
    fn from(err: std::io::Error) -> Self {
        DestinationError::fatal(format!("storage IO failed: {err}"))
    }
}

impl From<serde_json::Error> for DestinationError {
    fn from(err: serde_json::Error) -> Self {
        DestinationError::recoverable(format!("could not encode table data: {err}"))
    }
}

/// Failure while loading one resource
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("page {page} of {resource}: {source}")]
    Data {
        resource: String,
        page: usize,
        source: DataError,
    },

    #[error("page {page} of {resource}: {source}")]
    Schema {
        resource: String,
        page: usize,
        source: SchemaConflict,
    },

    #[error("page {page} of {resource}: destination rejected batch: {source}")]
    Destination {
        resource: String,
        page: usize,
        source: DestinationError,
    },

    #[error("load of {resource} aborted: {source}")]
    Fatal {
        resource: String,
        source: DestinationError,
    },

    #[error("{resource} replaces its table and was already loaded in this run")]
    ReplaceAlreadyLoaded { resource: String },
}

impl LoadError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, LoadError::Fatal { .. })
    }
}

/// Startup failure; the run never starts
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] restload_common::RestloadError),

    #[error("destination unavailable: {0}")]
    Destination(DestinationError),

    #[error("invalid resource set: {0}")]
    Resources(String),

    #[error("could not build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}
