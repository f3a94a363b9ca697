//! Pipeline configuration
//!
//! Sources, lowest to highest precedence: defaults, an optional TOML pipeline
//! file, `.env`, `RESTLOAD_*` environment variables, then CLI flags (applied
//! by the binary). The resulting [`PipelineConfig`] is passed to the
//! pipeline explicitly; nothing below the binary reads the environment.

use byte_unit::Byte;
use restload_common::{env, RestloadError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::resource::{default_resources, Resource};

/// Complete configuration of one pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline_name: String,
    pub dataset_name: String,
    /// Drop every resource's table before loading
    pub full_refresh: bool,
    pub http: HttpConfig,
    pub workers: WorkerConfig,
    pub buffer: BufferConfig,
    pub destination: DestinationConfig,
}

/// Source API client settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpConfig {
    pub base_url: String,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
    /// Total attempts per page, first try included
    pub max_attempts: u32,
    /// Fixed delay between attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Retry 4xx responses other than 408/429 as well
    pub retry_client_errors: bool,
    pub user_agent: String,
}

/// Worker pool sizes per stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub extract: usize,
    pub normalize: usize,
    pub load: usize,
}

/// Buffering between stages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BufferConfig {
    /// Upper bound on the serialized size of one load chunk, e.g. "50MB"
    pub file_rotation: String,
    /// Upper bound on the record count of one load chunk
    pub buffer_max_items: usize,
    /// Pages buffered between a resource's extraction and its loader
    pub channel_capacity: usize,
}

/// Where records are loaded
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DestinationConfig {
    pub kind: DestinationKind,
    /// Root directory of the local destination
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    /// Tables kept in process memory, gone after the run
    Memory,
    /// One JSON file per table on local disk
    #[default]
    Local,
}

impl std::str::FromStr for DestinationKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(DestinationKind::Memory),
            "local" => Ok(DestinationKind::Local),
            _ => Err(format!("unknown destination kind: {s}")),
        }
    }
}

impl std::fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DestinationKind::Memory => write!(f, "memory"),
            DestinationKind::Local => write!(f, "local"),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_name: "jaffle_shop_pipeline".to_string(),
            dataset_name: "jaffle_shop_data".to_string(),
            full_refresh: false,
            http: HttpConfig::default(),
            workers: WorkerConfig::default(),
            buffer: BufferConfig::default(),
            destination: DestinationConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "https://jaffle-shop.scalevector.ai".to_string(),
            timeout_ms: 30_000,
            max_attempts: 3,
            retry_delay_ms: 3_000,
            retry_client_errors: false,
            user_agent: format!("restload/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let extract = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            extract,
            normalize: 2,
            load: 2,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            file_rotation: "50MB".to_string(),
            buffer_max_items: 10_000,
            channel_capacity: 16,
        }
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            kind: DestinationKind::Local,
            path: PathBuf::from("./.restload"),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&self.base_url)
            .map_err(|e| RestloadError::config(format!("invalid base_url {:?}: {e}", self.base_url)))
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.base_url()?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RestloadError::config(format!(
                "base_url must be http or https, got {}",
                url.scheme()
            )));
        }
        if self.timeout_ms == 0 {
            return Err(RestloadError::config("http.timeout_ms must be greater than 0"));
        }
        if self.max_attempts == 0 {
            return Err(RestloadError::config("http.max_attempts must be greater than 0"));
        }
        Ok(())
    }
}

impl BufferConfig {
    /// `file_rotation` in bytes
    pub fn file_rotation_bytes(&self) -> Result<u64> {
        let byte = Byte::parse_str(&self.file_rotation, true).map_err(|e| {
            RestloadError::config(format!("invalid file_rotation {:?}: {e}", self.file_rotation))
        })?;
        Ok(byte.as_u64())
    }
}

impl PipelineConfig {
    /// Defaults, then the pipeline file, then `.env` and `RESTLOAD_*`
    /// variables. Returns the resources the file lists, or the defaults when
    /// it lists none.
    pub fn load(path: Option<&Path>) -> Result<(Self, Vec<Resource>)> {
        let _ = dotenvy::dotenv();

        let file = match path {
            Some(path) => PipelineFile::read(path)?,
            None => PipelineFile::default(),
        };

        let config = file.pipeline.merge_env()?;
        config.validate()?;

        let resources = if file.resources.is_empty() {
            default_resources()
        } else {
            file.resources
        };

        Ok((config, resources))
    }

    /// Apply every `RESTLOAD_*` variable that is set
    pub fn merge_env(mut self) -> Result<Self> {
        env::apply("RESTLOAD_PIPELINE_NAME", &mut self.pipeline_name)?;
        env::apply("RESTLOAD_DATASET_NAME", &mut self.dataset_name)?;
        env::apply("RESTLOAD_FULL_REFRESH", &mut self.full_refresh)?;

        env::apply("RESTLOAD_BASE_URL", &mut self.http.base_url)?;
        env::apply("RESTLOAD_HTTP__TIMEOUT_MS", &mut self.http.timeout_ms)?;
        env::apply("RESTLOAD_HTTP__MAX_ATTEMPTS", &mut self.http.max_attempts)?;
        env::apply("RESTLOAD_HTTP__RETRY_DELAY_MS", &mut self.http.retry_delay_ms)?;
        env::apply(
            "RESTLOAD_HTTP__RETRY_CLIENT_ERRORS",
            &mut self.http.retry_client_errors,
        )?;

        env::apply("RESTLOAD_EXTRACT__WORKERS", &mut self.workers.extract)?;
        env::apply("RESTLOAD_NORMALIZE__WORKERS", &mut self.workers.normalize)?;
        env::apply("RESTLOAD_LOAD__WORKERS", &mut self.workers.load)?;

        env::apply("RESTLOAD_EXTRACT__FILE_ROTATION", &mut self.buffer.file_rotation)?;
        env::apply(
            "RESTLOAD_EXTRACT__BUFFER_MAX_ITEMS",
            &mut self.buffer.buffer_max_items,
        )?;

        env::apply("RESTLOAD_DESTINATION", &mut self.destination.kind)?;
        env::apply("RESTLOAD_DESTINATION_PATH", &mut self.destination.path)?;

        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("pipeline_name", &self.pipeline_name),
            ("dataset_name", &self.dataset_name),
        ] {
            if !crate::resource::is_identifier(value) {
                return Err(RestloadError::config(format!(
                    "{field} {value:?} must be non-empty and use only letters, digits, '_' or '-'"
                )));
            }
        }

        self.http.validate()?;

        if self.workers.extract == 0 || self.workers.normalize == 0 || self.workers.load == 0 {
            return Err(RestloadError::config("worker counts must be greater than 0"));
        }
        if self.buffer.buffer_max_items == 0 {
            return Err(RestloadError::config("buffer_max_items must be greater than 0"));
        }
        if self.buffer.channel_capacity == 0 {
            return Err(RestloadError::config("channel_capacity must be greater than 0"));
        }
        if self.buffer.file_rotation_bytes()? == 0 {
            return Err(RestloadError::config("file_rotation must be greater than 0 bytes"));
        }

        Ok(())
    }
}

/// On-disk pipeline file: the config keys at the top level plus an optional
/// `[[resources]]` array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineFile {
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl PipelineFile {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RestloadError::config(format!("cannot read pipeline file {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
