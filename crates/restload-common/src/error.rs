//! Error types shared across restload crates

use thiserror::Error;

/// Result type alias for restload operations
pub type Result<T> = std::result::Result<T, RestloadError>;

/// Main error type for configuration and IO plumbing
#[derive(Error, Debug)]
pub enum RestloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid pipeline file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidEnv {
        key: String,
        value: String,
        reason: String,
    },
}

impl RestloadError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
