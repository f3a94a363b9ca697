//! Restload Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the restload workspace members.
//!
//! - **Error Handling**: the workspace error type and result alias
//! - **Environment**: typed lookups of `RESTLOAD_*` style variables
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use restload_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod env;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{RestloadError, Result};
