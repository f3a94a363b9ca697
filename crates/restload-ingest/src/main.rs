//! Restload Ingest - extract paginated REST resources into a destination

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use restload_common::logging::{init_logging, LogConfig, LogLevel};
use restload_ingest::config::{DestinationKind, PipelineConfig};
use restload_ingest::Pipeline;
use std::path::PathBuf;
use std::process;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "restload-ingest")]
#[command(author, version, about = "Load paginated REST resources into a dataset")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline once
    Run {
        #[command(flatten)]
        overrides: Overrides,

        /// Also write the run summary as JSON to this file
        #[arg(long)]
        summary_json: Option<PathBuf>,
    },

    /// Print the effective configuration and resources as TOML
    ShowConfig {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Flags that take precedence over the pipeline file and environment
#[derive(clap::Args, Debug)]
struct Overrides {
    /// Pipeline file (TOML) with settings and [[resources]]
    #[arg(short, long, env = "RESTLOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Base URL of the source API
    #[arg(long)]
    base_url: Option<String>,

    /// Dataset to load into
    #[arg(long)]
    dataset: Option<String>,

    #[arg(long)]
    pipeline_name: Option<String>,

    /// Drop every resource table before loading
    #[arg(long)]
    full_refresh: bool,

    #[arg(long, value_enum)]
    destination: Option<DestinationKind>,

    /// Root directory of the local destination
    #[arg(long)]
    destination_path: Option<PathBuf>,
}

impl Overrides {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(base_url) = &self.base_url {
            config.http.base_url = base_url.clone();
        }
        if let Some(dataset) = &self.dataset {
            config.dataset_name = dataset.clone();
        }
        if let Some(name) = &self.pipeline_name {
            config.pipeline_name = name.clone();
        }
        if self.full_refresh {
            config.full_refresh = true;
        }
        if let Some(kind) = self.destination {
            config.destination.kind = kind;
        }
        if let Some(path) = &self.destination_path {
            config.destination.path = path.clone();
        }
    }

    fn load(&self) -> Result<(PipelineConfig, Vec<restload_ingest::Resource>)> {
        let (mut config, resources) = PipelineConfig::load(self.config.as_deref())?;
        self.apply(&mut config);
        config.validate()?;
        Ok((config, resources))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("restload-ingest")
        .filter_directives("hyper=warn,reqwest=warn")
        .build();

    // LOG_* variables take precedence over the flags
    let log_config = match log_config.clone().merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Ignoring invalid logging environment: {e}");
            log_config
        },
    };
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Logging disabled: {e}");
            None
        },
    };

    match execute(cli.command).await {
        Ok(true) => {},
        Ok(false) => process::exit(1),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            process::exit(2);
        },
    }
}

/// `Ok(false)` when the run finished but not successfully
async fn execute(command: Command) -> Result<bool> {
    match command {
        Command::Run {
            overrides,
            summary_json,
        } => {
            let (config, resources) = overrides.load()?;
            let pipeline = Pipeline::from_config(config).await?;

            let cancel = pipeline.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling run");
                    cancel.cancel();
                }
            });

            let summary = pipeline.run(resources).await?;
            println!("{summary}");

            if let Some(path) = summary_json {
                let json = serde_json::to_vec_pretty(&summary)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("writing summary to {}", path.display()))?;
                info!(path = %path.display(), "Summary written");
            }

            Ok(summary.success())
        },
        Command::ShowConfig { overrides } => {
            let (config, resources) = overrides.load()?;
            let file = restload_ingest::config::PipelineFile {
                pipeline: config,
                resources,
            };
            println!("{}", toml::to_string_pretty(&file)?);
            Ok(true)
        },
    }
}
