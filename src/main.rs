//! pgshift: replicate PostgreSQL tables into a Redshift-compatible warehouse
//! through an S3 stage.

use clap::{ArgAction, Parser};
use snafu::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use pgshift::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, PipelineError};
use pgshift::pipeline::plan;
use pgshift::{Config, Overrides, metrics, run_pipeline};

/// PostgreSQL to Redshift table replicator.
#[derive(Parser, Debug)]
#[command(name = "pgshift")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Comma-separated tables to replicate, replacing the configured list.
    #[arg(short, long, value_delimiter = ',')]
    tables: Vec<String>,

    /// Dump source tables to the stage.
    #[arg(long, action = ArgAction::Set)]
    dump_source: Option<bool>,

    /// Refresh destination tables from the stage.
    #[arg(long, action = ArgAction::Set)]
    refresh_destination: Option<bool>,

    /// Destination namespace for the refreshed tables.
    #[arg(long)]
    namespace: Option<String>,

    /// Field delimiter of the staged files.
    #[arg(long)]
    delimiter: Option<char>,

    /// Stage prefix, e.g. "s3://bucket/exports/".
    #[arg(long)]
    stage_prefix: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Dry run - validate configuration and print the plan without connecting.
    #[arg(long)]
    dry_run: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            tables: self
                .tables
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            namespace: self.namespace.clone(),
            delimiter: self.delimiter,
            stage_prefix: self.stage_prefix.clone(),
            dump_source: self.dump_source,
            refresh_destination: self.refresh_destination,
        }
    }
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("pgshift starting");

    let config = Config::load(&args.config, args.overrides()).context(ConfigSnafu)?;

    if args.dry_run {
        info!("Dry run mode - configuration is valid");
        for line in plan(&config) {
            info!("{}", line);
        }
        return Ok(());
    }

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    let stats = run_pipeline(config).await?;

    info!(
        tables = stats.tables,
        dumped = stats.dumped,
        refreshed = stats.refreshed,
        "Replication cycle completed"
    );

    Ok(())
}
