//! One replication cycle.
//!
//! A cycle runs up to two phases, each optional:
//! - **dump**: export every source table to the stage
//! - **refresh**: introspect the source schemas and reload every destination
//!   table from its staged file
//!
//! Connection failures abort the cycle before any table work starts. Within a
//! phase, table failures are aggregated and reported when the phase ends.

use snafu::prelude::*;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::error::{
    ConfigSnafu, ConnectionSnafu, DumpSnafu, PipelineError, RefreshSnafu, SetupSnafu,
};
use crate::refresh::Refresher;
use crate::source::{self, DumpSettings, PgSource};
use crate::storage::stage_path;
use crate::warehouse::PgWarehouse;

/// Storage option that carries the stage region to the S3 client.
const REGION_OPTION: &str = "aws_region";

/// What a cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub tables: usize,
    pub dumped: bool,
    pub refreshed: bool,
}

/// Human-readable description of what a cycle would do.
pub fn plan(config: &Config) -> Vec<String> {
    let mut lines = vec![
        format!(
            "Source: {}:{}/{} (namespace {})",
            config.source.host, config.source.port, config.source.database, config.source.namespace
        ),
        format!(
            "Destination: {}:{}/{} (namespace {})",
            config.destination.host,
            config.destination.port,
            config.destination.database,
            config.destination.namespace
        ),
        format!(
            "Phases: dump_source={} refresh_destination={}",
            config.phases.dump_source, config.phases.refresh_destination
        ),
    ];
    for table in &config.tables {
        lines.push(format!(
            "  - {} -> {}",
            table.name,
            stage_path(&config.stage.prefix, &table.name)
        ));
    }
    lines
}

fn dump_settings(config: &Config) -> DumpSettings {
    let mut storage_options = config.stage.storage_options.clone();
    storage_options
        .entry(REGION_OPTION.to_string())
        .or_insert_with(|| config.stage.region.clone());

    DumpSettings {
        stage_prefix: config.stage.prefix.clone(),
        delimiter: config.stage.delimiter,
        storage_options,
        upload: config.stage.upload_options(),
    }
}

/// Run one cycle against real databases.
pub async fn run_pipeline(config: Config) -> Result<PipelineStats, PipelineError> {
    let mut stats = PipelineStats {
        tables: config.tables.len(),
        ..Default::default()
    };
    if !config.phases.dump_source && !config.phases.refresh_destination {
        info!("No phases enabled, nothing to do");
        return Ok(stats);
    }

    let tables = config.table_names();
    let source = PgSource::connect(config.source_connection())
        .await
        .context(ConnectionSnafu { target: "source" })
        .context(SetupSnafu)?;
    let source = Arc::new(source);

    if config.phases.dump_source {
        source::dump_tables(
            source.clone(),
            &tables,
            &config.source.namespace,
            dump_settings(&config),
        )
        .await
        .context(DumpSnafu)?;
        stats.dumped = true;
        info!(tables = tables.len(), "Dump phase complete");
    }

    if config.phases.refresh_destination {
        let settings = config.refresh_settings().context(ConfigSnafu)?;
        let warehouse = PgWarehouse::connect(config.destination_connection())
            .await
            .context(ConnectionSnafu {
                target: "destination",
            })
            .context(SetupSnafu)?;

        let schemas = source::schemas(source, &tables, &config.source.namespace)
            .await
            .context(RefreshSnafu)?;
        let specs = source::table_specs(schemas, &config.tables, &config.source.namespace)
            .await
            .context(RefreshSnafu)?;

        Refresher::new(Arc::new(warehouse), settings)
            .refresh_tables(specs)
            .await
            .context(RefreshSnafu)?;
        stats.refreshed = true;
        info!(tables = tables.len(), "Refresh phase complete");
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
source: { host: pg, user: u, database: app }
destination: { host: rs, user: u, database: dw, namespace: replica }
stage:
  prefix: "s3://bucket/exports/"
  region: eu-west-1
  storage_options:
    aws_endpoint: "http://localhost:4566"
  credentials: { iam_role: "arn:aws:iam::1:role/r" }
tables: [users, orders]
"#;

    #[test]
    fn test_plan_lists_stage_paths() {
        let config = Config::parse(YAML).unwrap();
        let plan = plan(&config);
        assert!(plan.contains(&"  - users -> s3://bucket/exports/users.txt.gz".to_string()));
        assert!(plan.contains(&"  - orders -> s3://bucket/exports/orders.txt.gz".to_string()));
        assert!(plan[1].contains("namespace replica"));
    }

    #[test]
    fn test_dump_settings_carry_region() {
        let config = Config::parse(YAML).unwrap();
        let settings = dump_settings(&config);
        assert_eq!(settings.storage_options["aws_region"], "eu-west-1");
        assert_eq!(settings.storage_options["aws_endpoint"], "http://localhost:4566");
        assert_eq!(settings.upload.max_concurrent_parts, 8);
    }

    #[tokio::test]
    async fn test_no_phases_is_a_no_op() {
        let mut config = Config::parse(YAML).unwrap();
        config.phases.dump_source = false;
        config.phases.refresh_destination = false;

        let stats = run_pipeline(config).await.unwrap();
        assert_eq!(stats.tables, 2);
        assert!(!stats.dumped && !stats.refreshed);
    }
}
