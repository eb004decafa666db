//! Configuration loading and validation.
//!
//! Configuration comes from a YAML file (with environment variable
//! interpolation) plus command-line overrides, and is passed explicitly into
//! every constructor that needs it.

mod vars;

pub use vars::interpolate;

use serde::Deserialize;
use snafu::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::error::{
    ConfigError, ConflictingCredentialsSnafu, DuplicateTableSnafu, EmptyHostSnafu,
    EmptyStagePrefixSnafu, EnvInterpolationSnafu, InvalidDelimiterSnafu,
    MissingCredentialsSnafu, NoTablesSnafu, ReadFileSnafu, YamlParseSnafu,
};
use crate::pg::ConnectionSettings;
use crate::refresh::{MaintenanceScope, RefreshSettings};
use crate::storage::UploadOptions;
use crate::warehouse::Credentials;

/// Byte size constants (binary/IEC units).
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub stage: StageConfig,
    pub tables: Vec<TableConfig>,
    /// Which phases run (both by default).
    #[serde(default)]
    pub phases: PhaseConfig,
    /// Metrics configuration (optional, enabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Source PostgreSQL database.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub host: String,
    #[serde(default = "default_source_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    /// Namespace the tables are read from (default: "public").
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Destination warehouse.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    pub host: String,
    #[serde(default = "default_destination_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    /// Namespace the live tables are refreshed in (default: "public").
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Prefix for staging table names so they never collide with live tables.
    #[serde(default = "default_staging_table_prefix")]
    pub staging_table_prefix: String,
    /// Scope of post-refresh VACUUM/ANALYZE.
    #[serde(default)]
    pub maintenance: MaintenanceScope,
}

/// Object store location the source is dumped to and the warehouse loads from.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Prefix of staged file paths, e.g. "s3://bucket/exports/".
    /// A table's file is `{prefix}{table}.txt.gz`.
    pub prefix: String,
    /// Region of the stage bucket, passed to the warehouse bulk load.
    pub region: String,
    /// Field delimiter of the staged files (default: '|').
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Storage options for uploads (credentials, endpoint, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    /// Credentials the warehouse uses to read the stage.
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Target size per multipart part in MB (default: 32)
    #[serde(default = "default_part_size_mb")]
    pub part_size_mb: usize,
    /// Minimum file size in MB before using multipart upload (default: 5)
    #[serde(default = "default_min_multipart_size_mb")]
    pub min_multipart_size_mb: usize,
    /// Maximum concurrent parts per multipart upload (default: 8)
    #[serde(default = "default_max_concurrent_parts")]
    pub max_concurrent_parts: usize,
}

impl StageConfig {
    pub fn upload_options(&self) -> UploadOptions {
        UploadOptions {
            part_size: self.part_size_mb * MB,
            min_multipart_size: self.min_multipart_size_mb * MB,
            max_concurrent_parts: self.max_concurrent_parts,
        }
    }
}

/// COPY credentials: an access key pair or an IAM role.
#[derive(Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub iam_role: Option<String>,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("access_key_id", &self.access_key_id)
            .field("iam_role", &self.iam_role)
            .finish_non_exhaustive()
    }
}

impl CredentialsConfig {
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        match (
            &self.access_key_id,
            &self.secret_access_key,
            &self.iam_role,
        ) {
            (Some(_), _, Some(_)) | (_, Some(_), Some(_)) => ConflictingCredentialsSnafu.fail(),
            (None, None, Some(arn)) => Ok(Credentials::IamRole { arn: arn.clone() }),
            (Some(key), Some(secret), None) => Ok(Credentials::AccessKey {
                access_key_id: key.clone(),
                secret_access_key: secret.clone(),
                session_token: self.session_token.clone(),
            }),
            _ => MissingCredentialsSnafu.fail(),
        }
    }
}

/// A table to replicate, optionally with warehouse layout hints.
///
/// In YAML a table is either a bare name or a mapping:
///
/// ```yaml
/// tables:
///   - users
///   - name: events
///     dist_key: user_id
///     sort_keys: [created_at]
///     data_date_column: created_at
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "TableEntry")]
pub struct TableConfig {
    pub name: String,
    pub data_date_column: Option<String>,
    pub dist_key: Option<String>,
    pub sort_keys: Vec<String>,
}

impl TableConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_date_column: None,
            dist_key: None,
            sort_keys: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TableEntry {
    Name(String),
    Detailed(DetailedTable),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DetailedTable {
    name: String,
    #[serde(default)]
    data_date_column: Option<String>,
    #[serde(default)]
    dist_key: Option<String>,
    #[serde(default)]
    sort_keys: Vec<String>,
}

impl From<TableEntry> for TableConfig {
    fn from(entry: TableEntry) -> Self {
        match entry {
            TableEntry::Name(name) => TableConfig::named(name),
            TableEntry::Detailed(t) => TableConfig {
                name: t.name,
                data_date_column: t.data_date_column,
                dist_key: t.dist_key,
                sort_keys: t.sort_keys,
            },
        }
    }
}

/// Which phases of a cycle run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseConfig {
    /// Dump source tables to the stage (default: true).
    #[serde(default = "default_true")]
    pub dump_source: bool,
    /// Refresh destination tables from the stage (default: true).
    #[serde(default = "default_true")]
    pub refresh_destination: bool,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            dump_source: true,
            refresh_destination: true,
        }
    }
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Replaces the table list. Hints for tables that stay listed are kept.
    pub tables: Vec<String>,
    pub namespace: Option<String>,
    pub delimiter: Option<char>,
    pub stage_prefix: Option<String>,
    pub dump_source: Option<bool>,
    pub refresh_destination: Option<bool>,
}

fn default_true() -> bool {
    true
}

fn default_source_port() -> u16 {
    5432
}

fn default_destination_port() -> u16 {
    5439
}

fn default_namespace() -> String {
    "public".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_staging_table_prefix() -> String {
    "tmp_refresh_table_".to_string()
}

fn default_delimiter() -> char {
    '|'
}

fn default_part_size_mb() -> usize {
    32
}

fn default_min_multipart_size_mb() -> usize {
    5
}

fn default_max_concurrent_parts() -> usize {
    8
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load configuration from a YAML file, apply overrides and validate.
    pub fn load(path: impl AsRef<Path>, overrides: Overrides) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        let content = interpolate(&content).map_err(|errors| {
            EnvInterpolationSnafu {
                message: errors.join("\n"),
            }
            .build()
        })?;

        let mut config = Self::parse(&content)?;
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without interpolation or validation.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).context(YamlParseSnafu)
    }

    /// Apply command-line overrides.
    pub fn apply(&mut self, overrides: Overrides) {
        if !overrides.tables.is_empty() {
            let mut configured: HashMap<String, TableConfig> = self
                .tables
                .drain(..)
                .map(|t| (t.name.clone(), t))
                .collect();
            self.tables = overrides
                .tables
                .into_iter()
                .map(|name| {
                    configured
                        .remove(&name)
                        .unwrap_or_else(|| TableConfig::named(name))
                })
                .collect();
        }
        if let Some(namespace) = overrides.namespace {
            self.destination.namespace = namespace;
        }
        if let Some(delimiter) = overrides.delimiter {
            self.stage.delimiter = delimiter;
        }
        if let Some(prefix) = overrides.stage_prefix {
            self.stage.prefix = prefix;
        }
        if let Some(dump) = overrides.dump_source {
            self.phases.dump_source = dump;
        }
        if let Some(refresh) = overrides.refresh_destination {
            self.phases.refresh_destination = refresh;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.tables.is_empty(), NoTablesSnafu);

        let mut seen = HashSet::new();
        for table in &self.tables {
            ensure!(
                seen.insert(table.name.as_str()),
                DuplicateTableSnafu {
                    table: table.name.clone()
                }
            );
        }

        ensure!(!self.source.host.is_empty(), EmptyHostSnafu { target: "Source" });
        ensure!(
            !self.destination.host.is_empty(),
            EmptyHostSnafu {
                target: "Destination"
            }
        );
        ensure!(!self.stage.prefix.is_empty(), EmptyStagePrefixSnafu);

        let delimiter = self.stage.delimiter;
        ensure!(
            delimiter.is_ascii() && !matches!(delimiter, '\'' | '"' | '\n' | '\r' | '\0'),
            InvalidDelimiterSnafu { delimiter }
        );

        if self.phases.refresh_destination {
            self.stage.credentials.credentials()?;
        }
        Ok(())
    }

    /// Names of the configured tables, in configuration order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    pub fn source_connection(&self) -> ConnectionSettings {
        ConnectionSettings {
            host: self.source.host.clone(),
            port: self.source.port,
            user: self.source.user.clone(),
            password: self.source.password.clone(),
            database: self.source.database.clone(),
            connect_timeout: Duration::from_secs(self.source.connect_timeout_secs),
        }
    }

    pub fn destination_connection(&self) -> ConnectionSettings {
        ConnectionSettings {
            host: self.destination.host.clone(),
            port: self.destination.port,
            user: self.destination.user.clone(),
            password: self.destination.password.clone(),
            database: self.destination.database.clone(),
            connect_timeout: Duration::from_secs(self.destination.connect_timeout_secs),
        }
    }

    /// Settings for the destination refresh phase.
    pub fn refresh_settings(&self) -> Result<RefreshSettings, ConfigError> {
        Ok(RefreshSettings {
            namespace: self.destination.namespace.clone(),
            stage_prefix: self.stage.prefix.clone(),
            region: self.stage.region.clone(),
            delimiter: self.stage.delimiter,
            staging_table_prefix: self.destination.staging_table_prefix.clone(),
            credentials: self.stage.credentials.credentials()?,
            maintenance: self.destination.maintenance,
        })
    }
}
