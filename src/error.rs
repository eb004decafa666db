//! Error types for pgshift using snafu.
//!
//! Per-table failures inside a replication cycle are [`SyncError`]s. They are
//! recorded into a [`TaskGroup`](crate::group::TaskGroup) and collapsed into a
//! single value, so `SyncError` carries its own aggregate variant.

use snafu::prelude::*;

use crate::group::{Aggregate, MultiError};

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// No tables selected for replication.
    #[snafu(display("At least one table must be configured"))]
    NoTables,

    /// The same table was listed twice.
    #[snafu(display("Table '{table}' is listed more than once"))]
    DuplicateTable { table: String },

    /// Stage prefix is empty.
    #[snafu(display("Stage prefix cannot be empty"))]
    EmptyStagePrefix,

    /// Database host is empty.
    #[snafu(display("{target} host cannot be empty"))]
    EmptyHost { target: String },

    /// Delimiter cannot be used in a delimited export.
    #[snafu(display("Invalid field delimiter {delimiter:?}"))]
    InvalidDelimiter { delimiter: char },

    /// Neither an access key pair nor an IAM role was configured.
    #[snafu(display(
        "Stage credentials require either access_key_id and secret_access_key, or iam_role"
    ))]
    MissingCredentials,

    /// Both an access key pair and an IAM role were configured.
    #[snafu(display("Stage credentials cannot combine an access key with iam_role"))]
    ConflictingCredentials,

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder: {source}"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ SQL Errors ============

/// Errors returned by a SQL executor.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SqlError {
    /// Could not open a database connection.
    #[snafu(display("connection failed: {source}"))]
    Connect { source: tokio_postgres::Error },

    /// A statement failed on the server or the connection dropped mid-statement.
    #[snafu(display("{source}"))]
    Query { source: tokio_postgres::Error },

    /// Raised by executors that are not backed by a server connection.
    #[snafu(display("{message}"))]
    Rejected { message: String },
}

// ============ Sync Errors ============

/// Failures of a replication cycle, per table or cycle-wide.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SyncError {
    /// Could not connect to the source or destination database.
    #[snafu(display("Failed to connect to {target} database: {source}"))]
    Connection { target: String, source: SqlError },

    /// Schema introspection failed.
    #[snafu(display("Schema query for table {table} failed: {source}"))]
    SchemaQuery { table: String, source: SqlError },

    /// Introspection returned no columns.
    #[snafu(display("Table {namespace}.{table} not found in source database"))]
    TableNotFound { table: String, namespace: String },

    /// Two columns share an ordinal.
    #[snafu(display("Table {table} has duplicate column ordinal {ordinal}"))]
    DuplicateOrdinal { table: String, ordinal: i32 },

    /// A layout hint names a column the table does not have.
    #[snafu(display("Table {table} has no column named {column}"))]
    UnknownColumn { table: String, column: String },

    /// Exporting rows from the source failed.
    #[snafu(display("Export of table {table} failed: {source}"))]
    Export { table: String, source: SqlError },

    /// Compressing exported rows failed.
    #[snafu(display("Compression of table {table} failed: {source}"))]
    Compress {
        table: String,
        source: std::io::Error,
    },

    /// Uploading the staged file failed.
    #[snafu(display("Upload of table {table} to {path} failed: {source}"))]
    Upload {
        table: String,
        path: String,
        source: StorageError,
    },

    /// The target namespace could not be prepared before fan-out.
    #[snafu(display("Failed to prepare namespace {namespace}: {source}"))]
    NamespaceSetup { namespace: String, source: SqlError },

    /// Dropping or creating the staging table failed.
    #[snafu(display("Staging table for {table} could not be created: {source}"))]
    StagingCreate { table: String, source: SqlError },

    /// The bulk load into the staging table failed.
    #[snafu(display("Bulk load of table {table} failed: {source}"))]
    BulkLoad { table: String, source: SqlError },

    /// The swap transaction failed; the live table is untouched.
    #[snafu(display("Swap of table {table} failed: {source}"))]
    Commit { table: String, source: SqlError },

    /// Dropping the staging table after a failure failed.
    #[snafu(display("Cleanup of staging table for {table} failed: {source}"))]
    Cleanup { table: String, source: SqlError },

    /// Post-refresh maintenance failed.
    #[snafu(display("Maintenance failed: {source}"))]
    Maintenance { source: SqlError },

    /// A per-table task panicked or was aborted.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Two or more of the above.
    #[snafu(display("{errors}"))]
    Multiple { errors: MultiError<SyncError> },
}

impl SyncError {
    /// The table this error belongs to, if it is table-scoped.
    pub fn table(&self) -> Option<&str> {
        match self {
            SyncError::SchemaQuery { table, .. }
            | SyncError::TableNotFound { table, .. }
            | SyncError::DuplicateOrdinal { table, .. }
            | SyncError::UnknownColumn { table, .. }
            | SyncError::Export { table, .. }
            | SyncError::Compress { table, .. }
            | SyncError::Upload { table, .. }
            | SyncError::StagingCreate { table, .. }
            | SyncError::BulkLoad { table, .. }
            | SyncError::Commit { table, .. }
            | SyncError::Cleanup { table, .. } => Some(table),
            _ => None,
        }
    }
}

impl Aggregate for SyncError {
    fn from_multi(errors: MultiError<Self>) -> Self {
        SyncError::Multiple { errors }
    }

    fn into_multi(self) -> Result<MultiError<Self>, Self> {
        match self {
            SyncError::Multiple { errors } => Ok(errors),
            other => Err(other),
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(source: tokio::task::JoinError) -> Self {
        SyncError::TaskJoin { source }
    }
}

// ============ Pipeline Error (top-level) ============

/// Top-level errors reported by the CLI.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Address parsing error.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    /// Source dump phase failed.
    #[snafu(display("Source dump failed: {source}"))]
    Dump { source: SyncError },

    /// Destination refresh phase failed.
    #[snafu(display("Destination refresh failed: {source}"))]
    Refresh { source: SyncError },

    /// Setup before either phase failed.
    #[snafu(display("Setup failed: {source}"))]
    Setup { source: SyncError },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(message: &str) -> SqlError {
        SqlError::Rejected {
            message: message.to_string(),
        }
    }

    #[test]
    fn test_multiple_display_joins_members() {
        let err = SyncError::from_multi(MultiError::new(vec![
            SyncError::BulkLoad {
                table: "b".to_string(),
                source: rejected("no such file"),
            },
            SyncError::Maintenance {
                source: rejected("vacuum refused"),
            },
        ]));
        assert_eq!(
            err.to_string(),
            "multiple errors: Bulk load of table b failed: no such file | Maintenance failed: vacuum refused"
        );
    }

    #[test]
    fn test_table_scope() {
        let err = SyncError::Commit {
            table: "users".to_string(),
            source: rejected("rename failed"),
        };
        assert_eq!(err.table(), Some("users"));

        let err = SyncError::Maintenance {
            source: rejected("x"),
        };
        assert_eq!(err.table(), None);
    }
}
