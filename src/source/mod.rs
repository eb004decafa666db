//! The source side: schema introspection and the dump phase.
//!
//! Both fan out one task per table through a [`TaskGroup`], so one table's
//! failure is reported alongside the others instead of stopping them.

mod postgres;

pub use postgres::{PgSource, export_statement, map_type};

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use snafu::prelude::*;
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info};

use crate::config::TableConfig;
use crate::emit;
use crate::error::{CompressSnafu, SyncError, UnknownColumnSnafu, UploadSnafu};
use crate::group::TaskGroup;
use crate::metrics::events::{TableDumpDuration, TableDumped};
use crate::schema::{TableMeta, TableSchema, TableSpec};
use crate::storage::{UploadOptions, stage_path, write_object};

/// Reads column metadata for a table.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn schema(&self, table: &str, namespace: &str) -> Result<TableSchema, SyncError>;
}

/// Streams a table's rows as delimited text.
#[async_trait]
pub trait TableExporter: Send + Sync {
    /// Write every row of `namespace.table` to `out`, returning the number of
    /// bytes written.
    async fn export(
        &self,
        table: &str,
        namespace: &str,
        delimiter: char,
        out: &mut (dyn Write + Send),
    ) -> Result<u64, SyncError>;
}

/// Fetch the schemas of `tables` concurrently.
pub async fn schemas(
    provider: Arc<dyn SchemaProvider>,
    tables: &[String],
    namespace: &str,
) -> Result<HashMap<String, TableSchema>, SyncError> {
    let found = Arc::new(Mutex::new(HashMap::with_capacity(tables.len())));
    let group: TaskGroup<SyncError> = TaskGroup::new();

    for table in tables {
        let provider = Arc::clone(&provider);
        let found = Arc::clone(&found);
        let table = table.clone();
        let namespace = namespace.to_string();
        group.spawn(async move {
            let schema = provider.schema(&table, &namespace).await?;
            debug!(table = %table, columns = schema.len(), "Fetched schema");
            found
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(table, schema);
            Ok(())
        });
    }
    group.wait().await?;

    let mut found = found.lock().unwrap_or_else(PoisonError::into_inner);
    Ok(std::mem::take(&mut *found))
}

/// Combine fetched schemas with the configured layout hints.
///
/// A hint naming a column the table does not have fails that table. Every
/// such failure is reported.
pub async fn table_specs(
    mut schemas: HashMap<String, TableSchema>,
    tables: &[TableConfig],
    namespace: &str,
) -> Result<HashMap<String, TableSpec>, SyncError> {
    let errors: TaskGroup<SyncError> = TaskGroup::new();
    let mut specs = HashMap::with_capacity(tables.len());

    for config in tables {
        let Some(schema) = schemas.remove(&config.name) else {
            continue;
        };
        match apply_hints(schema, config) {
            Ok(schema) => {
                let spec = TableSpec::new(&config.name, namespace, schema).with_meta(TableMeta {
                    data_date_column: config.data_date_column.clone(),
                });
                specs.insert(config.name.clone(), spec);
            }
            Err(err) => errors.error(err),
        }
    }

    errors.wait().await?;
    Ok(specs)
}

fn apply_hints(mut schema: TableSchema, config: &TableConfig) -> Result<TableSchema, SyncError> {
    let unknown = |column: &str| {
        UnknownColumnSnafu {
            table: config.name.clone(),
            column: column.to_string(),
        }
        .build()
    };

    if let Some(column) = &config.dist_key {
        schema.column_mut(column).ok_or_else(|| unknown(column))?.dist_key = true;
    }
    for column in &config.sort_keys {
        schema.column_mut(column).ok_or_else(|| unknown(column))?.sort_key = true;
    }
    if let Some(column) = &config.data_date_column {
        ensure!(schema.contains(column), UnknownColumnSnafu {
            table: config.name.clone(),
            column: column.clone(),
        });
    }
    Ok(schema)
}

/// Where and how the dump phase writes staged files.
#[derive(Debug, Clone)]
pub struct DumpSettings {
    pub stage_prefix: String,
    pub delimiter: char,
    pub storage_options: HashMap<String, String>,
    pub upload: UploadOptions,
}

/// Export every table to the stage concurrently.
pub async fn dump_tables(
    exporter: Arc<dyn TableExporter>,
    tables: &[String],
    namespace: &str,
    settings: DumpSettings,
) -> Result<(), SyncError> {
    info!(tables = tables.len(), prefix = %settings.stage_prefix, "Dumping source tables");
    let settings = Arc::new(settings);
    let group: TaskGroup<SyncError> = TaskGroup::new();

    for table in tables {
        let exporter = Arc::clone(&exporter);
        let settings = Arc::clone(&settings);
        let table = table.clone();
        let namespace = namespace.to_string();
        group.spawn(async move { dump_table(exporter.as_ref(), &table, &namespace, &settings).await });
    }

    group.wait().await
}

/// Export one table, gzip it and upload it to its stage path.
pub async fn dump_table(
    exporter: &dyn TableExporter,
    table: &str,
    namespace: &str,
    settings: &DumpSettings,
) -> Result<(), SyncError> {
    let start = Instant::now();
    let path = stage_path(&settings.stage_prefix, table);

    let result = async {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let bytes = exporter
            .export(table, namespace, settings.delimiter, &mut encoder)
            .await?;
        let compressed = encoder.finish().context(CompressSnafu { table })?;
        let compressed_len = compressed.len();

        write_object(
            &path,
            Bytes::from(compressed),
            settings.storage_options.clone(),
            &settings.upload,
        )
        .await
        .context(UploadSnafu {
            table,
            path: path.clone(),
        })?;

        info!(
            table = %table,
            path = %path,
            bytes,
            compressed_bytes = compressed_len,
            "Dumped table"
        );
        emit!(TableDumped { bytes });
        Ok::<(), SyncError>(())
    }
    .await;

    emit!(TableDumpDuration {
        duration: start.elapsed(),
    });
    result
}
