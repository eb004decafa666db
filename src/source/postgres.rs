//! PostgreSQL source: catalog introspection and `COPY ... TO STDOUT` export.

use async_trait::async_trait;
use futures::{StreamExt, pin_mut};
use snafu::prelude::*;
use std::io::Write;
use std::sync::Arc;
use tracing::debug;

use crate::error::{
    CompressSnafu, ExportSnafu, QuerySnafu, SchemaQuerySnafu, SqlError, SyncError,
    TableNotFoundSnafu,
};
use crate::pg::{ConnectionPool, ConnectionSettings};
use crate::schema::{ColumnInfo, TableSchema};
use crate::warehouse::command::{TableRef, quote_literal};

use super::{SchemaProvider, TableExporter};

const SCHEMA_QUERY: &str = r#"
SELECT a.attnum::int4 AS ordinal,
       a.attname::text AS name,
       format_type(a.atttypid, a.atttypmod) AS col_type,
       pg_get_expr(d.adbin, d.adrelid) AS default_val,
       a.attnotnull AS not_null,
       EXISTS (
           SELECT 1 FROM pg_index i
           WHERE i.indrelid = c.oid AND i.indisprimary AND a.attnum = ANY(i.indkey)
       ) AS primary_key
FROM pg_attribute a
JOIN pg_class c ON c.oid = a.attrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
WHERE n.nspname = $1::text AND c.relname = $2::text
  AND a.attnum > 0 AND NOT a.attisdropped
ORDER BY a.attnum
"#;

/// Map a PostgreSQL type, as printed by `format_type`, to a warehouse type.
pub fn map_type(pg_type: &str) -> String {
    let mapped = match pg_type {
        "text" | "json" | "jsonb" | "bytea" | "xml" => "VARCHAR(MAX)",
        "uuid" => "CHAR(36)",
        "numeric" => "NUMERIC(38,8)",
        t if t.ends_with("[]") => "VARCHAR(MAX)",
        t if t.starts_with("time") && !t.starts_with("timestamp") => "VARCHAR(64)",
        t => t,
    };
    mapped.to_string()
}

/// Sequence defaults reference objects that do not exist in the warehouse.
fn map_default(default_val: Option<String>) -> Option<String> {
    default_val.filter(|d| !d.starts_with("nextval("))
}

/// The export statement for one table.
pub fn export_statement(namespace: &str, table: &str, delimiter: char) -> String {
    format!(
        "COPY {} TO STDOUT WITH (FORMAT csv, DELIMITER {}, HEADER false)",
        TableRef::qualified(namespace, table),
        quote_literal(&delimiter.to_string())
    )
}

/// The source database, reached through a connection pool.
#[derive(Debug, Clone)]
pub struct PgSource {
    pool: Arc<ConnectionPool>,
}

impl PgSource {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub async fn connect(settings: ConnectionSettings) -> Result<Self, SqlError> {
        Ok(Self::new(ConnectionPool::connect(settings).await?))
    }
}

#[async_trait]
impl SchemaProvider for PgSource {
    async fn schema(&self, table: &str, namespace: &str) -> Result<TableSchema, SyncError> {
        let rows = async {
            let client = self.pool.get().await?;
            client
                .query(SCHEMA_QUERY, &[&namespace, &table])
                .await
                .context(QuerySnafu)
        }
        .await
        .context(SchemaQuerySnafu { table })?;

        ensure!(!rows.is_empty(), TableNotFoundSnafu { table, namespace });

        let schema: TableSchema = rows
            .iter()
            .map(|row| {
                let mut column = ColumnInfo::new(
                    row.get("ordinal"),
                    row.get::<_, String>("name"),
                    map_type(row.get("col_type")),
                );
                column.default_val = map_default(row.get("default_val"));
                column.not_null = row.get("not_null");
                column.primary_key = row.get("primary_key");
                column
            })
            .collect();

        debug!(table = %table, namespace = %namespace, columns = schema.len(), "Introspected table");
        Ok(schema)
    }
}

#[async_trait]
impl TableExporter for PgSource {
    async fn export(
        &self,
        table: &str,
        namespace: &str,
        delimiter: char,
        out: &mut (dyn Write + Send),
    ) -> Result<u64, SyncError> {
        let client = self
            .pool
            .get()
            .await
            .context(ExportSnafu { table })?;
        let sql = export_statement(namespace, table, delimiter);
        debug!(statement = %sql, "Exporting");
        let stream = client
            .copy_out(sql.as_str())
            .await
            .context(QuerySnafu)
            .context(ExportSnafu { table })?;
        pin_mut!(stream);

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context(QuerySnafu).context(ExportSnafu { table })?;
            out.write_all(&chunk).context(CompressSnafu { table })?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }
}
