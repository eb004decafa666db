//! Statement rendering for the warehouse.
//!
//! Pure functions: nothing here performs I/O. Identifiers come from schema
//! metadata pgshift controls, so column names are rendered verbatim while
//! qualified table references are double-quoted.

use std::fmt;

use crate::schema::{ColumnInfo, TableSchema};

use super::{Credentials, Statement};

/// Parsing options of every bulk load.
pub const COPY_OPTIONS: &str = "IGNOREHEADER 0 ACCEPTINVCHARS TRUNCATECOLUMNS TRIMBLANKS \
     BLANKSASNULL EMPTYASNULL DATEFORMAT 'auto' ACCEPTANYDATE STATUPDATE ON COMPUPDATE ON";

/// Double-quote an identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quote a string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// A table reference, bare (`staging`) or qualified (`"ns"."staging"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    namespace: Option<String>,
    name: String,
}

impl TableRef {
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn qualified(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}.{}", quote_ident(ns), quote_ident(&self.name)),
            None => f.write_str(&self.name),
        }
    }
}

/// Render one column definition.
///
/// Clauses follow a fixed order: default, distribution key, sort key,
/// not-null, primary key. Primary key columns are always sort keys.
pub fn column_definition(column: &ColumnInfo) -> String {
    let mut def = format!("{} {}", column.name, column.col_type);
    if let Some(default) = &column.default_val {
        def.push_str(" DEFAULT ");
        def.push_str(default);
    }
    if column.dist_key {
        def.push_str(" DISTKEY");
    }
    if column.sort_key || column.primary_key {
        def.push_str(" SORTKEY");
    }
    if column.not_null {
        def.push_str(" NOT NULL");
    }
    if column.primary_key {
        def.push_str(" PRIMARY KEY");
    }
    def
}

pub fn create_table(table: &TableRef, schema: &TableSchema) -> Statement {
    let columns: Vec<String> = schema.ordered().into_iter().map(column_definition).collect();
    Statement::new(format!("CREATE TABLE {} ({})", table, columns.join(", ")))
}

pub fn drop_table_if_exists(table: &TableRef) -> Statement {
    Statement::new(format!("DROP TABLE IF EXISTS {table}"))
}

pub fn create_namespace(namespace: &str) -> Statement {
    Statement::new(format!(
        "CREATE SCHEMA IF NOT EXISTS {}",
        quote_ident(namespace)
    ))
}

/// Where a bulk load reads from and how.
#[derive(Debug, Clone)]
pub struct CopySource<'a> {
    pub path: &'a str,
    pub region: &'a str,
    pub delimiter: char,
    pub credentials: &'a Credentials,
}

/// Render a bulk load of a gzip-compressed delimited file into `table`.
///
/// The column list follows ordinal order, matching [`create_table`].
pub fn copy_from_stage(table: &TableRef, schema: &TableSchema, source: &CopySource<'_>) -> Statement {
    let sql = format!(
        "COPY {} ({}) FROM {} WITH REGION {} GZIP CSV DELIMITER {} {}",
        table,
        schema.column_names().join(", "),
        quote_literal(source.path),
        quote_literal(source.region),
        quote_literal(&source.delimiter.to_string()),
        COPY_OPTIONS,
    );
    Statement::with_secret(sql, source.credentials.clause())
}

/// Render the statements that replace `live` with `staging`. Both must run
/// inside one transaction.
pub fn swap(live: &TableRef, staging: &TableRef) -> [Statement; 2] {
    [
        drop_table_if_exists(live),
        Statement::new(format!(
            "ALTER TABLE {} RENAME TO {}",
            staging,
            quote_ident(live.name())
        )),
    ]
}

pub fn vacuum() -> Statement {
    Statement::new("VACUUM FULL")
}

pub fn analyze() -> Statement {
    Statement::new("ANALYZE")
}

pub fn vacuum_table(table: &TableRef) -> Statement {
    Statement::new(format!("VACUUM FULL {table}"))
}

pub fn analyze_table(table: &TableRef) -> Statement {
    Statement::new(format!("ANALYZE {table}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal_schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnInfo::new(2, "val", "text"),
            ColumnInfo::new(1, "id", "int").primary_key(),
        ])
    }

    #[test]
    fn test_column_clause_order() {
        let column = ColumnInfo::new(1, "field", "type")
            .with_default("defaultval")
            .not_null()
            .primary_key();
        assert_eq!(
            column_definition(&column),
            "field type DEFAULT defaultval SORTKEY NOT NULL PRIMARY KEY"
        );

        let column = ColumnInfo::new(1, "user_id", "bigint").dist_key().sort_key();
        assert_eq!(column_definition(&column), "user_id bigint DISTKEY SORTKEY");

        let column = ColumnInfo::new(1, "plain", "int");
        assert_eq!(column_definition(&column), "plain int");
    }

    #[test]
    fn test_primary_key_implies_sort_key() {
        let column = ColumnInfo::new(1, "id", "int").primary_key();
        assert_eq!(column_definition(&column), "id int SORTKEY PRIMARY KEY");

        // An explicit sort key flag does not render the marker twice
        let column = ColumnInfo::new(1, "id", "int").primary_key().sort_key();
        assert_eq!(column_definition(&column), "id int SORTKEY PRIMARY KEY");
    }

    #[test]
    fn test_create_table_literal() {
        let stmt = create_table(&TableRef::bare("staging"), &literal_schema());
        assert_eq!(
            stmt.to_string(),
            "CREATE TABLE staging (id int SORTKEY PRIMARY KEY, val text)"
        );
    }

    #[test]
    fn test_create_table_sorts_by_ordinal() {
        let schema = TableSchema::new(vec![
            ColumnInfo::new(3, "field3", "type3").with_default("defaultval3"),
            ColumnInfo::new(1, "field1", "type1").not_null(),
            ColumnInfo::new(2, "field2", "type2").primary_key(),
        ]);
        let stmt = create_table(&TableRef::qualified("public", "t"), &schema);
        assert_eq!(
            stmt.to_string(),
            "CREATE TABLE \"public\".\"t\" (field1 type1 NOT NULL, \
             field2 type2 SORTKEY PRIMARY KEY, field3 type3 DEFAULT defaultval3)"
        );
    }

    #[test]
    fn test_copy_from_stage() {
        let credentials = Credentials::AccessKey {
            access_key_id: "AKIA".to_string(),
            secret_access_key: "s3cr3t".to_string(),
            session_token: None,
        };
        let stmt = copy_from_stage(
            &TableRef::qualified("replica", "tmp_refresh_table_users"),
            &literal_schema(),
            &CopySource {
                path: "s3://bucket/exports/users.txt.gz",
                region: "us-west-2",
                delimiter: '|',
                credentials: &credentials,
            },
        );

        assert_eq!(
            stmt.sql(),
            "COPY \"replica\".\"tmp_refresh_table_users\" (id, val) \
             FROM 's3://bucket/exports/users.txt.gz' WITH REGION 'us-west-2' \
             GZIP CSV DELIMITER '|' IGNOREHEADER 0 ACCEPTINVCHARS TRUNCATECOLUMNS \
             TRIMBLANKS BLANKSASNULL EMPTYASNULL DATEFORMAT 'auto' ACCEPTANYDATE STATUPDATE ON COMPUPDATE ON"
        );
        assert!(stmt.expose().ends_with(
            "COMPUPDATE ON CREDENTIALS 'aws_access_key_id=AKIA;aws_secret_access_key=s3cr3t'"
        ));
        assert!(!stmt.to_string().contains("s3cr3t"));
    }

    #[test]
    fn test_swap_pair() {
        let [drop, rename] = swap(
            &TableRef::qualified("replica", "users"),
            &TableRef::qualified("replica", "tmp_refresh_table_users"),
        );
        assert_eq!(drop.to_string(), "DROP TABLE IF EXISTS \"replica\".\"users\"");
        assert_eq!(
            rename.to_string(),
            "ALTER TABLE \"replica\".\"tmp_refresh_table_users\" RENAME TO \"users\""
        );
    }

    #[test]
    fn test_misc_statements() {
        assert_eq!(
            create_namespace("replica").to_string(),
            "CREATE SCHEMA IF NOT EXISTS \"replica\""
        );
        assert_eq!(vacuum().to_string(), "VACUUM FULL");
        assert_eq!(analyze().to_string(), "ANALYZE");

        let users = TableRef::qualified("replica", "users");
        assert_eq!(vacuum_table(&users).to_string(), "VACUUM FULL \"replica\".\"users\"");
        assert_eq!(analyze_table(&users).to_string(), "ANALYZE \"replica\".\"users\"");
    }

    #[test]
    fn test_quoting_escapes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}
