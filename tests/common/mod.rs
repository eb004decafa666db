//! In-memory warehouse double shared by the integration tests.
//!
//! `FakeWarehouse` interprets the handful of statements pgshift renders
//! (namespace creation, drop, create, COPY, rename, maintenance) against a map
//! of table name to rows. Staged files are registered by path. Transactions
//! validate their statements against a private copy and replay them onto the
//! shared state on commit, so other tables' concurrent changes are kept.

#![allow(dead_code)]

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, LazyLock, Mutex};

use pgshift::error::SqlError;
use pgshift::refresh::{MaintenanceScope, RefreshSettings};
use pgshift::schema::{ColumnInfo, TableSchema, TableSpec};
use pgshift::warehouse::{Credentials, Executor, Statement, Transaction};

pub const NAMESPACE: &str = "replica";
pub const STAGE_PREFIX: &str = "s3://bucket/exports/";
pub const SECRET: &str = "s3cr3t-value";

static CREATE_SCHEMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^CREATE SCHEMA IF NOT EXISTS "([^"]+)"$"#).unwrap());
static DROP_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^DROP TABLE IF EXISTS (\S+)$").unwrap());
static CREATE_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^CREATE TABLE (\S+) \(").unwrap());
static COPY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^COPY (\S+) \(.*\) FROM '([^']*)'").unwrap());
static RENAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^ALTER TABLE (\S+) RENAME TO "([^"]+)"$"#).unwrap());

/// Qualified reference as rendered by the command builder.
pub fn qualified(namespace: &str, table: &str) -> String {
    format!("\"{namespace}\".\"{table}\"")
}

pub fn staging_name(table: &str) -> String {
    qualified(NAMESPACE, &format!("tmp_refresh_table_{table}"))
}

pub fn live_name(table: &str) -> String {
    qualified(NAMESPACE, table)
}

pub fn stage_path(table: &str) -> String {
    format!("{STAGE_PREFIX}{table}.txt.gz")
}

pub fn settings() -> RefreshSettings {
    RefreshSettings {
        namespace: NAMESPACE.to_string(),
        stage_prefix: STAGE_PREFIX.to_string(),
        region: "us-west-2".to_string(),
        delimiter: '|',
        staging_table_prefix: "tmp_refresh_table_".to_string(),
        credentials: Credentials::AccessKey {
            access_key_id: "AKIAEXAMPLE".to_string(),
            secret_access_key: SECRET.to_string(),
            session_token: None,
        },
        maintenance: MaintenanceScope::Database,
    }
}

/// `id int PRIMARY KEY, val text`.
pub fn simple_spec(table: &str) -> TableSpec {
    TableSpec::new(
        table,
        "public",
        TableSchema::new(vec![
            ColumnInfo::new(1, "id", "int").primary_key(),
            ColumnInfo::new(2, "val", "text"),
        ]),
    )
}

pub fn specs(tables: &[&str]) -> HashMap<String, TableSpec> {
    tables
        .iter()
        .map(|t| (t.to_string(), simple_spec(t)))
        .collect()
}

#[derive(Debug)]
struct FailRule {
    pattern: String,
    /// Matching statements to let through before failing.
    skip: usize,
}

#[derive(Debug, Default, Clone)]
struct Tables {
    namespaces: BTreeSet<String>,
    rows: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    staged: HashMap<String, Vec<String>>,
    /// Statements as displayed (what would be logged).
    displayed: Vec<String>,
    /// Statements as sent to the server.
    sent: Vec<String>,
    fail_rules: Vec<FailRule>,
}

impl State {
    fn check_failure(&mut self, text: &str) -> Result<(), SqlError> {
        for rule in &mut self.fail_rules {
            if text.contains(&rule.pattern) {
                if rule.skip == 0 {
                    return Err(SqlError::Rejected {
                        message: format!("injected failure on {}", rule.pattern),
                    });
                }
                rule.skip -= 1;
            }
        }
        Ok(())
    }

    fn record(&mut self, stmt: &Statement) -> Result<String, SqlError> {
        let text = stmt.expose();
        self.displayed.push(stmt.to_string());
        self.sent.push(text.clone());
        self.check_failure(&text)?;
        Ok(text)
    }
}

fn rejected(message: String) -> SqlError {
    SqlError::Rejected { message }
}

fn apply(
    tables: &mut Tables,
    staged: &HashMap<String, Vec<String>>,
    text: &str,
) -> Result<(), SqlError> {
    if let Some(caps) = CREATE_SCHEMA.captures(text) {
        tables.namespaces.insert(caps[1].to_string());
    } else if let Some(caps) = DROP_TABLE.captures(text) {
        tables.rows.remove(&caps[1]);
    } else if let Some(caps) = CREATE_TABLE.captures(text) {
        let name = caps[1].to_string();
        if tables.rows.contains_key(&name) {
            return Err(rejected(format!("relation {name} already exists")));
        }
        tables.rows.insert(name, Vec::new());
    } else if let Some(caps) = COPY.captures(text) {
        let file = staged
            .get(&caps[2])
            .ok_or_else(|| rejected(format!("no staged file at {}", &caps[2])))?;
        let target = tables
            .rows
            .get_mut(&caps[1])
            .ok_or_else(|| rejected(format!("relation {} does not exist", &caps[1])))?;
        target.extend(file.iter().cloned());
    } else if let Some(caps) = RENAME.captures(text) {
        let from = caps[1].to_string();
        let namespace_prefix = from
            .rfind("\".\"")
            .map(|i| &from[..i + 2])
            .unwrap_or_default();
        let to = format!("{namespace_prefix}\"{}\"", &caps[2]);
        if tables.rows.contains_key(&to) {
            return Err(rejected(format!("relation {to} already exists")));
        }
        let rows = tables
            .rows
            .remove(&from)
            .ok_or_else(|| rejected(format!("relation {from} does not exist")))?;
        tables.rows.insert(to, rows);
    }
    // VACUUM and ANALYZE change nothing observable
    Ok(())
}

/// Recording in-memory warehouse.
#[derive(Debug, Clone, Default)]
pub struct FakeWarehouse {
    state: Arc<Mutex<State>>,
}

impl FakeWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::new(self.clone())
    }

    /// Register a staged file.
    pub fn stage(&self, path: &str, rows: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .staged
            .insert(path.to_string(), rows.iter().map(|r| r.to_string()).collect());
    }

    /// Create a table directly, bypassing statement handling.
    pub fn seed_table(&self, name: &str, rows: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .tables
            .rows
            .insert(name.to_string(), rows.iter().map(|r| r.to_string()).collect());
    }

    /// Fail every statement containing `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        self.fail_after(pattern, 0);
    }

    /// Let `skip` statements containing `pattern` succeed, then fail the rest.
    pub fn fail_after(&self, pattern: &str, skip: usize) {
        self.state.lock().unwrap().fail_rules.push(FailRule {
            pattern: pattern.to_string(),
            skip,
        });
    }

    pub fn rows(&self, name: &str) -> Option<Vec<String>> {
        self.state.lock().unwrap().tables.rows.get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .tables
            .rows
            .keys()
            .cloned()
            .collect()
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .tables
            .namespaces
            .contains(namespace)
    }

    /// Statements in their logged form.
    pub fn displayed(&self) -> Vec<String> {
        self.state.lock().unwrap().displayed.clone()
    }

    /// Statements as sent, credentials included.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl Executor for FakeWarehouse {
    async fn exec(&self, stmt: &Statement) -> Result<(), SqlError> {
        // Yield so concurrently spawned refreshes interleave
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        let text = state.record(stmt)?;
        let State { tables, staged, .. } = &mut *state;
        apply(tables, staged, &text)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, SqlError> {
        let snapshot = self.state.lock().unwrap().tables.clone();
        Ok(Box::new(FakeTransaction {
            warehouse: self.clone(),
            snapshot,
            pending: Vec::new(),
        }))
    }
}

struct FakeTransaction {
    warehouse: FakeWarehouse,
    snapshot: Tables,
    pending: Vec<String>,
}

#[async_trait]
impl Transaction for FakeTransaction {
    async fn exec(&mut self, stmt: &Statement) -> Result<(), SqlError> {
        let mut state = self.warehouse.state.lock().unwrap();
        let text = state.record(stmt)?;
        apply(&mut self.snapshot, &state.staged, &text)?;
        self.pending.push(text);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), SqlError> {
        let mut state = self.warehouse.state.lock().unwrap();
        state.displayed.push("COMMIT".to_string());
        state.check_failure("COMMIT")?;
        let State { tables, staged, .. } = &mut *state;
        for text in &self.pending {
            apply(tables, staged, text)?;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), SqlError> {
        self.warehouse
            .state
            .lock()
            .unwrap()
            .displayed
            .push("ROLLBACK".to_string());
        Ok(())
    }
}
