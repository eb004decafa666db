//! Destination refresh: fan tables out to [`TableRefresh`] controllers, then
//! run maintenance and report one combined result.

mod controller;

pub use controller::{RefreshJob, RefreshState, TableRefresh};

use serde::Deserialize;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{info, warn};

use crate::emit;
use crate::error::{NamespaceSetupSnafu, SyncError};
use crate::group::TaskGroup;
use crate::metrics::events::{ActiveRefreshes, MaintenanceCompleted, RequestStatus};
use crate::schema::TableSpec;
use crate::storage::stage_path;
use crate::warehouse::command::{self, TableRef};
use crate::warehouse::{Credentials, Executor};

/// What post-refresh maintenance covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceScope {
    /// `VACUUM FULL` then `ANALYZE` over the whole database.
    #[default]
    Database,
    /// The same, once per refreshed table.
    Tables,
}

/// Location and naming parameters of a refresh cycle.
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    /// Namespace the live tables live in.
    pub namespace: String,
    pub stage_prefix: String,
    pub region: String,
    pub delimiter: char,
    pub staging_table_prefix: String,
    pub credentials: Credentials,
    pub maintenance: MaintenanceScope,
}

/// Refreshes a set of tables in the warehouse.
pub struct Refresher {
    executor: Arc<dyn Executor>,
    settings: Arc<RefreshSettings>,
}

impl Refresher {
    pub fn new(executor: Arc<dyn Executor>, settings: RefreshSettings) -> Self {
        Self {
            executor,
            settings: Arc::new(settings),
        }
    }

    /// Build one job per table, ordered by table name.
    pub fn jobs(&self, tables: HashMap<String, TableSpec>) -> Vec<RefreshJob> {
        let mut jobs: Vec<RefreshJob> = tables
            .into_iter()
            .map(|(table, spec)| RefreshJob {
                stage_path: stage_path(&self.settings.stage_prefix, &table),
                delimiter: self.settings.delimiter,
                table,
                spec,
            })
            .collect();
        jobs.sort_by(|a, b| a.table.cmp(&b.table));
        jobs
    }

    /// Refresh every table concurrently, then run maintenance.
    ///
    /// Only namespace setup failure aborts early. Every table failure and
    /// every maintenance failure end up in the returned error.
    pub async fn refresh_tables(&self, tables: HashMap<String, TableSpec>) -> Result<(), SyncError> {
        let namespace = &self.settings.namespace;
        self.executor
            .exec(&command::create_namespace(namespace))
            .await
            .context(NamespaceSetupSnafu {
                namespace: namespace.clone(),
            })?;

        let jobs = self.jobs(tables);
        info!(tables = jobs.len(), namespace = %namespace, "Refreshing destination tables");

        let group: TaskGroup<SyncError> = TaskGroup::new();
        let active = Arc::new(AtomicUsize::new(0));
        let committed = Arc::new(Mutex::new(Vec::with_capacity(jobs.len())));
        for job in jobs {
            let executor = Arc::clone(&self.executor);
            let settings = Arc::clone(&self.settings);
            let active = Arc::clone(&active);
            let committed = Arc::clone(&committed);
            group.spawn(async move {
                let count = active.fetch_add(1, Ordering::Relaxed) + 1;
                emit!(ActiveRefreshes { count });

                let table = job.table.clone();
                let result = TableRefresh::new(executor, settings, job).run().await;
                if result.is_ok() {
                    committed
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(table);
                }

                let count = active.fetch_sub(1, Ordering::Relaxed) - 1;
                emit!(ActiveRefreshes { count });
                result
            });
        }
        let loaded = group.wait().await;

        let mut refreshed =
            std::mem::take(&mut *committed.lock().unwrap_or_else(PoisonError::into_inner));
        refreshed.sort();
        let maintenance = self.maintain(&refreshed).await;

        let results: TaskGroup<SyncError> = TaskGroup::new();
        if let Err(err) = loaded {
            results.error(err);
        }
        if let Err(err) = maintenance {
            results.error(err);
        }
        results.wait().await
    }

    /// Reclaim space and refresh planner statistics.
    ///
    /// `tables` are the refreshed tables, used by the per-table scope. Every
    /// statement runs even when an earlier one failed; all failures are
    /// reported.
    pub async fn maintain(&self, tables: &[String]) -> Result<(), SyncError> {
        let start = Instant::now();
        let result = self.run_maintenance(tables).await;

        emit!(MaintenanceCompleted {
            status: RequestStatus::from_result(&result),
            duration: start.elapsed(),
        });
        match &result {
            Ok(()) => info!(scope = ?self.settings.maintenance, "Maintenance completed"),
            Err(e) => warn!(scope = ?self.settings.maintenance, "Maintenance failed: {}", e),
        }
        result
    }

    async fn run_maintenance(&self, tables: &[String]) -> Result<(), SyncError> {
        let statements = match self.settings.maintenance {
            MaintenanceScope::Database => vec![command::vacuum(), command::analyze()],
            MaintenanceScope::Tables => tables
                .iter()
                .map(|name| TableRef::qualified(&self.settings.namespace, name))
                .flat_map(|table| [command::vacuum_table(&table), command::analyze_table(&table)])
                .collect(),
        };

        // Each runs on its own: VACUUM cannot run inside a transaction block
        let errors: TaskGroup<SyncError> = TaskGroup::new();
        for stmt in &statements {
            if let Err(source) = self.executor.exec(stmt).await {
                errors.error(SyncError::Maintenance { source });
            }
        }
        errors.wait().await
    }
}
