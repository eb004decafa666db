//! Per-table refresh state machine.
//!
//! ```text
//! Start -> StagingCreated -> Loaded -> Committed
//!   \            \              \
//!    +------------+--------------+--> Failed
//! ```
//!
//! The live table is only touched by the final transition, which drops it and
//! renames the staging table into its place inside one transaction. Readers see
//! either the old rows or the new rows, never a mix.

use snafu::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::emit;
use crate::error::{
    BulkLoadSnafu, CommitSnafu, DuplicateOrdinalSnafu, StagingCreateSnafu, SyncError,
};
use crate::group::{Aggregate, MultiError};
use crate::metrics::events::{
    RefreshStage, RefreshStageFailed, RefreshStatus, TableRefreshDuration, TableRefreshed,
};
use crate::schema::TableSpec;
use crate::warehouse::Executor;
use crate::warehouse::command::{self, CopySource, TableRef};

use super::RefreshSettings;

/// One table's unit of work for a cycle.
#[derive(Debug, Clone)]
pub struct RefreshJob {
    pub table: String,
    pub spec: TableSpec,
    /// Location of the staged file to load.
    pub stage_path: String,
    pub delimiter: char,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Start,
    StagingCreated,
    Loaded,
    Committed,
    Failed,
}

impl RefreshState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RefreshState::Committed | RefreshState::Failed)
    }
}

/// Drives one [`RefreshJob`] to a terminal state.
pub struct TableRefresh {
    executor: Arc<dyn Executor>,
    settings: Arc<RefreshSettings>,
    job: RefreshJob,
    live: TableRef,
    staging: TableRef,
    state: RefreshState,
}

impl TableRefresh {
    pub fn new(executor: Arc<dyn Executor>, settings: Arc<RefreshSettings>, job: RefreshJob) -> Self {
        let live = TableRef::qualified(&settings.namespace, &job.table);
        let staging = TableRef::qualified(
            &settings.namespace,
            format!("{}{}", settings.staging_table_prefix, job.table),
        );
        Self {
            executor,
            settings,
            job,
            live,
            staging,
            state: RefreshState::Start,
        }
    }

    pub fn state(&self) -> RefreshState {
        self.state
    }

    /// Run until a terminal state is reached.
    ///
    /// On failure the staging table is dropped on a best-effort basis. If that
    /// drop fails too, both errors are returned as one aggregate with the
    /// triggering error first.
    pub async fn run(&mut self) -> Result<(), SyncError> {
        let start = Instant::now();
        info!(table = %self.job.table, path = %self.job.stage_path, "Refreshing table");

        let result = match self.job.spec.schema.duplicate_ordinal() {
            Some(ordinal) => {
                self.state = RefreshState::Failed;
                DuplicateOrdinalSnafu {
                    table: self.job.table.clone(),
                    ordinal,
                }
                .fail()
            }
            None => self.advance_to_end().await,
        };

        emit!(TableRefreshDuration {
            duration: start.elapsed(),
        });
        match &result {
            Ok(()) => {
                emit!(TableRefreshed {
                    status: RefreshStatus::Success
                });
                info!(table = %self.job.table, elapsed_ms = start.elapsed().as_millis() as u64, "Table refreshed");
            }
            Err(_) => emit!(TableRefreshed {
                status: RefreshStatus::Failed
            }),
        }
        result
    }

    async fn advance_to_end(&mut self) -> Result<(), SyncError> {
        while !self.state.is_terminal() {
            if let Err(cause) = self.advance().await {
                return Err(self.fail(cause).await);
            }
        }
        Ok(())
    }

    /// Perform the transition out of the current state.
    async fn advance(&mut self) -> Result<(), SyncError> {
        let next = match self.state {
            RefreshState::Start => {
                self.create_staging().await?;
                RefreshState::StagingCreated
            }
            RefreshState::StagingCreated => {
                self.load().await?;
                RefreshState::Loaded
            }
            RefreshState::Loaded => {
                self.commit().await?;
                RefreshState::Committed
            }
            RefreshState::Committed | RefreshState::Failed => return Ok(()),
        };
        debug!(table = %self.job.table, from = ?self.state, to = ?next, "Refresh transition");
        self.state = next;
        Ok(())
    }

    async fn create_staging(&self) -> Result<(), SyncError> {
        for stmt in [
            command::drop_table_if_exists(&self.staging),
            command::create_table(&self.staging, &self.job.spec.schema),
        ] {
            self.executor
                .exec(&stmt)
                .await
                .inspect_err(|_| {
                    emit!(RefreshStageFailed {
                        stage: RefreshStage::StagingCreate
                    })
                })
                .context(StagingCreateSnafu {
                    table: self.job.table.clone(),
                })?;
        }
        Ok(())
    }

    async fn load(&self) -> Result<(), SyncError> {
        let stmt = command::copy_from_stage(
            &self.staging,
            &self.job.spec.schema,
            &CopySource {
                path: &self.job.stage_path,
                region: &self.settings.region,
                delimiter: self.job.delimiter,
                credentials: &self.settings.credentials,
            },
        );
        self.executor
            .exec(&stmt)
            .await
            .inspect_err(|_| {
                emit!(RefreshStageFailed {
                    stage: RefreshStage::BulkLoad
                })
            })
            .context(BulkLoadSnafu {
                table: self.job.table.clone(),
            })
    }

    async fn commit(&self) -> Result<(), SyncError> {
        let table = self.job.table.clone();
        let result = async {
            let mut tx = self.executor.begin().await?;
            for stmt in command::swap(&self.live, &self.staging) {
                if let Err(err) = tx.exec(&stmt).await {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(table = %self.job.table, "Rollback failed: {}", rollback_err);
                    }
                    return Err(err);
                }
            }
            tx.commit().await
        }
        .await;

        result
            .inspect_err(|_| {
                emit!(RefreshStageFailed {
                    stage: RefreshStage::Commit
                })
            })
            .context(CommitSnafu { table })
    }

    async fn fail(&mut self, cause: SyncError) -> SyncError {
        self.state = RefreshState::Failed;
        warn!(table = %self.job.table, error = %cause, "Refresh failed, dropping staging table");

        match self
            .executor
            .exec(&command::drop_table_if_exists(&self.staging))
            .await
        {
            Ok(()) => cause,
            Err(source) => {
                emit!(RefreshStageFailed {
                    stage: RefreshStage::Cleanup
                });
                let cleanup = SyncError::Cleanup {
                    table: self.job.table.clone(),
                    source,
                };
                SyncError::from_multi(MultiError::new(vec![cause, cleanup]))
            }
        }
    }
}
