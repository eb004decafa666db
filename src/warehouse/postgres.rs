//! [`Executor`] over the PostgreSQL wire protocol.
//!
//! Statements go through the simple query protocol: bulk-load statements
//! cannot be prepared by the warehouse.

use async_trait::async_trait;
use snafu::prelude::*;
use std::sync::Arc;
use tracing::debug;

use crate::error::{QuerySnafu, SqlError};
use crate::pg::{ConnectionPool, ConnectionSettings, PooledClient};

use super::{Executor, Statement, Transaction};

/// The warehouse, reached through a connection pool.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: Arc<ConnectionPool>,
}

impl PgWarehouse {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Connect eagerly so unreachable warehouses fail before any work starts.
    pub async fn connect(settings: ConnectionSettings) -> Result<Self, SqlError> {
        Ok(Self::new(ConnectionPool::connect(settings).await?))
    }
}

#[async_trait]
impl Executor for PgWarehouse {
    async fn exec(&self, stmt: &Statement) -> Result<(), SqlError> {
        let client = self.pool.get().await?;
        debug!(statement = %stmt, "Executing");
        client.batch_execute(&stmt.expose()).await.context(QuerySnafu)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, SqlError> {
        let mut client = self.pool.get().await?;
        if let Err(source) = client.batch_execute("BEGIN").await {
            client.discard();
            return Err(SqlError::Query { source });
        }
        Ok(Box::new(PgTransaction { client, open: true }))
    }
}

struct PgTransaction {
    client: PooledClient,
    open: bool,
}

impl PgTransaction {
    async fn finish(mut self: Box<Self>, sql: &str) -> Result<(), SqlError> {
        debug!(statement = sql, "Executing");
        self.client.batch_execute(sql).await.context(QuerySnafu)?;
        self.open = false;
        Ok(())
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn exec(&mut self, stmt: &Statement) -> Result<(), SqlError> {
        debug!(statement = %stmt, "Executing in transaction");
        self.client
            .batch_execute(&stmt.expose())
            .await
            .context(QuerySnafu)
    }

    async fn commit(self: Box<Self>) -> Result<(), SqlError> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), SqlError> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        // A connection with a transaction still open must not be reused
        if self.open {
            self.client.discard();
        }
    }
}
