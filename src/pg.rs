//! PostgreSQL connections shared by the source and the warehouse.
//!
//! The pool is an idle list: checking out pops an idle client or opens a new
//! one, and dropping a [`PooledClient`] pushes it back. There is no size limit
//! and no eviction.

use snafu::prelude::*;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::error::{ConnectSnafu, SqlError};

/// Where and how to connect.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub connect_timeout: Duration,
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl ConnectionSettings {
    pub fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.database)
            .connect_timeout(self.connect_timeout)
            .application_name("pgshift");
        if !self.password.is_empty() {
            config.password(&self.password);
        }
        config
    }

    /// Open a new connection and drive it on a background task.
    pub async fn connect(&self) -> Result<Client, SqlError> {
        let (client, connection) = self
            .to_pg_config()
            .connect(NoTls)
            .await
            .context(ConnectSnafu)?;

        let host = self.host.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(host = %host, "Connection closed with error: {}", e);
            }
        });

        debug!(host = %self.host, database = %self.database, "Opened connection");
        Ok(client)
    }
}

/// Idle-list connection pool.
pub struct ConnectionPool {
    settings: ConnectionSettings,
    idle: Mutex<Vec<Client>>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.settings)
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(settings: ConnectionSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            idle: Mutex::new(Vec::new()),
        })
    }

    /// Open one connection up front so bad settings fail before any work starts.
    pub async fn connect(settings: ConnectionSettings) -> Result<Arc<Self>, SqlError> {
        let pool = Self::new(settings);
        let client = pool.settings.connect().await?;
        pool.release(client);
        Ok(pool)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check out an idle client, or open a new one when none is idle.
    pub async fn get(self: &Arc<Self>) -> Result<PooledClient, SqlError> {
        let idle = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            std::iter::from_fn(|| idle.pop()).find(|client| !client.is_closed())
        };

        let client = match idle {
            Some(client) => client,
            None => self.settings.connect().await?,
        };

        Ok(PooledClient {
            client: Some(client),
            pool: Arc::clone(self),
            reusable: true,
        })
    }

    fn release(&self, client: Client) {
        if client.is_closed() {
            return;
        }
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(client);
    }
}

/// A checked-out client. Returned to the pool on drop.
pub struct PooledClient {
    client: Option<Client>,
    pool: Arc<ConnectionPool>,
    reusable: bool,
}

impl PooledClient {
    /// Close this client instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.reusable = false;
    }
}

impl Deref for PooledClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.client
            .as_ref()
            .expect("client is present until the guard drops")
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if self.reusable {
                self.pool.release(client);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            host: "warehouse.internal".to_string(),
            port: 5439,
            user: "loader".to_string(),
            password: "hunter2".to_string(),
            database: "analytics".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_debug_hides_password() {
        let rendered = format!("{:?}", settings());
        assert!(rendered.contains("warehouse.internal"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_pg_config_carries_settings() {
        let config = settings().to_pg_config();
        assert_eq!(config.get_ports(), &[5439]);
        assert_eq!(config.get_user(), Some("loader"));
        assert_eq!(config.get_dbname(), Some("analytics"));
        assert_eq!(config.get_password(), Some(b"hunter2".as_slice()));
        assert_eq!(config.get_connect_timeout(), Some(&Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let mut settings = settings();
        settings.host = "127.0.0.1".to_string();
        settings.port = 1;
        settings.connect_timeout = Duration::from_millis(500);

        let err = ConnectionPool::connect(settings).await.unwrap_err();
        assert!(matches!(err, SqlError::Connect { .. }));
    }
}
