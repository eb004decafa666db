//! The warehouse side: statements, the executor seam and its PostgreSQL
//! wire implementation.
//!
//! Everything that talks to the warehouse goes through [`Executor`], so the
//! refresh logic can be driven by an in-memory double in tests.

pub mod command;
mod postgres;

pub use postgres::PgWarehouse;

use async_trait::async_trait;
use std::fmt;

use crate::error::SqlError;

/// A single SQL statement.
///
/// A statement may carry a credential clause. It is appended to the text sent
/// to the server by [`Statement::expose`] but replaced with a placeholder by
/// `Display` and `Debug`, so logging a statement never leaks secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct Statement {
    sql: String,
    secret: Option<String>,
}

const REDACTED: &str = "<credentials redacted>";

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            secret: None,
        }
    }

    pub fn with_secret(sql: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            secret: Some(secret.into()),
        }
    }

    /// The statement without its credential clause.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The full text to send to the server.
    pub fn expose(&self) -> String {
        match &self.secret {
            Some(secret) => format!("{} {}", self.sql, secret),
            None => self.sql.clone(),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.secret {
            Some(_) => write!(f, "{} {}", self.sql, REDACTED),
            None => f.write_str(&self.sql),
        }
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Statement({self})")
    }
}

/// Credentials the warehouse uses to read the stage.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    AccessKey {
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    },
    IamRole {
        arn: String,
    },
}

impl Credentials {
    /// The authorization clause of a bulk-load statement.
    pub fn clause(&self) -> String {
        match self {
            Credentials::AccessKey {
                access_key_id,
                secret_access_key,
                session_token,
            } => {
                let mut value =
                    format!("aws_access_key_id={access_key_id};aws_secret_access_key={secret_access_key}");
                if let Some(token) = session_token {
                    value.push_str(";token=");
                    value.push_str(token);
                }
                format!("CREDENTIALS {}", command::quote_literal(&value))
            }
            Credentials::IamRole { arn } => format!("IAM_ROLE {}", command::quote_literal(arn)),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::AccessKey { access_key_id, .. } => f
                .debug_struct("AccessKey")
                .field("access_key_id", access_key_id)
                .finish_non_exhaustive(),
            Credentials::IamRole { arn } => f.debug_struct("IamRole").field("arn", arn).finish(),
        }
    }
}

/// Runs statements against the warehouse.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute one statement outside any explicit transaction.
    async fn exec(&self, stmt: &Statement) -> Result<(), SqlError>;

    /// Start a transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>, SqlError>;
}

/// An open transaction. Dropping it without `commit` or `rollback` leaves the
/// server to roll it back.
#[async_trait]
pub trait Transaction: Send {
    async fn exec(&mut self, stmt: &Statement) -> Result<(), SqlError>;

    async fn commit(self: Box<Self>) -> Result<(), SqlError>;

    async fn rollback(self: Box<Self>) -> Result<(), SqlError>;
}
