#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

pub mod observer;
pub mod placeholders;
#[cfg(feature = "postgres-raw")]
pub mod postgres;
#[cfg(feature = "sqlite-rusqlite")]
pub mod rusqlite;
#[cfg(feature = "simulator")]
pub mod simulator;
#[cfg(feature = "mysql-sqlx")]
pub mod sqlx;

mod statement;

use std::{fmt, num::TryFromIntError, str::FromStr};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use thiserror::Error;

pub use observer::{QueryEvent, QueryObserver, SharedObserver};

/// The database engine an adapter talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Sqlite,
    Postgres,
    MySql,
}

impl Backend {
    /// Name used for configuration values and per-backend migration directories.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
        }
    }

    /// Whether support for this backend was compiled into the crate.
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        match self {
            Self::Sqlite => cfg!(feature = "sqlite-rusqlite"),
            Self::Postgres => cfg!(feature = "postgres-raw"),
            Self::MySql => cfg!(feature = "mysql-sqlx"),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unsupported database backend '{0}'")]
pub struct UnsupportedBackendError(pub String);

impl FromStr for Backend {
    type Err = UnsupportedBackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            _ => Err(UnsupportedBackendError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    String(String),
    Bool(bool),
    Number(i64),
    UNumber(u64),
    Real(f64),
    DateTime(NaiveDateTime),
}

impl DatabaseValue {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::UNumber(value) => i64::try_from(*value).ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UNumber(value) => Some(*value),
            Self::Number(value) => u64::try_from(*value).ok(),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Number(value) => Some(*value != 0),
            Self::UNumber(value) => Some(*value != 0),
            _ => None,
        }
    }

    /// Returns the value as a timestamp.
    ///
    /// SQLite has no native timestamp type and hands back `CURRENT_TIMESTAMP`
    /// defaults as text, so `YYYY-MM-DD HH:MM:SS[.fff]` strings are parsed too.
    #[must_use]
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Self::DateTime(value) => Some(*value),
            Self::String(value) => {
                NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
                    .ok()
            }
            _ => None,
        }
    }
}

impl<T: Into<Self>> From<Option<T>> for DatabaseValue {
    fn from(val: Option<T>) -> Self {
        val.map_or(Self::Null, std::convert::Into::into)
    }
}

impl From<bool> for DatabaseValue {
    fn from(val: bool) -> Self {
        Self::Bool(val)
    }
}

impl From<&str> for DatabaseValue {
    fn from(val: &str) -> Self {
        Self::String(val.to_string())
    }
}

impl From<&String> for DatabaseValue {
    fn from(val: &String) -> Self {
        Self::String(val.clone())
    }
}

impl From<String> for DatabaseValue {
    fn from(val: String) -> Self {
        Self::String(val)
    }
}

impl From<f32> for DatabaseValue {
    fn from(val: f32) -> Self {
        Self::Real(f64::from(val))
    }
}

impl From<f64> for DatabaseValue {
    fn from(val: f64) -> Self {
        Self::Real(val)
    }
}

impl From<i32> for DatabaseValue {
    fn from(val: i32) -> Self {
        Self::Number(i64::from(val))
    }
}

impl From<i64> for DatabaseValue {
    fn from(val: i64) -> Self {
        Self::Number(val)
    }
}

impl From<u32> for DatabaseValue {
    fn from(val: u32) -> Self {
        Self::UNumber(u64::from(val))
    }
}

impl From<u64> for DatabaseValue {
    fn from(val: u64) -> Self {
        Self::UNumber(val)
    }
}

impl From<NaiveDateTime> for DatabaseValue {
    fn from(val: NaiveDateTime) -> Self {
        Self::DateTime(val)
    }
}

#[derive(Debug, Error)]
pub enum TryFromError {
    #[error("Could not convert to type '{0}'")]
    CouldNotConvert(String),
    #[error(transparent)]
    TryFromInt(#[from] TryFromIntError),
}

impl TryFrom<DatabaseValue> for i64 {
    type Error = TryFromError;

    fn try_from(value: DatabaseValue) -> Result<Self, Self::Error> {
        match value {
            DatabaseValue::Number(value) => Ok(value),
            DatabaseValue::UNumber(value) => Ok(Self::try_from(value)?),
            _ => Err(TryFromError::CouldNotConvert("i64".into())),
        }
    }
}

impl TryFrom<DatabaseValue> for String {
    type Error = TryFromError;

    fn try_from(value: DatabaseValue) -> Result<Self, Self::Error> {
        match value {
            DatabaseValue::String(value) => Ok(value),
            _ => Err(TryFromError::CouldNotConvert("String".into())),
        }
    }
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[cfg(feature = "sqlite-rusqlite")]
    #[error(transparent)]
    Rusqlite(rusqlite::RusqliteDatabaseError),
    #[cfg(feature = "mysql-sqlx")]
    #[error(transparent)]
    MysqlSqlx(sqlx::mysql::SqlxDatabaseError),
    #[cfg(feature = "postgres-raw")]
    #[error(transparent)]
    Postgres(postgres::postgres::PostgresDatabaseError),
    #[error("Failed to connect: {0}")]
    Connection(String),
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("Query failed: {0}")]
    QueryFailed(String),
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Database connection is closed")]
    Closed,
    #[error("Already in transaction - nested transactions not supported")]
    AlreadyInTransaction,
    #[error("Transaction already committed")]
    TransactionCommitted,
    #[error("Transaction already rolled back")]
    TransactionRolledBack,
}

impl DatabaseError {
    #[must_use]
    pub const fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn is_connection_error(&self) -> bool {
        match &self {
            Self::Connection(_) | Self::Closed => true,
            #[cfg(feature = "mysql-sqlx")]
            Self::MysqlSqlx(sqlx::mysql::SqlxDatabaseError::Sqlx(::sqlx::Error::Io(_io_err))) => {
                true
            }
            #[cfg(feature = "postgres-raw")]
            Self::Postgres(postgres::postgres::PostgresDatabaseError::Postgres(pg_err)) => {
                pg_err.is_closed()
            }
            #[cfg(feature = "postgres-raw")]
            Self::Postgres(postgres::postgres::PostgresDatabaseError::Pool(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<(String, DatabaseValue)>,
}

impl Row {
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<DatabaseValue> {
        self.columns
            .iter()
            .find(|c| c.0 == column_name)
            .map(|c| c.1.clone())
    }

    #[must_use]
    pub fn id(&self) -> Option<DatabaseValue> {
        self.get("id")
    }
}

/// Backend-neutral outcome of a single statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Rows produced by the statement, empty for statements without a result set.
    pub rows: Vec<Row>,
    /// Number of rows the statement inserted, updated or deleted.
    pub changes: u64,
    /// Key generated by an `INSERT`, when the backend reports one.
    pub insert_id: Option<i64>,
}

impl QueryResult {
    #[must_use]
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

#[async_trait]
pub trait Database: Send + Sync + std::fmt::Debug {
    fn backend(&self) -> Backend;

    /// Runs a single parameterized statement.
    ///
    /// Parameters are bound to positional `?` placeholders on every backend.
    ///
    /// # Errors
    ///
    /// * If the statement fails to prepare or execute
    /// * If a unique constraint is violated (`DatabaseError::UniqueViolation`)
    /// * If the connection was closed (`DatabaseError::Closed`)
    async fn query(&self, sql: &str, params: &[DatabaseValue])
    -> Result<QueryResult, DatabaseError>;

    /// Runs a statement written with `:name` placeholders.
    ///
    /// # Errors
    ///
    /// * If a placeholder has no matching parameter
    /// * If the underlying `query` fails
    async fn query_named(
        &self,
        sql: &str,
        params: &[(&str, DatabaseValue)],
    ) -> Result<QueryResult, DatabaseError> {
        let (sql, values) = placeholders::named_to_positional(sql, params)?;
        self.query(&sql, &values).await
    }

    /// Executes one statement through the backend's simple text protocol.
    ///
    /// # Errors
    ///
    /// * If the statement fails
    async fn exec_raw(&self, statement: &str) -> Result<(), DatabaseError>;

    /// Begin a database transaction
    ///
    /// Pooled backends pin one dedicated session inside the returned
    /// transaction. Every statement run on the transaction goes to that
    /// session until it is committed or rolled back.
    ///
    /// # Errors
    ///
    /// * If transaction creation fails
    /// * If called on a `DatabaseTransaction` (nested transactions not supported)
    async fn begin_transaction(&self) -> Result<Box<dyn DatabaseTransaction>, DatabaseError>;

    /// Releases the underlying session or pool. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the backend failed to shut down cleanly.
    async fn close(&self) -> Result<(), DatabaseError>;
}

/// A transaction pinned to one database session.
///
/// All `Database` methods run inside the transaction. `commit` and `rollback`
/// consume it, so a finished transaction cannot be used again.
///
/// Dropping a transaction without finishing it releases the session and the
/// backend discards the uncommitted work.
#[async_trait]
pub trait DatabaseTransaction: Database + Send + Sync {
    /// # Errors
    ///
    /// * If the commit fails or the transaction was already finished
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

    /// # Errors
    ///
    /// * If the rollback fails or the transaction was already finished
    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}
