//! `SQLite` database backend using rusqlite
//!
//! One persistent `rusqlite::Connection` is shared behind an async mutex.
//! Transactions send `BEGIN`, `COMMIT` and `ROLLBACK` on that same session,
//! so only one transaction can be open at a time.

use std::{
    fmt,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use rusqlite::{Connection, Rows, Statement, types::Value};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    Backend, Database, DatabaseError, DatabaseTransaction, DatabaseValue, QueryResult,
    observer::{SharedObserver, Timing},
    statement::{is_insert, modifies_rows},
};

type SharedConnection = Arc<Mutex<Option<Connection>>>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[allow(clippy::module_name_repetitions)]
pub struct RusqliteDatabase {
    connection: SharedConnection,
    in_transaction: Arc<AtomicBool>,
    observer: Option<SharedObserver>,
}

impl fmt::Debug for RusqliteDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RusqliteDatabase")
            .field("in_transaction", &self.in_transaction)
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl RusqliteDatabase {
    #[must_use]
    pub fn new(connection: Connection) -> Self {
        Self {
            connection: Arc::new(Mutex::new(Some(connection))),
            in_transaction: Arc::new(AtomicBool::new(false)),
            observer: None,
        }
    }

    /// Opens (creating if needed) the database file at `path`.
    ///
    /// # Errors
    ///
    /// * `DatabaseError::Connection` if the file cannot be opened or is not a
    ///   `SQLite` database
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        log::debug!("Opening sqlite database at {}", path.display());

        let connection = Connection::open(path)
            .and_then(prepare_connection)
            .map_err(|e| DatabaseError::Connection(format!("{}: {e}", path.display())))?;

        Ok(Self::new(connection))
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// * `DatabaseError::Connection` if `SQLite` fails to allocate the database
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let connection = Connection::open_in_memory()
            .and_then(prepare_connection)
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        Ok(Self::new(connection))
    }

    #[must_use]
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = Some(observer);
        self
    }
}

fn prepare_connection(connection: Connection) -> Result<Connection, rusqlite::Error> {
    connection.busy_timeout(BUSY_TIMEOUT)?;
    // Forces the header to be read so a non-database file fails here.
    connection.query_row("PRAGMA schema_version", [], |_| Ok(()))?;
    Ok(connection)
}

#[allow(clippy::module_name_repetitions)]
pub struct RusqliteTransaction {
    connection: SharedConnection,
    owner_in_transaction: Arc<AtomicBool>,
    observer: Option<SharedObserver>,
    committed: AtomicBool,
    rolled_back: AtomicBool,
}

impl fmt::Debug for RusqliteTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RusqliteTransaction")
            .field("committed", &self.committed)
            .field("rolled_back", &self.rolled_back)
            .finish_non_exhaustive()
    }
}

impl RusqliteTransaction {
    fn finish(&self) {
        self.owner_in_transaction.store(false, Ordering::SeqCst);
    }

    fn check_open(&self) -> Result<(), DatabaseError> {
        if self.committed.load(Ordering::SeqCst) {
            return Err(DatabaseError::TransactionCommitted);
        }
        if self.rolled_back.load(Ordering::SeqCst) {
            return Err(DatabaseError::TransactionRolledBack);
        }
        Ok(())
    }

    async fn end(&self, statement: &str) -> Result<(), DatabaseError> {
        self.check_open()?;

        let guard = self.connection.lock().await;
        let connection = guard.as_ref().ok_or(DatabaseError::Closed)?;
        log::trace!("{statement}");
        connection
            .execute_batch(statement)
            .map_err(RusqliteDatabaseError::Rusqlite)?;
        drop(guard);

        Ok(())
    }
}

impl Drop for RusqliteTransaction {
    fn drop(&mut self) {
        if self.committed.load(Ordering::SeqCst) || self.rolled_back.load(Ordering::SeqCst) {
            return;
        }

        if let Ok(guard) = self.connection.try_lock() {
            if let Some(connection) = guard.as_ref().filter(|c| !c.is_autocommit()) {
                log::debug!("Rolling back unfinished sqlite transaction");
                if let Err(e) = connection.execute_batch("ROLLBACK") {
                    log::warn!("Failed to roll back dropped transaction: {e}");
                }
            }
        }

        self.finish();
    }
}

#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Error)]
pub enum RusqliteDatabaseError {
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
    #[error("Expected {expected} parameter(s) but got {actual}")]
    ParameterCount { expected: usize, actual: usize },
    #[error("Value out of range for sqlite integer: {0}")]
    IntegerOutOfRange(u64),
    #[error("Unsupported BLOB value in column '{0}'")]
    UnsupportedBlob(String),
}

impl From<RusqliteDatabaseError> for DatabaseError {
    fn from(value: RusqliteDatabaseError) -> Self {
        if let RusqliteDatabaseError::Rusqlite(rusqlite::Error::SqliteFailure(error, message)) =
            &value
        {
            if matches!(
                error.extended_code,
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            ) {
                return Self::UniqueViolation(
                    message.clone().unwrap_or_else(|| error.to_string()),
                );
            }
        }

        Self::Rusqlite(value)
    }
}

async fn run_query(
    connection: &SharedConnection,
    observer: Option<&SharedObserver>,
    in_transaction: bool,
    sql: &str,
    params: &[DatabaseValue],
) -> Result<QueryResult, DatabaseError> {
    Timing {
        observer,
        backend: Backend::Sqlite,
        sql,
        param_count: params.len(),
        in_transaction,
    }
    .run(async {
        let guard = connection.lock().await;
        let connection = guard.as_ref().ok_or(DatabaseError::Closed)?;
        Ok(execute_query(connection, sql, params)?)
    })
    .await
}

async fn run_raw(
    connection: &SharedConnection,
    observer: Option<&SharedObserver>,
    in_transaction: bool,
    statement: &str,
) -> Result<(), DatabaseError> {
    Timing {
        observer,
        backend: Backend::Sqlite,
        sql: statement,
        param_count: 0,
        in_transaction,
    }
    .run(async {
        let guard = connection.lock().await;
        let connection = guard.as_ref().ok_or(DatabaseError::Closed)?;
        connection
            .execute_batch(statement)
            .map_err(RusqliteDatabaseError::Rusqlite)?;
        Ok(())
    })
    .await
}

#[async_trait]
impl Database for RusqliteDatabase {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    async fn query(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<QueryResult, DatabaseError> {
        run_query(
            &self.connection,
            self.observer.as_ref(),
            false,
            sql,
            params,
        )
        .await
    }

    async fn exec_raw(&self, statement: &str) -> Result<(), DatabaseError> {
        run_raw(&self.connection, self.observer.as_ref(), false, statement).await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn DatabaseTransaction>, DatabaseError> {
        if self.in_transaction.swap(true, Ordering::SeqCst) {
            return Err(DatabaseError::AlreadyInTransaction);
        }

        let began: Result<(), DatabaseError> = {
            let guard = self.connection.lock().await;
            match guard.as_ref() {
                Some(connection) => connection
                    .execute_batch("BEGIN TRANSACTION")
                    .map_err(|e| RusqliteDatabaseError::Rusqlite(e).into()),
                None => Err(DatabaseError::Closed),
            }
        };

        if let Err(e) = began {
            self.in_transaction.store(false, Ordering::SeqCst);
            return Err(e);
        }

        Ok(Box::new(RusqliteTransaction {
            connection: self.connection.clone(),
            owner_in_transaction: self.in_transaction.clone(),
            observer: self.observer.clone(),
            committed: AtomicBool::new(false),
            rolled_back: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        let connection = self.connection.lock().await.take();

        if let Some(connection) = connection {
            log::debug!("Closing sqlite connection");
            connection
                .close()
                .map_err(|(_, e)| RusqliteDatabaseError::Rusqlite(e))?;
        }

        Ok(())
    }
}

#[async_trait]
impl Database for RusqliteTransaction {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    async fn query(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<QueryResult, DatabaseError> {
        self.check_open()?;
        run_query(&self.connection, self.observer.as_ref(), true, sql, params).await
    }

    async fn exec_raw(&self, statement: &str) -> Result<(), DatabaseError> {
        self.check_open()?;
        run_raw(&self.connection, self.observer.as_ref(), true, statement).await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn DatabaseTransaction>, DatabaseError> {
        Err(DatabaseError::AlreadyInTransaction)
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        // The session belongs to the owning database.
        Ok(())
    }
}

#[async_trait]
impl DatabaseTransaction for RusqliteTransaction {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        self.end("COMMIT").await?;
        self.committed.store(true, Ordering::SeqCst);
        self.finish();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        self.end("ROLLBACK").await?;
        self.rolled_back.store(true, Ordering::SeqCst);
        self.finish();
        Ok(())
    }
}

fn execute_query(
    connection: &Connection,
    sql: &str,
    params: &[DatabaseValue],
) -> Result<QueryResult, RusqliteDatabaseError> {
    let mut statement = connection.prepare(sql)?;

    let expected = statement.parameter_count();
    if expected != params.len() {
        return Err(RusqliteDatabaseError::ParameterCount {
            expected,
            actual: params.len(),
        });
    }

    bind_values(&mut statement, params)?;

    let column_names = statement
        .column_names()
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let read_only = statement.readonly();

    let rows = if column_names.is_empty() {
        statement.raw_execute()?;
        vec![]
    } else {
        to_rows(&column_names, statement.raw_query())?
    };
    drop(statement);

    #[allow(clippy::useless_conversion)]
    let changes = if read_only || !modifies_rows(sql) {
        0
    } else {
        u64::try_from(connection.changes()).unwrap_or_default()
    };
    let insert_id = (changes > 0 && is_insert(sql)).then(|| connection.last_insert_rowid());

    Ok(QueryResult {
        rows,
        changes,
        insert_id,
    })
}

fn bind_values(
    statement: &mut Statement<'_>,
    values: &[DatabaseValue],
) -> Result<(), RusqliteDatabaseError> {
    for (i, value) in values.iter().enumerate() {
        let i = i + 1;
        match value {
            DatabaseValue::Null => {
                statement.raw_bind_parameter(i, rusqlite::types::Null)?;
            }
            DatabaseValue::String(value) => {
                statement.raw_bind_parameter(i, value)?;
            }
            DatabaseValue::Bool(value) => {
                statement.raw_bind_parameter(i, i32::from(*value))?;
            }
            DatabaseValue::Number(value) => {
                statement.raw_bind_parameter(i, *value)?;
            }
            DatabaseValue::UNumber(value) => {
                let value = i64::try_from(*value)
                    .map_err(|_| RusqliteDatabaseError::IntegerOutOfRange(*value))?;
                statement.raw_bind_parameter(i, value)?;
            }
            DatabaseValue::Real(value) => {
                statement.raw_bind_parameter(i, *value)?;
            }
            DatabaseValue::DateTime(value) => {
                statement.raw_bind_parameter(i, value.format("%Y-%m-%d %H:%M:%S%.f").to_string())?;
            }
        }
    }

    Ok(())
}

fn from_value(column: &str, value: Value) -> Result<DatabaseValue, RusqliteDatabaseError> {
    Ok(match value {
        Value::Null => DatabaseValue::Null,
        Value::Integer(value) => DatabaseValue::Number(value),
        Value::Real(value) => DatabaseValue::Real(value),
        Value::Text(value) => DatabaseValue::String(value),
        Value::Blob(_) => return Err(RusqliteDatabaseError::UnsupportedBlob(column.to_string())),
    })
}

fn from_row(
    column_names: &[String],
    row: &rusqlite::Row<'_>,
) -> Result<crate::Row, RusqliteDatabaseError> {
    let mut columns = vec![];

    for (i, column) in column_names.iter().enumerate() {
        columns.push((column.clone(), from_value(column, row.get::<_, Value>(i)?)?));
    }

    Ok(crate::Row { columns })
}

fn to_rows(
    column_names: &[String],
    mut rows: Rows<'_>,
) -> Result<Vec<crate::Row>, RusqliteDatabaseError> {
    let mut results = vec![];

    while let Some(row) = rows.next()? {
        results.push(from_row(column_names, row)?);
    }

    log::trace!(
        "Got {} row{}",
        results.len(),
        if results.len() == 1 { "" } else { "s" }
    );

    Ok(results)
}
