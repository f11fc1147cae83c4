use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::TryStreamExt;
use sqlx::{
    Column, Executor, MySql, MySqlConnection, MySqlPool, Row, Transaction, TypeInfo, Value,
    ValueRef,
    mysql::{MySqlArguments, MySqlConnectOptions, MySqlPoolOptions, MySqlRow, MySqlValueRef},
    query::Query,
};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    Backend, Database, DatabaseError, DatabaseTransaction, DatabaseValue, QueryResult,
    observer::{SharedObserver, Timing},
    statement::is_read_only,
};

#[allow(clippy::module_name_repetitions)]
pub struct MysqlSqlxTransaction {
    transaction: Mutex<Option<Transaction<'static, MySql>>>,
    observer: Option<SharedObserver>,
}

impl MysqlSqlxTransaction {
    #[must_use]
    pub fn new(transaction: Transaction<'static, MySql>) -> Self {
        Self {
            transaction: Mutex::new(Some(transaction)),
            observer: None,
        }
    }
}

impl fmt::Debug for MysqlSqlxTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MysqlSqlxTransaction")
            .field("transaction", &"<transaction>")
            .finish_non_exhaustive()
    }
}

pub struct MySqlSqlxDatabase {
    pool: MySqlPool,
    observer: Option<SharedObserver>,
}

impl MySqlSqlxDatabase {
    #[must_use]
    pub const fn new(pool: MySqlPool) -> Self {
        Self {
            pool,
            observer: None,
        }
    }

    /// Builds the pool and opens its first connection.
    ///
    /// # Errors
    ///
    /// * `DatabaseError::Connection` if the server is unreachable or rejects
    ///   the credentials
    pub async fn connect(
        options: MySqlConnectOptions,
        pool_options: MySqlPoolOptions,
    ) -> Result<Self, DatabaseError> {
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        Ok(Self::new(pool))
    }

    #[must_use]
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = Some(observer);
        self
    }
}

impl fmt::Debug for MySqlSqlxDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlSqlxDatabase")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum SqlxDatabaseError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("Type Not Found: '{type_name}'")]
    TypeNotFound { type_name: String },
}

impl From<SqlxDatabaseError> for DatabaseError {
    fn from(value: SqlxDatabaseError) -> Self {
        match value {
            SqlxDatabaseError::Sqlx(sqlx::Error::PoolClosed) => Self::Closed,
            SqlxDatabaseError::Sqlx(sqlx::Error::Database(error))
                if error.is_unique_violation() =>
            {
                Self::UniqueViolation(error.message().to_string())
            }
            value => Self::MysqlSqlx(value),
        }
    }
}

#[async_trait]
impl Database for MySqlSqlxDatabase {
    fn backend(&self) -> Backend {
        Backend::MySql
    }

    async fn query(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<QueryResult, DatabaseError> {
        Timing {
            observer: self.observer.as_ref(),
            backend: Backend::MySql,
            sql,
            param_count: params.len(),
            in_transaction: false,
        }
        .run(async {
            let mut connection = self.pool.acquire().await.map_err(SqlxDatabaseError::Sqlx)?;
            Ok(execute_query(&mut connection, sql, params).await?)
        })
        .await
    }

    async fn exec_raw(&self, statement: &str) -> Result<(), DatabaseError> {
        Timing {
            observer: self.observer.as_ref(),
            backend: Backend::MySql,
            sql: statement,
            param_count: 0,
            in_transaction: false,
        }
        .run(async {
            let mut connection = self.pool.acquire().await.map_err(SqlxDatabaseError::Sqlx)?;
            connection
                .execute(statement)
                .await
                .map_err(SqlxDatabaseError::Sqlx)?;
            Ok(())
        })
        .await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn DatabaseTransaction>, DatabaseError> {
        let tx = self.pool.begin().await.map_err(SqlxDatabaseError::Sqlx)?;

        let mut transaction = MysqlSqlxTransaction::new(tx);
        transaction.observer.clone_from(&self.observer);

        Ok(Box::new(transaction))
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        if !self.pool.is_closed() {
            log::debug!("Closing mysql pool");
            self.pool.close().await;
        }
        Ok(())
    }
}

#[async_trait]
impl Database for MysqlSqlxTransaction {
    fn backend(&self) -> Backend {
        Backend::MySql
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn query(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<QueryResult, DatabaseError> {
        Timing {
            observer: self.observer.as_ref(),
            backend: Backend::MySql,
            sql,
            param_count: params.len(),
            in_transaction: true,
        }
        .run(async {
            let mut transaction_guard = self.transaction.lock().await;
            let tx = transaction_guard
                .as_mut()
                .ok_or(DatabaseError::TransactionCommitted)?;

            Ok(execute_query(&mut **tx, sql, params).await?)
        })
        .await
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn exec_raw(&self, statement: &str) -> Result<(), DatabaseError> {
        Timing {
            observer: self.observer.as_ref(),
            backend: Backend::MySql,
            sql: statement,
            param_count: 0,
            in_transaction: true,
        }
        .run(async {
            let mut transaction_guard = self.transaction.lock().await;
            let tx = transaction_guard
                .as_mut()
                .ok_or(DatabaseError::TransactionCommitted)?;

            (&mut **tx)
                .execute(statement)
                .await
                .map_err(SqlxDatabaseError::Sqlx)?;
            Ok(())
        })
        .await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn DatabaseTransaction>, DatabaseError> {
        Err(DatabaseError::AlreadyInTransaction)
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

#[async_trait]
impl DatabaseTransaction for MysqlSqlxTransaction {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let tx = self
            .transaction
            .lock()
            .await
            .take()
            .ok_or(DatabaseError::TransactionCommitted)?;

        tx.commit().await.map_err(SqlxDatabaseError::Sqlx)?;

        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        let tx = self
            .transaction
            .lock()
            .await
            .take()
            .ok_or(DatabaseError::TransactionCommitted)?;

        tx.rollback().await.map_err(SqlxDatabaseError::Sqlx)?;

        Ok(())
    }
}

async fn execute_query(
    connection: &mut MySqlConnection,
    sql: &str,
    params: &[DatabaseValue],
) -> Result<QueryResult, SqlxDatabaseError> {
    let query = bind_values(sqlx::query(sql), params);

    if is_read_only(sql) {
        let mut rows = vec![];
        let mut stream = query.fetch(connection);

        while let Some(row) = stream.try_next().await? {
            rows.push(from_row(&row)?);
        }

        log::trace!(
            "Got {} row{}",
            rows.len(),
            if rows.len() == 1 { "" } else { "s" }
        );

        return Ok(QueryResult {
            rows,
            changes: 0,
            insert_id: None,
        });
    }

    let result = query.execute(connection).await?;
    let insert_id = Some(result.last_insert_id())
        .filter(|id| *id > 0)
        .and_then(|id| i64::try_from(id).ok());

    Ok(QueryResult {
        rows: vec![],
        changes: result.rows_affected(),
        insert_id,
    })
}

fn bind_values<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    values: &'q [DatabaseValue],
) -> Query<'q, MySql, MySqlArguments> {
    for value in values {
        query = match value {
            DatabaseValue::Null => query.bind(None::<String>),
            DatabaseValue::String(value) => query.bind(value.as_str()),
            DatabaseValue::Bool(value) => query.bind(*value),
            DatabaseValue::Number(value) => query.bind(*value),
            DatabaseValue::UNumber(value) => query.bind(*value),
            DatabaseValue::Real(value) => query.bind(*value),
            DatabaseValue::DateTime(value) => query.bind(*value),
        };
    }

    query
}

fn column_value(value: &MySqlValueRef<'_>) -> Result<DatabaseValue, SqlxDatabaseError> {
    if value.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let owned = ValueRef::to_owned(value);
    let type_name = value.type_info().name().to_string();

    Ok(match type_name.as_str() {
        "BOOLEAN" | "BOOL" => DatabaseValue::Bool(owned.try_decode()?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            DatabaseValue::Number(owned.try_decode_unchecked()?)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" | "BIT" => DatabaseValue::UNumber(owned.try_decode_unchecked()?),
        "FLOAT" | "DOUBLE" => DatabaseValue::Real(owned.try_decode_unchecked()?),
        "VARCHAR" | "CHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM"
        | "DECIMAL" | "JSON" => DatabaseValue::String(owned.try_decode_unchecked()?),
        "TIMESTAMP" => {
            DatabaseValue::DateTime(owned.try_decode::<DateTime<Utc>>()?.naive_utc())
        }
        "DATETIME" => DatabaseValue::DateTime(owned.try_decode::<NaiveDateTime>()?),
        _ => return Err(SqlxDatabaseError::TypeNotFound { type_name }),
    })
}

fn from_row(row: &MySqlRow) -> Result<crate::Row, SqlxDatabaseError> {
    let mut columns = vec![];

    for column in row.columns() {
        columns.push((
            column.name().to_string(),
            column_value(&row.try_get_raw(column.ordinal())?)?,
        ));
    }

    Ok(crate::Row { columns })
}
