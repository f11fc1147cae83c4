use std::ops::Deref;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDateTime, Utc};
use deadpool_postgres::{Object, Pool, PoolError};
use thiserror::Error;
use tokio_postgres::{
    Client, Column, Row,
    error::SqlState,
    types::{IsNull, ToSql, Type, to_sql_checked},
};

use crate::{
    Backend, Database, DatabaseError, DatabaseTransaction, DatabaseValue, QueryResult,
    observer::{SharedObserver, Timing},
    placeholders::question_marks_to_dollar,
    statement::{is_insert, is_read_only},
};

type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// `PostgreSQL` database connection pool
///
/// Every statement checks a session out of the pool for its own duration,
/// except inside a [`PostgresTransaction`], which owns its session.
#[allow(clippy::module_name_repetitions)]
pub struct PostgresDatabase {
    pool: Pool,
    observer: Option<SharedObserver>,
}

impl PostgresDatabase {
    #[must_use]
    pub const fn new(pool: Pool) -> Self {
        Self {
            pool,
            observer: None,
        }
    }

    /// Wraps `pool` after verifying that a session can be checked out.
    ///
    /// # Errors
    ///
    /// * `DatabaseError::Connection` if the server is unreachable or rejects
    ///   the credentials
    pub async fn connect(pool: Pool) -> Result<Self, DatabaseError> {
        let client = pool
            .get()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        drop(client);

        Ok(Self::new(pool))
    }

    #[must_use]
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    async fn get_client(&self) -> Result<Object, DatabaseError> {
        self.pool.get().await.map_err(|e| match e {
            PoolError::Closed => DatabaseError::Closed,
            e => DatabaseError::Postgres(PostgresDatabaseError::Pool(e)),
        })
    }
}

impl std::fmt::Debug for PostgresDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDatabase")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// `PostgreSQL` database transaction
///
/// Holds the pooled session it was started on. The session goes back to the
/// pool on commit or rollback. If the transaction is dropped unfinished the
/// session is detached from the pool and closed, which makes the server
/// discard the open transaction.
pub struct PostgresTransaction {
    client: Option<Object>,
    observer: Option<SharedObserver>,
}

impl PostgresTransaction {
    /// Creates a new transaction by executing `BEGIN`
    ///
    /// # Errors
    ///
    /// * If the transaction could not be started via `BEGIN`
    pub async fn new(client: Object) -> Result<Self, PostgresDatabaseError> {
        client.batch_execute("BEGIN").await?;

        Ok(Self {
            client: Some(client),
            observer: None,
        })
    }

    fn client(&self) -> Result<&Client, DatabaseError> {
        self.client
            .as_ref()
            .map(|client| &***client)
            .ok_or(DatabaseError::TransactionCommitted)
    }

    async fn end(mut self: Box<Self>, statement: &str) -> Result<(), DatabaseError> {
        let client = self
            .client
            .take()
            .ok_or(DatabaseError::TransactionCommitted)?;

        log::trace!("{statement}");
        client
            .batch_execute(statement)
            .await
            .map_err(PostgresDatabaseError::Postgres)?;

        Ok(())
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            log::debug!("Discarding session of unfinished postgres transaction");
            drop(Object::take(client));
        }
    }
}

impl std::fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransaction")
            .field("active", &self.client.is_some())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Error)]
pub enum PostgresDatabaseError {
    #[error("{}", describe(.0))]
    Postgres(#[from] tokio_postgres::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("Type Not Found: '{type_name}'")]
    TypeNotFound { type_name: String },
}

/// Server errors carry their message and SQLSTATE; `tokio_postgres::Error`'s
/// own `Display` only says "db error" for them.
fn describe(error: &tokio_postgres::Error) -> String {
    error.as_db_error().map_or_else(
        || error.to_string(),
        |db| {
            let mut message = format!(
                "{}: {} (SQLSTATE {})",
                db.severity(),
                db.message(),
                db.code().code()
            );
            if let Some(detail) = db.detail() {
                message.push_str(": ");
                message.push_str(detail);
            }
            message
        },
    )
}

impl From<PostgresDatabaseError> for DatabaseError {
    fn from(value: PostgresDatabaseError) -> Self {
        if let PostgresDatabaseError::Postgres(error) = &value {
            if error.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                return Self::UniqueViolation(
                    error
                        .as_db_error()
                        .map_or_else(|| error.to_string(), |db| db.message().to_string()),
                );
            }
        }

        Self::Postgres(value)
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    async fn query(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<QueryResult, DatabaseError> {
        Timing {
            observer: self.observer.as_ref(),
            backend: Backend::Postgres,
            sql,
            param_count: params.len(),
            in_transaction: false,
        }
        .run(async {
            let client = self.get_client().await?;
            Ok(execute_query(&client, sql, params).await?)
        })
        .await
    }

    async fn exec_raw(&self, statement: &str) -> Result<(), DatabaseError> {
        Timing {
            observer: self.observer.as_ref(),
            backend: Backend::Postgres,
            sql: statement,
            param_count: 0,
            in_transaction: false,
        }
        .run(async {
            let client = self.get_client().await?;
            client
                .batch_execute(statement)
                .await
                .map_err(PostgresDatabaseError::Postgres)?;
            Ok(())
        })
        .await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn DatabaseTransaction>, DatabaseError> {
        let client = self.get_client().await?;
        let mut transaction = PostgresTransaction::new(client).await?;
        transaction.observer.clone_from(&self.observer);

        Ok(Box::new(transaction))
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        if !self.pool.is_closed() {
            log::debug!("Closing postgres pool");
            self.pool.close();
        }
        Ok(())
    }
}

#[async_trait]
impl Database for PostgresTransaction {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    async fn query(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<QueryResult, DatabaseError> {
        Timing {
            observer: self.observer.as_ref(),
            backend: Backend::Postgres,
            sql,
            param_count: params.len(),
            in_transaction: true,
        }
        .run(async { Ok(execute_query(self.client()?, sql, params).await?) })
        .await
    }

    async fn exec_raw(&self, statement: &str) -> Result<(), DatabaseError> {
        Timing {
            observer: self.observer.as_ref(),
            backend: Backend::Postgres,
            sql: statement,
            param_count: 0,
            in_transaction: true,
        }
        .run(async {
            self.client()?
                .batch_execute(statement)
                .await
                .map_err(PostgresDatabaseError::Postgres)?;
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
impl DatabaseTransaction for PostgresTransaction {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        self.end("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        self.end("ROLLBACK").await
    }
}

async fn execute_query(
    client: &Client,
    sql: &str,
    params: &[DatabaseValue],
) -> Result<QueryResult, PostgresDatabaseError> {
    let query = question_marks_to_dollar(sql);
    let statement = client.prepare(&query).await?;

    let values = params
        .iter()
        .cloned()
        .map(PgDatabaseValue::from)
        .collect::<Vec<_>>();
    let values = values
        .iter()
        .map(|value| value as &(dyn ToSql + Sync))
        .collect::<Vec<_>>();

    if statement.columns().is_empty() {
        let changes = client.execute(&statement, &values).await?;
        return Ok(QueryResult {
            rows: vec![],
            changes,
            insert_id: None,
        });
    }

    let rows = client
        .query(&statement, &values)
        .await?
        .iter()
        .map(from_row)
        .collect::<Result<Vec<_>, _>>()?;

    log::trace!(
        "Got {} row{}",
        rows.len(),
        if rows.len() == 1 { "" } else { "s" }
    );

    let changes = if is_read_only(sql) {
        0
    } else {
        rows.len() as u64
    };
    let insert_id = if is_insert(sql) {
        rows.first()
            .and_then(crate::Row::id)
            .and_then(|id| id.as_i64())
    } else {
        None
    };

    Ok(QueryResult {
        rows,
        changes,
        insert_id,
    })
}

fn column_value(
    row: &Row,
    index: usize,
    column: &Column,
) -> Result<DatabaseValue, PostgresDatabaseError> {
    Ok(match column.type_().name() {
        "bool" => row.try_get::<_, Option<bool>>(index)?.into(),
        "int2" => row.try_get::<_, Option<i16>>(index)?.map(i64::from).into(),
        "int4" => row.try_get::<_, Option<i32>>(index)?.map(i64::from).into(),
        "int8" => row.try_get::<_, Option<i64>>(index)?.into(),
        "oid" => row.try_get::<_, Option<u32>>(index)?.into(),
        "float4" => row.try_get::<_, Option<f32>>(index)?.into(),
        "float8" => row.try_get::<_, Option<f64>>(index)?.into(),
        "text" | "varchar" | "bpchar" | "name" | "citext" | "unknown" => {
            row.try_get::<_, Option<String>>(index)?.into()
        }
        "timestamp" => row.try_get::<_, Option<NaiveDateTime>>(index)?.into(),
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(index)?
            .map(|value| value.naive_utc())
            .into(),
        type_name => {
            return Err(PostgresDatabaseError::TypeNotFound {
                type_name: type_name.to_string(),
            });
        }
    })
}

fn from_row(row: &Row) -> Result<crate::Row, PostgresDatabaseError> {
    let mut columns = vec![];

    for (index, column) in row.columns().iter().enumerate() {
        log::trace!("Mapping column {:?}", column.name());
        columns.push((column.name().to_string(), column_value(row, index, column)?));
    }

    Ok(crate::Row { columns })
}

#[derive(Debug, Clone)]
pub struct PgDatabaseValue(DatabaseValue);

impl From<DatabaseValue> for PgDatabaseValue {
    fn from(value: DatabaseValue) -> Self {
        Self(value)
    }
}

impl Deref for PgDatabaseValue {
    type Target = DatabaseValue;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn integer_to_sql(value: i64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match ty.name() {
        "int2" => i16::try_from(value)?.to_sql(ty, out),
        "int4" => i32::try_from(value)?.to_sql(ty, out),
        "oid" => u32::try_from(value)?.to_sql(ty, out),
        "bool" => (value != 0).to_sql(ty, out),
        #[allow(clippy::cast_precision_loss)]
        "float8" => (value as f64).to_sql(ty, out),
        "text" | "varchar" | "bpchar" => value.to_string().to_sql(ty, out),
        _ => value.to_sql(ty, out),
    }
}

impl ToSql for PgDatabaseValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        log::trace!("to_sql: ty={}, {ty:?}", ty.name());
        match &self.0 {
            DatabaseValue::Null => Ok(IsNull::Yes),
            DatabaseValue::String(value) => value.to_sql(ty, out),
            DatabaseValue::Bool(value) => match ty.name() {
                "bool" => value.to_sql(ty, out),
                _ => integer_to_sql(i64::from(*value), ty, out),
            },
            DatabaseValue::Number(value) => integer_to_sql(*value, ty, out),
            DatabaseValue::UNumber(value) => integer_to_sql(i64::try_from(*value)?, ty, out),
            DatabaseValue::Real(value) => match ty.name() {
                #[allow(clippy::cast_possible_truncation)]
                "float4" => (*value as f32).to_sql(ty, out),
                _ => value.to_sql(ty, out),
            },
            DatabaseValue::DateTime(value) => match ty.name() {
                "timestamptz" => value.and_utc().to_sql(ty, out),
                _ => value.to_sql(ty, out),
            },
        }
    }

    fn accepts(ty: &Type) -> bool {
        log::trace!("ToSql accepts: ty={}, {ty:?}", ty.name());
        true
    }

    to_sql_checked!();
}
