use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::{
    Backend, Database, DatabaseError, DatabaseTransaction, DatabaseValue, QueryEvent,
    QueryObserver, QueryResult, rusqlite::RusqliteDatabase,
};

#[derive(Debug, Default)]
struct StatementLog {
    statements: Mutex<Vec<String>>,
}

impl QueryObserver for StatementLog {
    fn on_query(&self, event: &QueryEvent<'_>) {
        log::trace!("simulator: {}", event.sql);
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.sql.to_string());
    }
}

/// In-memory stand-in for a real backend.
///
/// Runs on a private `SQLite` database and remembers every statement sent
/// through it, including statements run inside its transactions.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug)]
pub struct SimulationDatabase {
    inner: RusqliteDatabase,
    log: Arc<StatementLog>,
}

impl SimulationDatabase {
    /// # Errors
    ///
    /// * If the database connection fails to open in memory
    pub fn new() -> Result<Self, DatabaseError> {
        let log = Arc::new(StatementLog::default());
        let inner = RusqliteDatabase::open_in_memory()?.with_observer(log.clone());

        Ok(Self { inner, log })
    }

    /// Every statement executed so far, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.log
            .statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_statements(&self) {
        self.log
            .statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl Database for SimulationDatabase {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    async fn query(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<QueryResult, DatabaseError> {
        self.inner.query(sql, params).await
    }

    async fn exec_raw(&self, statement: &str) -> Result<(), DatabaseError> {
        self.inner.exec_raw(statement).await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn DatabaseTransaction>, DatabaseError> {
        self.inner.begin_transaction().await
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        self.inner.close().await
    }
}
