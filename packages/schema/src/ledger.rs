//! The table recording which migrations have been applied.
//!
//! Each row holds an auto-increment `id`, the unique migration `filename` and
//! the `executed_at` time. Rows are only ever removed by
//! [`MigrationLedger::delete_most_recent`].

use chrono::NaiveDateTime;
use taskboard_database::{Backend, Database, DatabaseError, Row};

use crate::{MigrationError, Result};

/// Default name for the ledger table
pub const DEFAULT_MIGRATIONS_TABLE: &str = "migrations";

/// One applied migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: i64,
    pub filename: String,
    pub executed_at: NaiveDateTime,
}

impl TryFrom<&Row> for LedgerEntry {
    type Error = MigrationError;

    fn try_from(row: &Row) -> Result<Self> {
        let invalid = |column: &str| {
            MigrationError::Database(DatabaseError::QueryFailed(format!(
                "ledger row has an invalid '{column}' column: {row:?}"
            )))
        };

        Ok(Self {
            id: row
                .get("id")
                .and_then(|value| value.as_i64())
                .ok_or_else(|| invalid("id"))?,
            filename: row
                .get("filename")
                .and_then(|value| value.as_str().map(ToString::to_string))
                .ok_or_else(|| invalid("filename"))?,
            executed_at: row
                .get("executed_at")
                .and_then(|value| value.as_datetime())
                .ok_or_else(|| invalid("executed_at"))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationLedger {
    table_name: String,
}

impl Default for MigrationLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table_name: DEFAULT_MIGRATIONS_TABLE.to_string(),
        }
    }

    /// Uses `table_name` instead of [`DEFAULT_MIGRATIONS_TABLE`].
    ///
    /// # Errors
    ///
    /// * `MigrationError::InvalidTableName` unless the name is a plain
    ///   identifier (ASCII letters, digits and `_`, not starting with a digit)
    pub fn with_table_name(table_name: impl Into<String>) -> Result<Self> {
        let table_name = table_name.into();

        let mut chars = table_name.chars();
        let valid = chars
            .next()
            .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

        if !valid {
            return Err(MigrationError::InvalidTableName(table_name));
        }

        Ok(Self { table_name })
    }

    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn create_table_sql(&self, backend: Backend) -> String {
        let table = &self.table_name;

        match backend {
            Backend::Sqlite => format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 filename TEXT NOT NULL UNIQUE, \
                 executed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)"
            ),
            Backend::Postgres => format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id SERIAL PRIMARY KEY, \
                 filename VARCHAR(255) NOT NULL UNIQUE, \
                 executed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)"
            ),
            Backend::MySql => format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id INT AUTO_INCREMENT PRIMARY KEY, \
                 filename VARCHAR(255) NOT NULL UNIQUE, \
                 executed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)"
            ),
        }
    }

    /// Creates the ledger table if it does not exist yet.
    ///
    /// # Errors
    ///
    /// * If the table creation fails
    pub async fn ensure_table(&self, db: &dyn Database) -> Result<()> {
        log::debug!("ensure_table: {}", self.table_name);

        db.exec_raw(&self.create_table_sql(db.backend())).await?;

        Ok(())
    }

    /// Filenames of every applied migration, oldest first.
    ///
    /// # Errors
    ///
    /// * If the database query fails
    pub async fn get_applied(&self, db: &dyn Database) -> Result<Vec<String>> {
        Ok(self
            .entries(db)
            .await?
            .into_iter()
            .map(|entry| entry.filename)
            .collect())
    }

    /// Every ledger row ordered by `id`.
    ///
    /// # Errors
    ///
    /// * If the database query fails
    /// * If a row cannot be decoded
    pub async fn entries(&self, db: &dyn Database) -> Result<Vec<LedgerEntry>> {
        let rows = db
            .query(
                &format!(
                    "SELECT id, filename, executed_at FROM {} ORDER BY id ASC",
                    self.table_name
                ),
                &[],
            )
            .await?
            .into_rows();

        rows.iter().map(LedgerEntry::try_from).collect()
    }

    /// Records `filename` as applied. Meant to run on the migration's own
    /// transaction so the row commits together with the migration.
    ///
    /// # Errors
    ///
    /// * `MigrationError::DuplicateMigration` if the filename is already
    ///   recorded
    /// * If the insert fails for any other reason
    pub async fn record(&self, db: &dyn Database, filename: &str) -> Result<()> {
        log::debug!("record: {filename}");

        db.query(
            &format!("INSERT INTO {} (filename) VALUES (?)", self.table_name),
            &[filename.into()],
        )
        .await
        .map_err(|e| match e {
            DatabaseError::UniqueViolation(_) => {
                MigrationError::DuplicateMigration(filename.to_string())
            }
            e => MigrationError::Database(e),
        })?;

        Ok(())
    }

    /// The row with the highest `id`, if any.
    ///
    /// # Errors
    ///
    /// * If the database query fails
    pub async fn most_recent(&self, db: &dyn Database) -> Result<Option<LedgerEntry>> {
        let result = db
            .query(
                &format!(
                    "SELECT id, filename, executed_at FROM {} ORDER BY id DESC LIMIT 1",
                    self.table_name
                ),
                &[],
            )
            .await?;

        result.first().map(LedgerEntry::try_from).transpose()
    }

    /// Removes the row with the highest `id` and returns it. An empty ledger
    /// is left alone and yields `None`.
    ///
    /// # Errors
    ///
    /// * If the database query fails
    pub async fn delete_most_recent(&self, db: &dyn Database) -> Result<Option<LedgerEntry>> {
        let Some(entry) = self.most_recent(db).await? else {
            log::debug!("delete_most_recent: ledger is empty");
            return Ok(None);
        };

        db.query(
            &format!("DELETE FROM {} WHERE id = ?", self.table_name),
            &[entry.id.into()],
        )
        .await?;

        log::debug!("delete_most_recent: removed {}", entry.filename);

        Ok(Some(entry))
    }
}
