//! # Migration Runner
//!
//! Applies pending migration files in filename order. Every file runs inside
//! its own transaction together with its ledger row, so a file is either fully
//! applied and recorded or leaves no trace at all.
//!
//! ```rust,no_run
//! use taskboard_database::Database;
//! use taskboard_schema::{discovery::MigrationDirectory, runner::MigrationRunner};
//!
//! # async fn example(db: &dyn Database) -> taskboard_schema::Result<()> {
//! let runner = MigrationRunner::new(MigrationDirectory::for_backend("migrations", db.backend()));
//!
//! for filename in runner.run(db).await? {
//!     println!("applied {filename}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Execution Strategies
//!
//! - `ExecutionStrategy::All` - Run all pending migrations
//! - `ExecutionStrategy::UpTo(filename)` - Run pending migrations up to and including `filename`
//! - `ExecutionStrategy::Steps(n)` - Run at most `n` pending migrations
//!
//! Rolling back only removes the most recent ledger row. The schema changes
//! the migration made stay in place.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, PoisonError},
};

use chrono::NaiveDateTime;
use taskboard_database::Database;

use crate::{
    MigrationError, Result,
    discovery::{MigrationDirectory, MigrationFile},
    ledger::MigrationLedger,
    splitter::split_statements,
};

/// Lifecycle of one migration file during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Pending,
    Applying,
    Applied,
    Failed,
}

/// Execution strategy for migrations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Run all pending migrations
    #[default]
    All,
    /// Run pending migrations up to and including the given filename
    UpTo(String),
    /// Run at most this many pending migrations
    Steps(usize),
}

/// Callbacks invoked around each migration
#[allow(clippy::type_complexity)]
#[derive(Default)]
pub struct MigrationHooks {
    /// Called before each migration
    pub before_migration: Option<Box<dyn Fn(&str) + Send + Sync>>,
    /// Called after each successful migration
    pub after_migration: Option<Box<dyn Fn(&str) + Send + Sync>>,
    /// Called when a migration fails
    pub on_error: Option<Box<dyn Fn(&str, &MigrationError) + Send + Sync>>,
}

/// Status of one migration as reported by [`MigrationRunner::list_migrations`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    pub filename: String,
    pub applied: bool,
    pub executed_at: Option<NaiveDateTime>,
    /// `false` for ledger rows whose file no longer exists.
    pub on_disk: bool,
}

pub struct MigrationRunner {
    directory: MigrationDirectory,
    ledger: MigrationLedger,
    strategy: ExecutionStrategy,
    hooks: MigrationHooks,
    dry_run: bool,
    states: Mutex<BTreeMap<String, MigrationState>>,
}

impl MigrationRunner {
    #[must_use]
    pub fn new(directory: MigrationDirectory) -> Self {
        Self {
            directory,
            ledger: MigrationLedger::new(),
            strategy: ExecutionStrategy::All,
            hooks: MigrationHooks::default(),
            dry_run: false,
            states: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn with_ledger(mut self, ledger: MigrationLedger) -> Self {
        self.ledger = ledger;
        self
    }

    /// Set a custom ledger table name
    ///
    /// # Errors
    ///
    /// * `MigrationError::InvalidTableName` if the name is not a plain identifier
    pub fn with_table_name(self, table_name: impl Into<String>) -> Result<Self> {
        Ok(self.with_ledger(MigrationLedger::with_table_name(table_name)?))
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: MigrationHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Enable dry run mode: report what would run without executing anything
    #[must_use]
    pub const fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    #[must_use]
    pub const fn directory(&self) -> &MigrationDirectory {
        &self.directory
    }

    #[must_use]
    pub const fn ledger(&self) -> &MigrationLedger {
        &self.ledger
    }

    /// State of every migration the last [`MigrationRunner::run`] considered.
    #[must_use]
    pub fn states(&self) -> BTreeMap<String, MigrationState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, filename: &str, state: MigrationState) {
        log::trace!("set_state: {filename} -> {state:?}");
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(filename.to_string(), state);
    }

    /// Discovered files not yet in the ledger, after applying the strategy.
    ///
    /// # Errors
    ///
    /// * If the ledger cannot be read or the directory cannot be listed
    /// * `MigrationError::UnknownMigration` if an `UpTo` target was not
    ///   discovered
    pub async fn pending(&self, db: &dyn Database) -> Result<Vec<MigrationFile>> {
        self.ledger.ensure_table(db).await?;

        let files = self.directory.discover()?;
        let applied: BTreeSet<String> = self.ledger.get_applied(db).await?.into_iter().collect();

        self.apply_strategy(files, &applied)
    }

    fn apply_strategy(
        &self,
        files: Vec<MigrationFile>,
        applied: &BTreeSet<String>,
    ) -> Result<Vec<MigrationFile>> {
        if let ExecutionStrategy::UpTo(target) = &self.strategy {
            if !files.iter().any(|file| file.filename() == target) {
                return Err(MigrationError::UnknownMigration(target.clone()));
            }
        }

        let pending = files
            .into_iter()
            .filter(|file| !applied.contains(file.filename()));

        Ok(match &self.strategy {
            ExecutionStrategy::All => pending.collect(),
            ExecutionStrategy::UpTo(target) => pending
                .filter(|file| file.filename() <= target.as_str())
                .collect(),
            ExecutionStrategy::Steps(steps) => pending.take(*steps).collect(),
        })
    }

    /// Applies pending migrations and returns the filenames applied by this
    /// call, in order. In dry run mode nothing is executed and the filenames
    /// that would be applied are returned.
    ///
    /// Stops at the first failing migration. Migrations committed before it
    /// stay applied.
    ///
    /// # Errors
    ///
    /// * If the ledger table cannot be created or read
    /// * If the migrations directory cannot be listed
    /// * If a migration file cannot be read
    /// * If a statement or the ledger insert fails (the migration is rolled back)
    pub async fn run(&self, db: &dyn Database) -> Result<Vec<String>> {
        let pending = self.pending(db).await?;

        {
            let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            states.clear();
            for file in &pending {
                states.insert(file.filename().to_string(), MigrationState::Pending);
            }
        }

        if pending.is_empty() {
            log::info!("No pending migrations");
            return Ok(vec![]);
        }

        if self.dry_run {
            for file in &pending {
                log::info!("Would apply migration {}", file.filename());
            }
            return Ok(pending
                .iter()
                .map(|file| file.filename().to_string())
                .collect());
        }

        let mut applied = Vec::with_capacity(pending.len());

        for file in &pending {
            let filename = file.filename();

            if let Some(ref hook) = self.hooks.before_migration {
                hook(filename);
            }

            self.set_state(filename, MigrationState::Applying);

            match self.apply(db, file).await {
                Ok(()) => {
                    self.set_state(filename, MigrationState::Applied);
                    log::info!("Applied migration {filename}");

                    if let Some(ref hook) = self.hooks.after_migration {
                        hook(filename);
                    }

                    applied.push(filename.to_string());
                }
                Err(e) => {
                    self.set_state(filename, MigrationState::Failed);
                    log::error!("Migration {filename} failed: {e}");

                    if let Some(ref hook) = self.hooks.on_error {
                        hook(filename, &e);
                    }

                    return Err(e);
                }
            }
        }

        Ok(applied)
    }

    async fn apply(&self, db: &dyn Database, file: &MigrationFile) -> Result<()> {
        let filename = file.filename();
        let statements = split_statements(&file.read()?);

        log::debug!(
            "apply: {filename} has {} statement{}",
            statements.len(),
            if statements.len() == 1 { "" } else { "s" }
        );

        let tx = db
            .begin_transaction()
            .await
            .map_err(|source| MigrationError::Transaction {
                filename: filename.to_string(),
                source,
            })?;

        match self.apply_statements(&*tx, filename, &statements).await {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|source| MigrationError::Transaction {
                    filename: filename.to_string(),
                    source,
                }),
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    log::warn!("Failed to roll back migration {filename}: {rollback_error}");
                }
                Err(e)
            }
        }
    }

    async fn apply_statements(
        &self,
        tx: &dyn Database,
        filename: &str,
        statements: &[String],
    ) -> Result<()> {
        for (index, statement) in statements.iter().enumerate() {
            tx.exec_raw(statement)
                .await
                .map_err(|source| MigrationError::StatementExecution {
                    filename: filename.to_string(),
                    index: index + 1,
                    statement: statement.clone(),
                    source,
                })?;
        }

        self.ledger.record(tx, filename).await
    }

    /// Removes the most recent ledger row and returns its filename.
    ///
    /// The schema changes made by that migration are not reverted. An empty
    /// ledger yields `Ok(None)`. In dry run mode the row is only looked up.
    ///
    /// # Errors
    ///
    /// * If the ledger cannot be read or updated
    pub async fn rollback_last(&self, db: &dyn Database) -> Result<Option<String>> {
        self.ledger.ensure_table(db).await?;

        let entry = if self.dry_run {
            self.ledger.most_recent(db).await?
        } else {
            self.ledger.delete_most_recent(db).await?
        };

        match &entry {
            Some(entry) if self.dry_run => {
                log::info!("Would remove migration {} from the ledger", entry.filename);
            }
            Some(entry) => log::info!("Removed migration {} from the ledger", entry.filename),
            None => log::info!("No applied migrations to roll back"),
        }

        Ok(entry.map(|entry| entry.filename))
    }

    /// Every discovered migration plus ledger rows whose file is gone, sorted
    /// by filename.
    ///
    /// # Errors
    ///
    /// * If the ledger cannot be read or the directory cannot be listed
    pub async fn list_migrations(&self, db: &dyn Database) -> Result<Vec<MigrationInfo>> {
        self.ledger.ensure_table(db).await?;

        let mut migrations: BTreeMap<String, MigrationInfo> = self
            .directory
            .discover()?
            .into_iter()
            .map(|file| {
                (
                    file.filename().to_string(),
                    MigrationInfo {
                        filename: file.filename().to_string(),
                        applied: false,
                        executed_at: None,
                        on_disk: true,
                    },
                )
            })
            .collect();

        for entry in self.ledger.entries(db).await? {
            let info = migrations
                .entry(entry.filename.clone())
                .or_insert_with(|| MigrationInfo {
                    filename: entry.filename.clone(),
                    applied: false,
                    executed_at: None,
                    on_disk: false,
                });
            info.applied = true;
            info.executed_at = Some(entry.executed_at);
        }

        Ok(migrations.into_values().collect())
    }
}
