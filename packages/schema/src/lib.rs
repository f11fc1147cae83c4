#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Versioned SQL migrations for the taskboard database.
//!
//! Migration files live in one directory per backend and are named
//! `{number}_{description}.sql`. The [`runner::MigrationRunner`] applies every
//! file not yet recorded in the ledger table, in filename order, each inside
//! its own transaction.

pub mod discovery;
pub mod ledger;
pub mod runner;
pub mod splitter;

use std::path::PathBuf;

use taskboard_database::DatabaseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Failed to read migrations directory '{}': {source}", path.display())]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read migration '{filename}': {source}")]
    MigrationFile {
        filename: String,
        #[source]
        source: std::io::Error,
    },

    /// `index` is the 1-based position of the statement in the file.
    #[error("Migration '{filename}' failed at statement {index} ({statement}): {source}")]
    StatementExecution {
        filename: String,
        index: usize,
        statement: String,
        #[source]
        source: DatabaseError,
    },

    #[error("Migration '{filename}' transaction failed: {source}")]
    Transaction {
        filename: String,
        #[source]
        source: DatabaseError,
    },

    #[error("Migration '{0}' is already recorded in the ledger")]
    DuplicateMigration(String),

    #[error("Migration '{0}' was not found")]
    UnknownMigration(String),

    #[error("Invalid migration table name '{0}'")]
    InvalidTableName(String),
}

impl MigrationError {
    /// The migration file this error belongs to, if any.
    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        match self {
            Self::MigrationFile { filename, .. }
            | Self::StatementExecution { filename, .. }
            | Self::Transaction { filename, .. }
            | Self::DuplicateMigration(filename)
            | Self::UnknownMigration(filename) => Some(filename),
            Self::Database(_) | Self::Discovery { .. } | Self::InvalidTableName(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;
