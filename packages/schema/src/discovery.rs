//! Finds migration files on disk.
//!
//! A migration file is a regular file directly inside the migrations
//! directory whose name matches `^[0-9]+_[^/\\]+\.sql$`, for example
//! `001_create_users.sql`. Files are ordered by plain lexicographic filename
//! order, so numeric prefixes must be zero-padded to the same width.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use taskboard_database::Backend;

use crate::{MigrationError, Result};

static MIGRATION_FILENAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+_[^/\\]+\.sql$").expect("Invalid Regex"));

/// Whether `filename` follows the `{number}_{description}.sql` convention.
#[must_use]
pub fn is_migration_filename(filename: &str) -> bool {
    MIGRATION_FILENAME.is_match(filename)
}

/// One discovered migration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    filename: String,
    path: PathBuf,
}

impl MigrationFile {
    #[must_use]
    pub const fn new(filename: String, path: PathBuf) -> Self {
        Self { filename, path }
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole file.
    ///
    /// # Errors
    ///
    /// * `MigrationError::MigrationFile` if the file cannot be read
    pub fn read(&self) -> Result<String> {
        std::fs::read_to_string(&self.path).map_err(|source| MigrationError::MigrationFile {
            filename: self.filename.clone(),
            source,
        })
    }
}

/// A directory of migration files for one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDirectory {
    path: PathBuf,
}

impl MigrationDirectory {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `root/<backend>`, e.g. `migrations/postgres`.
    #[must_use]
    pub fn for_backend(root: impl AsRef<Path>, backend: Backend) -> Self {
        Self::new(root.as_ref().join(backend.as_str()))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lists the migration files in filename order.
    ///
    /// A missing directory is not an error and yields no files.
    ///
    /// # Errors
    ///
    /// * `MigrationError::Discovery` if the directory exists but cannot be
    ///   listed
    pub fn discover(&self) -> Result<Vec<MigrationFile>> {
        let discovery_error = |source: std::io::Error| MigrationError::Discovery {
            path: self.path.clone(),
            source,
        };

        let entries = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!(
                    "discover: migrations directory '{}' does not exist",
                    self.path.display()
                );
                return Ok(vec![]);
            }
            Err(e) => return Err(discovery_error(e)),
        };

        let mut files = vec![];

        for entry in entries {
            let entry = entry.map_err(discovery_error)?;
            let path = entry.path();

            let Some(filename) = entry.file_name().to_str().map(ToString::to_string) else {
                log::trace!("discover: skipping non utf-8 entry '{}'", path.display());
                continue;
            };

            if !is_migration_filename(&filename) {
                log::trace!("discover: skipping '{filename}'");
                continue;
            }

            if !path.is_file() {
                log::trace!("discover: skipping non-file entry '{filename}'");
                continue;
            }

            files.push(MigrationFile::new(filename, path));
        }

        files.sort_by(|a, b| a.filename.cmp(&b.filename));

        log::debug!(
            "discover: found {} migration{} in '{}'",
            files.len(),
            if files.len() == 1 { "" } else { "s" },
            self.path.display()
        );

        Ok(files)
    }
}
