//! Resolves which database the CLI talks to.
//!
//! The first source present wins:
//!
//! 1. `--database-url` (or the `DATABASE_URL` environment variable)
//! 2. `--config <file.toml>`
//! 3. the `DB_*` environment variables read by
//!    [`DatabaseConfig::from_env`]

use std::path::Path;

use taskboard_database_connection::{ConnectionFactory, DatabaseConfig};

use crate::CliError;

/// Builds the configuration from the CLI arguments.
///
/// # Errors
///
/// * `CliError::Init` if the URL, file or environment holds an invalid or
///   unsupported configuration
pub fn config(
    database_url: Option<&str>,
    config_path: Option<&Path>,
) -> Result<DatabaseConfig, CliError> {
    if let Some(url) = database_url.filter(|url| !url.trim().is_empty()) {
        log::debug!("config: Using database url");
        return Ok(DatabaseConfig::from_url(url)?);
    }

    if let Some(path) = config_path {
        log::debug!("config: Using config file {}", path.display());
        return Ok(DatabaseConfig::from_toml_file(path)?);
    }

    log::debug!("config: Using environment variables");
    Ok(DatabaseConfig::from_env()?)
}

/// Builds a validated [`ConnectionFactory`] from the CLI arguments.
///
/// # Errors
///
/// * `CliError::Config` if the configuration is missing fields the backend
///   needs, or names a backend this build does not include
/// * `CliError::Init` if the configuration cannot be read
pub fn factory(
    database_url: Option<&str>,
    config_path: Option<&Path>,
) -> Result<ConnectionFactory, CliError> {
    let config = config(database_url, config_path)?;

    ConnectionFactory::new(config).map_err(|e| CliError::Config(e.to_string()))
}
