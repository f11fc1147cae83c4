#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;

use std::sync::Arc;

use taskboard_database::{Backend, Database, DatabaseError, UnsupportedBackendError};
use thiserror::Error;
use tokio::sync::Mutex;

pub use config::{Credentials, DatabaseConfig};

/// The adapter handed out by a [`ConnectionFactory`].
pub type SharedDatabase = Arc<Box<dyn Database>>;

#[derive(Debug, Error)]
pub enum InitDbError {
    #[error("Unsupported database backend '{0}'")]
    UnsupportedBackend(String),
    #[error("Credentials are required for {0}")]
    CredentialsRequired(Backend),
    #[error("A database file path is required for sqlite")]
    MissingPath,
    #[error("Invalid database url: {0}")]
    InvalidUrl(String),
    #[error("Invalid database configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Connection(#[from] DatabaseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[cfg(feature = "postgres-raw")]
    #[error(transparent)]
    InitPostgres(#[from] InitPostgresError),
}

impl From<UnsupportedBackendError> for InitDbError {
    fn from(value: UnsupportedBackendError) -> Self {
        Self::UnsupportedBackend(value.0)
    }
}

#[cfg(feature = "postgres-raw")]
#[derive(Debug, Error)]
pub enum InitPostgresError {
    #[error(transparent)]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),
    #[cfg(feature = "postgres-native-tls")]
    #[error(transparent)]
    NativeTls(#[from] native_tls::Error),
}

/// Whether this build can open connections to `backend`.
#[must_use]
pub const fn is_backend_enabled(backend: Backend) -> bool {
    match backend {
        Backend::Sqlite => cfg!(feature = "sqlite-rusqlite"),
        Backend::Postgres => cfg!(feature = "postgres-raw"),
        Backend::MySql => cfg!(feature = "mysql-sqlx"),
    }
}

/// Checks that `config` names a compiled-in backend and carries the fields
/// that backend needs.
///
/// # Errors
///
/// * `InitDbError::UnsupportedBackend` if the backend was compiled out
/// * `InitDbError::MissingPath` for a file-backed `SQLite` config without a path
/// * `InitDbError::CredentialsRequired` for a pooled backend without a host,
///   database name or user
/// * `InitDbError::InvalidConfig` for a zero pool size, or for MySQL with
///   `ssl` set in a build without the `tls` feature
pub fn validate(config: &DatabaseConfig) -> Result<(), InitDbError> {
    if !is_backend_enabled(config.backend) {
        return Err(InitDbError::UnsupportedBackend(config.backend.to_string()));
    }

    match config.backend {
        Backend::Sqlite => {
            if !config.in_memory && config.path.is_none() {
                return Err(InitDbError::MissingPath);
            }
        }
        Backend::Postgres | Backend::MySql => {
            config.credentials()?;

            if config.pool_size == 0 {
                return Err(InitDbError::InvalidConfig(
                    "pool size must be at least 1".to_string(),
                ));
            }

            if config.backend == Backend::MySql && config.ssl && !cfg!(feature = "tls") {
                return Err(InitDbError::InvalidConfig(
                    "mysql ssl requires the tls feature".to_string(),
                ));
            }
        }
    }

    Ok(())
}

/// Owns the single connection (or pool) of the process.
///
/// The backend is chosen once, when the factory is built. [`create`] connects
/// on first use and hands out the same adapter afterwards until [`close`] is
/// called.
///
/// [`create`]: ConnectionFactory::create
/// [`close`]: ConnectionFactory::close
#[derive(Debug)]
pub struct ConnectionFactory {
    backend: Backend,
    config: Option<DatabaseConfig>,
    database: Mutex<Option<SharedDatabase>>,
}

impl ConnectionFactory {
    /// # Errors
    ///
    /// * Anything [`validate`] rejects
    pub fn new(config: DatabaseConfig) -> Result<Self, InitDbError> {
        validate(&config)?;

        Ok(Self {
            backend: config.backend,
            config: Some(config),
            database: Mutex::new(None),
        })
    }

    /// Wraps an adapter that is already connected, such as a simulator or a
    /// test double. Once closed, such a factory cannot reconnect.
    #[must_use]
    pub fn from_database(database: Box<dyn Database>) -> Self {
        Self {
            backend: database.backend(),
            config: None,
            database: Mutex::new(Some(Arc::new(database))),
        }
    }

    #[must_use]
    pub const fn backend(&self) -> Backend {
        self.backend
    }

    #[must_use]
    pub const fn config(&self) -> Option<&DatabaseConfig> {
        self.config.as_ref()
    }

    /// Connects on the first call and returns the shared adapter.
    ///
    /// # Errors
    ///
    /// * If the connection cannot be established
    /// * `DatabaseError::Closed` for a [`ConnectionFactory::from_database`]
    ///   factory that was already closed
    pub async fn create(&self) -> Result<SharedDatabase, InitDbError> {
        let mut database = self.database.lock().await;

        if let Some(existing) = database.as_ref() {
            return Ok(existing.clone());
        }

        let Some(config) = &self.config else {
            return Err(InitDbError::Connection(DatabaseError::Closed));
        };

        log::debug!("create: Connecting to {} database", self.backend);
        let created: SharedDatabase = Arc::new(init(config).await?);
        *database = Some(created.clone());
        drop(database);

        Ok(created)
    }

    /// The adapter from a previous [`ConnectionFactory::create`], if any.
    pub async fn get(&self) -> Option<SharedDatabase> {
        self.database.lock().await.clone()
    }

    /// Closes and forgets the current adapter. Does nothing when there is none.
    ///
    /// # Errors
    ///
    /// * If the adapter fails to shut down cleanly
    pub async fn close(&self) -> Result<(), InitDbError> {
        let database = self.database.lock().await.take();

        if let Some(database) = database {
            log::debug!("close: Closing {} database", self.backend);
            database.close().await?;
        }

        Ok(())
    }
}

/// Opens a connection for `config` without going through a factory.
///
/// # Errors
///
/// * Anything [`validate`] rejects
/// * If the connection cannot be established
pub async fn init(config: &DatabaseConfig) -> Result<Box<dyn Database>, InitDbError> {
    validate(config)?;

    match config.backend {
        #[cfg(feature = "sqlite-rusqlite")]
        Backend::Sqlite => match &config.path {
            Some(path) if !config.in_memory => init_sqlite(path),
            _ => init_sqlite_memory(),
        },
        #[cfg(feature = "postgres-raw")]
        Backend::Postgres => init_postgres(config).await,
        #[cfg(feature = "mysql-sqlx")]
        Backend::MySql => init_mysql_sqlx(config).await,
        #[allow(unreachable_patterns)]
        backend => Err(InitDbError::UnsupportedBackend(backend.to_string())),
    }
}

/// Opens (creating if needed) the `SQLite` database file at `db_location`.
///
/// Missing parent directories are created first.
///
/// # Errors
///
/// * `InitDbError::Io` if the parent directory cannot be created
/// * `InitDbError::Connection` if the file cannot be opened
#[cfg(feature = "sqlite-rusqlite")]
pub fn init_sqlite(db_location: &std::path::Path) -> Result<Box<dyn Database>, InitDbError> {
    use taskboard_database::rusqlite::RusqliteDatabase;

    if let Some(parent) = db_location.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            log::debug!("init_sqlite: Creating {}", parent.display());
            std::fs::create_dir_all(parent)?;
        }
    }

    Ok(Box::new(RusqliteDatabase::open(db_location)?))
}

/// # Errors
///
/// * `InitDbError::Connection` if the in-memory database cannot be opened
#[cfg(feature = "sqlite-rusqlite")]
pub fn init_sqlite_memory() -> Result<Box<dyn Database>, InitDbError> {
    use taskboard_database::rusqlite::RusqliteDatabase;

    Ok(Box::new(RusqliteDatabase::open_in_memory()?))
}

/// Builds a `deadpool-postgres` pool from `config` and checks out one client
/// to verify the server is reachable.
///
/// # Errors
///
/// * `InitDbError::CredentialsRequired` if the host, database name or user
///   is missing
/// * `InitDbError::InvalidConfig` if `ssl` is set but TLS support was not
///   compiled in
/// * If the pool cannot be created or the first connection fails
#[cfg(feature = "postgres-raw")]
pub async fn init_postgres(config: &DatabaseConfig) -> Result<Box<dyn Database>, InitDbError> {
    use deadpool_postgres::{PoolConfig, Runtime};
    use taskboard_database::postgres::postgres::PostgresDatabase;

    let creds = config.credentials()?;

    let mut cfg = deadpool_postgres::Config::new();
    cfg.host = Some(creds.host.clone());
    cfg.port = creds.port;
    cfg.dbname = Some(creds.name);
    cfg.user = Some(creds.user);
    cfg.password = creds.password;
    cfg.connect_timeout = config.connect_timeout;

    let mut pool_config = PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = config.connect_timeout;
    pool_config.timeouts.create = config.connect_timeout;
    pool_config.timeouts.recycle = config.idle_timeout;
    cfg.pool = Some(pool_config);

    let pool = if config.ssl {
        cfg.ssl_mode = Some(deadpool_postgres::SslMode::Require);
        create_tls_pool(&cfg, &creds.host)?
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)
            .map_err(InitPostgresError::CreatePool)?
    };

    Ok(Box::new(PostgresDatabase::connect(pool).await?))
}

#[cfg(feature = "postgres-native-tls")]
fn create_tls_pool(
    cfg: &deadpool_postgres::Config,
    host: &str,
) -> Result<deadpool_postgres::Pool, InitDbError> {
    let mut builder = native_tls::TlsConnector::builder();

    match host.to_lowercase().as_str() {
        "localhost" | "127.0.0.1" | "0.0.0.0" => {
            builder.danger_accept_invalid_hostnames(true);
        }
        _ => {}
    }

    let connector =
        postgres_native_tls::MakeTlsConnector::new(builder.build().map_err(InitPostgresError::NativeTls)?);

    Ok(cfg
        .create_pool(Some(deadpool_postgres::Runtime::Tokio1), connector)
        .map_err(InitPostgresError::CreatePool)?)
}

#[cfg(all(feature = "postgres-raw", not(feature = "postgres-native-tls")))]
fn create_tls_pool(
    _cfg: &deadpool_postgres::Config,
    _host: &str,
) -> Result<deadpool_postgres::Pool, InitDbError> {
    Err(InitDbError::InvalidConfig(
        "ssl requires the postgres-native-tls feature".to_string(),
    ))
}

/// Builds a `sqlx` MySQL pool from `config` and opens its first connection.
///
/// # Errors
///
/// * `InitDbError::CredentialsRequired` if the host, database name or user
///   is missing
/// * `InitDbError::Connection` if the server is unreachable
#[cfg(feature = "mysql-sqlx")]
pub async fn init_mysql_sqlx(config: &DatabaseConfig) -> Result<Box<dyn Database>, InitDbError> {
    use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlSslMode};
    use taskboard_database::sqlx::mysql::MySqlSqlxDatabase;

    let creds = config.credentials()?;

    let mut options = MySqlConnectOptions::new()
        .host(&creds.host)
        .database(&creds.name)
        .username(&creds.user)
        .ssl_mode(if config.ssl {
            MySqlSslMode::Required
        } else {
            MySqlSslMode::Preferred
        });

    if let Some(port) = creds.port {
        options = options.port(port);
    }
    if let Some(password) = &creds.password {
        options = options.password(password);
    }

    let mut pool_options = MySqlPoolOptions::new()
        .max_connections(u32::try_from(config.pool_size).unwrap_or(u32::MAX))
        .idle_timeout(config.idle_timeout);

    if let Some(timeout) = config.connect_timeout {
        pool_options = pool_options.acquire_timeout(timeout);
    }

    Ok(Box::new(
        MySqlSqlxDatabase::connect(options, pool_options).await?,
    ))
}
