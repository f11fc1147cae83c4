//! Database backends using the `SQLx` library

#[cfg(feature = "mysql-sqlx")]
/// `MySQL` database backend using `SQLx`
pub mod mysql;
