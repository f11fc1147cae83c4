//! `PostgreSQL` database backend implementation
//!
//! Sessions come from a `deadpool-postgres` pool. A transaction checks one
//! session out and keeps it until it is committed or rolled back.

#[allow(clippy::module_inception)]
pub mod postgres;
