//! Helpers for the `taskboard-migrate` binary.

pub mod database;
