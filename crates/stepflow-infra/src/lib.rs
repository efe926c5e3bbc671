//! Infrastructure layer for stepflow.
//!
//! Implements the store traits defined in `stepflow-core` on top of SQLite,
//! and loads the engine configuration from disk.

pub mod config;
pub mod sqlite;
