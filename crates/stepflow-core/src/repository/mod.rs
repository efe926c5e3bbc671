//! Store trait definitions (ports) and their in-memory adapters.
//!
//! The traits define the storage interface the infrastructure layer
//! (stepflow-infra) implements with SQLite. The in-memory adapters back tests
//! and single-process embedders that do not need durability.

pub mod checkpoint;
pub mod memory;
pub mod state;
