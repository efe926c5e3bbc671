//! Shared domain types for stepflow.
//!
//! This crate contains the types every other crate in the workspace speaks:
//! execution and step state, step descriptors, parallel (fork-join) config,
//! checkpoints, workflow events, engine configuration, and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod step;
pub mod validation;
