//! Workflow engine core.
//!
//! - `definition` -- YAML parsing and step list validation
//! - `graph` -- sequential / fork-join graph construction
//! - `step_executor` -- the step executor seam and kind dispatch
//! - `executor` -- dependency-ordered graph execution with checkpoints
//! - `orchestrator` -- execute, resume, inspect, and cancel executions
//! - `validation` -- post-execution output checks

pub mod definition;
pub mod executor;
pub mod graph;
pub mod orchestrator;
pub mod step_executor;
pub mod validation;
