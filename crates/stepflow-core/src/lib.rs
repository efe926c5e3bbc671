//! Workflow orchestration engine and store trait definitions for stepflow.
//!
//! This crate defines the "ports" (state and checkpoint store traits, the
//! step executor trait) and the engine built on them: graph construction,
//! graph execution, and the orchestrator façade. It depends only on
//! `stepflow-types` -- never on `stepflow-infra` or any database crate.

pub mod event;
pub mod repository;
pub mod workflow;
