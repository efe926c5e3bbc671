//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` that tunes the
//! orchestrator. All fields have sensible defaults.

use serde::{Deserialize, Serialize};

/// Where a resumed execution picks up relative to its checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeBoundary {
    /// Skip every step the snapshot records as completed.
    #[default]
    AfterCheckpoint,
    /// Also re-run the step the checkpoint was taken for. Steps must be idempotent.
    AtCheckpoint,
}

/// Top-level configuration for the orchestration engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub resume_boundary: ResumeBoundary,

    /// Capacity of the broadcast channel carrying `WorkflowEvent`s.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// SQLite URL for the persistent stores. `None` selects the default location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resume_boundary: ResumeBoundary::default(),
            event_bus_capacity: default_event_bus_capacity(),
            database_url: None,
        }
    }
}
