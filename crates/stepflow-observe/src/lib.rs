//! Observability setup for stepflow embedders.
//!
//! The engine crates only emit `tracing` events and spans; installing a
//! subscriber is left to the host process through [`tracing_setup`].

pub mod tracing_setup;
