//! # baton-orchestrator
//!
//! Wires the Baton components into one pipeline.
//!
//! This crate provides:
//! - [`Orchestrator`], owning the event channel, router, consensus engine,
//!   handoff manager, recovery and fidelity tracker
//! - The [`WorkerExecutor`] seam the host implements to actually run tasks
//! - A bounded [`ExecutionPool`] and a deterministic [`ScriptedExecutor`]

mod executor;
mod orchestrator;

pub use executor::{ExecutionPool, ScriptedExecutor, WorkerExecutor};
pub use orchestrator::{MaintenanceReport, Orchestrator, TaskOutcome};
