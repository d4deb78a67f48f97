//! # baton-fidelity
//!
//! Fidelity tracking for Baton orchestration.
//!
//! The tracker subscribes to every event on the channel, turns each one into
//! success/failure samples per operation category and validates the rolling
//! success ratios against configured floors.

mod tracker;

pub use tracker::{CategoryFidelity, FidelityReport, FidelityTracker, OperationCategory};
