//! # baton-handoff
//!
//! Context handoffs between workers, backed by a preservation store that
//! keeps a snapshot of every handed-off context for restore and rollback.

mod manager;
mod preservation;

pub use manager::{Handoff, HandoffManager, HandoffStatus};
pub use preservation::{ContextPreservationStore, ContextSnapshot};
