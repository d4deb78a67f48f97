//! # baton-router
//!
//! Task routing for Baton orchestration.
//!
//! This crate provides:
//! - The worker registry, owned by [`TaskRouter`]
//! - Expertise/workload scoring with atomic capacity reservation
//! - Routing memory for sticky re-routing within a time window

mod memory;
mod router;

pub use memory::RoutingMemory;
pub use router::{expertise_match, TaskRouter};
