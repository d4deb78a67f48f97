//! # baton-recovery
//!
//! Keeps worker execution correct when individual steps fail:
//! - [`ErrorRecoveryManager`]: bounded retry with exponential backoff and
//!   primary/fallback handoff execution
//! - [`FallbackRegistry`]: pluggable degraded-service providers per
//!   operation category

mod fallback;
mod retry;

pub use fallback::{FallbackOutcome, FallbackProvider, FallbackRegistry, StaticFallback};
pub use retry::{backoff_delay, ErrorRecoveryManager, OperationContext};
