//! # baton-core
//!
//! Core types for the Baton multi-agent orchestration core.
//!
//! Every other Baton crate builds on what lives here:
//!
//! - Workers, tasks and routing decisions
//! - The unified [`BatonError`] taxonomy
//! - [`BatonConfig`], loaded from `.baton/config.toml`
//! - Injectable [`Clock`] and [`IdGenerator`] seams so tests can run
//!   deterministically without real delays

pub mod clock;
pub mod config;
mod error;
mod types;

pub use clock::{Clock, IdGenerator, ManualClock, SequentialIds, SharedClock, SharedIds, SystemClock, UuidIds};
pub use config::BatonConfig;
pub use error::{BatonError, Result};
pub use types::*;
