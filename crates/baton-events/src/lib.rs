//! # baton-events
//!
//! Typed publish/subscribe channel for Baton orchestration.
//!
//! Every component talks to every other component, and to the host, through
//! this channel:
//! - Typed event payloads with dotted wire names (`task.created`, ...)
//! - Filterable subscriptions with unsubscribe handles
//! - Bounded-concurrency, order-preserving dispatch
//! - Handler failures isolated and resurfaced as `system.error`

mod channel;
mod event;
mod filter;

pub use channel::{
    handler_fn, ChannelStats, EventChannel, EventHandler, FnHandler, Subscription,
    CHANNEL_COMPONENT,
};
pub use event::{
    ConflictDetected, ConsensusResolved, Event, EventPayload, EventTarget, EventType,
    HandoffInitiated, HandoffSettled, OperationOutcome, PerformanceMetric, SystemError,
    TaskCreated, TaskRouted, ToolExecution,
};
pub use filter::EventFilter;
