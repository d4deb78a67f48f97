//! # baton-consensus
//!
//! Voting sessions for group decisions among workers.
//!
//! Sessions are resolved under one of four algorithms (simple majority,
//! weighted majority, supermajority, consensus threshold) with an optional
//! quorum. Votes that collide are recorded as advisory state-sync conflicts.

mod conflict;
mod engine;
mod session;
mod weight;

pub use conflict::{detect, ConflictKind, ResolutionStrategy, StateSyncConflict};
pub use engine::ConsensusEngine;
pub use session::{
    resolve, tally, ConsensusAlgorithm, ConsensusResult, OptionTally, SessionStatus, Vote,
    VoteOption, VotingSession,
};
pub use weight::{ExpertiseWeight, UniformWeight, WeightFunction};
