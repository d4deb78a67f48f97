//! State-sync conflicts between votes
//!
//! Conflicts are advisory: they are recorded and published but never change
//! the outcome of a session.

use baton_core::WorkerId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::session::{Vote, VotingSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// One worker voted more than once
    DuplicateVote,
    /// Two workers voted within the conflict window
    NearSimultaneous,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateVote => write!(f, "duplicate-vote"),
            Self::NearSimultaneous => write!(f, "near-simultaneous"),
        }
    }
}

/// How a conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    /// Keep both values
    Merge,
    /// Latest value wins
    Override,
    /// Revert to the state before the conflict
    Rollback,
    /// Workers agreed out of band
    Negotiate,
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "override" => Ok(Self::Override),
            "rollback" => Ok(Self::Rollback),
            "negotiate" => Ok(Self::Negotiate),
            _ => Err(format!("Unknown resolution strategy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSyncConflict {
    pub id: String,
    pub session_id: String,
    pub kind: ConflictKind,
    /// Option ids involved, one per vote
    pub values: Vec<String>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub worker_ids: Vec<WorkerId>,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl StateSyncConflict {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Scan a session's votes for conflicts
///
/// `next_id` is called once per conflict found.
pub fn detect(
    session: &VotingSession,
    window: Duration,
    now: DateTime<Utc>,
    mut next_id: impl FnMut() -> String,
) -> Vec<StateSyncConflict> {
    let mut conflicts = Vec::new();
    let mut conflict = |kind, votes: &[&Vote]| StateSyncConflict {
        id: next_id(),
        session_id: session.id.clone(),
        kind,
        values: votes.iter().map(|v| v.option_id.clone()).collect(),
        timestamps: votes.iter().map(|v| v.timestamp).collect(),
        worker_ids: votes.iter().map(|v| v.worker_id.clone()).collect(),
        detected_at: now,
        resolution: None,
        details: None,
        resolved_at: None,
    };

    // Same worker more than once, in first-vote order
    let mut by_worker: Vec<(&str, Vec<&Vote>)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for vote in &session.votes {
        match index.get(vote.worker_id.as_str()) {
            Some(&i) => by_worker[i].1.push(vote),
            None => {
                index.insert(&vote.worker_id, by_worker.len());
                by_worker.push((&vote.worker_id, vec![vote]));
            }
        }
    }
    for (_, votes) in by_worker.iter().filter(|(_, votes)| votes.len() > 1) {
        conflicts.push(conflict(ConflictKind::DuplicateVote, votes.as_slice()));
    }

    // Every pair of different workers inside the window, not just neighbours
    let mut ordered: Vec<&Vote> = session.votes.iter().collect();
    ordered.sort_by_key(|v| v.timestamp);
    for (i, first) in ordered.iter().enumerate() {
        for second in ordered[i + 1..]
            .iter()
            .take_while(|later| later.timestamp - first.timestamp < window)
        {
            if first.worker_id != second.worker_id {
                conflicts.push(conflict(ConflictKind::NearSimultaneous, &[*first, *second]));
            }
        }
    }

    conflicts
}
