//! Voting sessions and their resolution

use baton_core::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A choice workers can vote for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteOption {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl VoteOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            value: serde_json::Value::Null,
        }
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = value;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub worker_id: WorkerId,
    pub option_id: String,
    pub weight: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    /// Closed without reaching consensus
    Closed,
    /// Closed with a winning option
    Resolved,
}

/// A group decision in progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotingSession {
    pub id: String,
    pub topic: String,
    pub options: Vec<VoteOption>,
    pub votes: Vec<Vote>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<usize>,
    pub created_at: DateTime<Utc>,
}

impl VotingSession {
    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }

    pub fn has_option(&self, option_id: &str) -> bool {
        self.options.iter().any(|o| o.id == option_id)
    }

    pub fn has_voted(&self, worker_id: &str) -> bool {
        self.votes.iter().any(|v| v.worker_id == worker_id)
    }
}

/// How a closed session picks its winner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsensusAlgorithm {
    /// Most votes wins; reached when the winner has more than half the votes
    SimpleMajority,
    /// Most weight wins; reached when the winner has more than half the weight
    WeightedMajority,
    /// Reached when the winner holds at least `threshold` of the votes
    Supermajority,
    /// Reached when every registered worker voted the same way and the cast
    /// weight is at least `threshold` of all registered weight
    ConsensusThreshold,
}

impl ConsensusAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimpleMajority => "simple-majority",
            Self::WeightedMajority => "weighted-majority",
            Self::Supermajority => "supermajority",
            Self::ConsensusThreshold => "consensus-threshold",
        }
    }
}

impl std::fmt::Display for ConsensusAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConsensusAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple-majority" => Ok(Self::SimpleMajority),
            "weighted-majority" => Ok(Self::WeightedMajority),
            "supermajority" => Ok(Self::Supermajority),
            "consensus-threshold" => Ok(Self::ConsensusThreshold),
            _ => Err(format!("Unknown consensus algorithm: {}", s)),
        }
    }
}

/// Votes received by one option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionTally {
    pub option_id: String,
    pub votes: usize,
    pub weight: f64,
}

/// Outcome of closing a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusResult {
    pub session_id: String,
    pub winning_option: Option<String>,
    pub confidence: f64,
    /// In option declaration order
    pub distribution: Vec<OptionTally>,
    pub consensus_reached: bool,
    pub algorithm: ConsensusAlgorithm,
    pub explanation: String,
    pub resolved_at: DateTime<Utc>,
}

/// Per-option counts and weights, in declaration order
pub fn tally(session: &VotingSession) -> Vec<OptionTally> {
    session
        .options
        .iter()
        .map(|option| {
            let votes: Vec<&Vote> = session
                .votes
                .iter()
                .filter(|v| v.option_id == option.id)
                .collect();
            OptionTally {
                option_id: option.id.clone(),
                votes: votes.len(),
                weight: votes.iter().map(|v| v.weight).sum(),
            }
        })
        .collect()
}

/// Index of the largest value; earliest wins ties
fn leader(values: impl Iterator<Item = f64>) -> Option<(usize, f64)> {
    values.enumerate().fold(None, |best, (idx, value)| match best {
        Some((_, top)) if value <= top => best,
        _ => Some((idx, value)),
    })
}

/// Resolve a session's votes under `algorithm`
///
/// `registered` maps every currently registered worker to its vote weight and
/// is only consulted by [`ConsensusAlgorithm::ConsensusThreshold`].
pub fn resolve(
    session: &VotingSession,
    algorithm: ConsensusAlgorithm,
    threshold: f64,
    registered: &HashMap<WorkerId, f64>,
    now: DateTime<Utc>,
) -> ConsensusResult {
    let distribution = tally(session);
    let mut result = ConsensusResult {
        session_id: session.id.clone(),
        winning_option: None,
        confidence: 0.0,
        distribution,
        consensus_reached: false,
        algorithm,
        explanation: String::new(),
        resolved_at: now,
    };

    let cast = session.votes.len();
    if let Some(quorum) = session.quorum {
        if cast < quorum {
            result.explanation = format!("Quorum not met: {} of {} required votes cast", cast, quorum);
            return result;
        }
    }
    if cast == 0 || result.distribution.is_empty() {
        result.explanation = "No votes cast".to_string();
        return result;
    }

    let total_votes = cast as f64;
    let total_weight: f64 = session.votes.iter().map(|v| v.weight).sum();
    let by_count = leader(result.distribution.iter().map(|t| t.votes as f64));
    let by_weight = leader(result.distribution.iter().map(|t| t.weight));

    let (reached, idx, confidence, explanation) = match algorithm {
        ConsensusAlgorithm::SimpleMajority => {
            let (idx, count) = by_count.unwrap_or_default();
            let reached = count > total_votes / 2.0;
            (
                reached,
                idx,
                count / total_votes,
                format!("{} of {} votes", count as usize, cast),
            )
        }
        ConsensusAlgorithm::WeightedMajority => {
            let (idx, weight) = by_weight.unwrap_or_default();
            let share = if total_weight > 0.0 { weight / total_weight } else { 0.0 };
            (
                weight > total_weight / 2.0,
                idx,
                share,
                format!("{:.2} of {:.2} vote weight", weight, total_weight),
            )
        }
        ConsensusAlgorithm::Supermajority => {
            let (idx, weight) = by_weight.unwrap_or_default();
            let share = if total_weight > 0.0 { weight / total_weight } else { 0.0 };
            (
                total_weight > 0.0 && weight >= threshold * total_weight,
                idx,
                share,
                format!(
                    "{:.2} of {:.2} vote weight against a {:.0}% threshold",
                    weight,
                    total_weight,
                    threshold * 100.0
                ),
            )
        }
        ConsensusAlgorithm::ConsensusThreshold => {
            let (idx, _) = by_count.unwrap_or_default();
            let option_id = &result.distribution[idx].option_id;
            let unanimous = session.votes.iter().all(|v| &v.option_id == option_id);
            let registered_voted = registered
                .keys()
                .filter(|id| session.has_voted(id))
                .count();
            let everyone_voted = !registered.is_empty() && registered_voted == registered.len();
            // Votes from workers that have since left do not count
            let cast_weight: f64 = session
                .votes
                .iter()
                .filter(|v| registered.contains_key(&v.worker_id))
                .map(|v| v.weight)
                .sum();
            let registered_weight: f64 = registered.values().sum();
            let share = if registered_weight > 0.0 {
                (cast_weight / registered_weight).min(1.0)
            } else {
                0.0
            };
            (
                unanimous && everyone_voted && share >= threshold,
                idx,
                if unanimous { share } else { 0.0 },
                format!(
                    "{} of {} registered workers voted, unanimous: {}, weight share {:.2} against {:.2}",
                    registered_voted,
                    registered.len(),
                    unanimous,
                    share,
                    threshold
                ),
            )
        }
    };

    result.confidence = confidence.clamp(0.0, 1.0);
    result.consensus_reached = reached;
    if reached {
        let winner = result.distribution[idx].option_id.clone();
        result.explanation = format!("{} won under {}: {}", winner, algorithm, explanation);
        result.winning_option = Some(winner);
    } else {
        result.explanation = format!("No consensus under {}: {}", algorithm, explanation);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(workers: &[(&str, f64)]) -> HashMap<WorkerId, f64> {
        workers.iter().map(|(w, weight)| (w.to_string(), *weight)).collect()
    }

    fn uniform(ids: &[&str]) -> HashMap<WorkerId, f64> {
        ids.iter().map(|w| (w.to_string(), 1.0)).collect()
    }

    fn session(votes: &[(&str, &str, f64)]) -> VotingSession {
        let now = Utc::now();
        VotingSession {
            id: "s-1".into(),
            topic: "pick".into(),
            options: vec![VoteOption::new("a", "A"), VoteOption::new("b", "B")],
            votes: votes
                .iter()
                .map(|(w, o, weight)| Vote {
                    worker_id: w.to_string(),
                    option_id: o.to_string(),
                    weight: *weight,
                    timestamp: now,
                    rationale: None,
                })
                .collect(),
            status: SessionStatus::Open,
            quorum: None,
            created_at: now,
        }
    }

    #[test]
    fn test_simple_majority() {
        let s = session(&[("w1", "a", 1.0), ("w2", "a", 1.0), ("w3", "b", 1.0)]);
        let result = resolve(&s, ConsensusAlgorithm::SimpleMajority, 0.67, &uniform(&["w1", "w2", "w3"]), Utc::now());

        assert!(result.consensus_reached);
        assert_eq!(result.winning_option.as_deref(), Some("a"));
        assert!((result.confidence - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.distribution[0].votes, 2);
        assert_eq!(result.distribution[1].votes, 1);
    }

    #[test]
    fn test_split_vote_not_reached() {
        let s = session(&[("w1", "a", 1.0), ("w2", "b", 1.0)]);
        let result = resolve(&s, ConsensusAlgorithm::SimpleMajority, 0.67, &uniform(&["w1", "w2"]), Utc::now());

        assert!(!result.consensus_reached);
        assert_eq!(result.winning_option, None);
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn test_weighted_majority_outvotes_count() {
        let s = session(&[("w1", "a", 1.0), ("w2", "a", 1.0), ("w3", "b", 5.0)]);
        let result = resolve(&s, ConsensusAlgorithm::WeightedMajority, 0.67, &uniform(&["w1", "w2", "w3"]), Utc::now());

        assert!(result.consensus_reached);
        assert_eq!(result.winning_option.as_deref(), Some("b"));
    }

    #[test]
    fn test_supermajority_threshold() {
        let two_of_three = session(&[("w1", "a", 1.0), ("w2", "a", 1.0), ("w3", "b", 1.0)]);
        let result = resolve(&two_of_three, ConsensusAlgorithm::Supermajority, 0.67, &uniform(&["w1", "w2", "w3"]), Utc::now());
        assert!(!result.consensus_reached);

        let three_of_four = session(&[
            ("w1", "a", 1.0),
            ("w2", "a", 1.0),
            ("w3", "a", 1.0),
            ("w4", "b", 1.0),
        ]);
        let result = resolve(&three_of_four, ConsensusAlgorithm::Supermajority, 0.67, &uniform(&["w1", "w2", "w3", "w4"]), Utc::now());
        assert!(result.consensus_reached);
    }

    #[test]
    fn test_consensus_threshold_requires_everyone() {
        let s = session(&[("w1", "a", 1.0), ("w2", "a", 1.0)]);

        let missing_voter = resolve(
            &s,
            ConsensusAlgorithm::ConsensusThreshold,
            0.67,
            &uniform(&["w1", "w2", "w3"]),
            Utc::now(),
        );
        assert!(!missing_voter.consensus_reached);

        let all_in = resolve(
            &s,
            ConsensusAlgorithm::ConsensusThreshold,
            0.67,
            &uniform(&["w1", "w2"]),
            Utc::now(),
        );
        assert!(all_in.consensus_reached);
        assert_eq!(all_in.confidence, 1.0);
    }

    #[test]
    fn test_consensus_threshold_ignores_departed_voters() {
        // w1 voted and then left, w4 joined and never voted
        let s = session(&[("w1", "a", 1.0), ("w2", "a", 1.0), ("w3", "a", 1.0)]);
        let registered = uniform(&["w2", "w3", "w4"]);
        let result = resolve(&s, ConsensusAlgorithm::ConsensusThreshold, 0.67, &registered, Utc::now());

        assert!(!result.consensus_reached);
        assert!(result.explanation.contains("2 of 3 registered workers voted"));
    }

    #[test]
    fn test_consensus_threshold_weighs_registered_voters_only() {
        let s = session(&[("w1", "a", 5.0), ("w2", "a", 1.0)]);
        let registered = registry(&[("w1", 5.0), ("w2", 1.0)]);
        let result = resolve(&s, ConsensusAlgorithm::ConsensusThreshold, 0.67, &registered, Utc::now());
        assert!(result.consensus_reached);

        let empty = resolve(&s, ConsensusAlgorithm::ConsensusThreshold, 0.67, &HashMap::new(), Utc::now());
        assert!(!empty.consensus_reached);
    }

    #[test]
    fn test_supermajority_measures_weight() {
        let s = session(&[("w1", "a", 1.0), ("w2", "a", 1.0), ("w3", "b", 5.0)]);
        let result = resolve(
            &s,
            ConsensusAlgorithm::Supermajority,
            0.67,
            &registry(&[("w1", 1.0), ("w2", 1.0), ("w3", 5.0)]),
            Utc::now(),
        );

        assert!(result.consensus_reached);
        assert_eq!(result.winning_option.as_deref(), Some("b"));
        assert!((result.confidence - 5.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_quorum_shortfall() {
        let mut s = session(&[("w1", "a", 1.0)]);
        s.quorum = Some(3);
        let result = resolve(&s, ConsensusAlgorithm::SimpleMajority, 0.67, &uniform(&["w1"]), Utc::now());

        assert!(!result.consensus_reached);
        assert!(result.explanation.contains("Quorum"));
    }

    #[test]
    fn test_tie_goes_to_first_option() {
        let s = session(&[("w1", "b", 1.0), ("w2", "a", 1.0), ("w3", "a", 1.0), ("w4", "b", 1.0)]);
        let result = resolve(&s, ConsensusAlgorithm::Supermajority, 0.5, &uniform(&["w1", "w2", "w3", "w4"]), Utc::now());

        assert!(result.consensus_reached);
        assert_eq!(result.winning_option.as_deref(), Some("a"));
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(
            "consensus-threshold".parse::<ConsensusAlgorithm>().unwrap(),
            ConsensusAlgorithm::ConsensusThreshold
        );
        assert_eq!(
            serde_json::to_string(&ConsensusAlgorithm::WeightedMajority).unwrap(),
            "\"weighted-majority\""
        );
    }
}
