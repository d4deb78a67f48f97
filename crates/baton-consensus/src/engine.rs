//! Consensus engine: voting sessions among registered workers

use baton_core::config::ConsensusConfig;
use baton_core::{BatonError, Result, SharedClock, SharedIds, Worker, WorkerId};
use baton_events::{ConflictDetected, ConsensusResolved, EventChannel, EventPayload, OperationOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::conflict::{detect, ResolutionStrategy, StateSyncConflict};
use crate::session::{
    resolve, ConsensusAlgorithm, ConsensusResult, SessionStatus, Vote, VoteOption, VotingSession,
};
use crate::weight::{ExpertiseWeight, WeightFunction};

const COMPONENT: &str = "consensus";

/// Runs voting sessions and keeps their results and conflicts
pub struct ConsensusEngine {
    config: ConsensusConfig,
    weight_fn: Arc<dyn WeightFunction>,
    workers: RwLock<HashMap<WorkerId, Worker>>,
    sessions: RwLock<HashMap<String, Arc<Mutex<VotingSession>>>>,
    results: RwLock<HashMap<String, ConsensusResult>>,
    conflicts: RwLock<Vec<StateSyncConflict>>,
    events: EventChannel,
    clock: SharedClock,
    ids: SharedIds,
}

impl ConsensusEngine {
    pub fn new(
        config: ConsensusConfig,
        events: EventChannel,
        clock: SharedClock,
        ids: SharedIds,
    ) -> Self {
        Self {
            config,
            weight_fn: Arc::new(ExpertiseWeight),
            workers: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            conflicts: RwLock::new(Vec::new()),
            events,
            clock,
            ids,
        }
    }

    /// Replace the default expertise-based vote weighting
    pub fn with_weight_function(mut self, weight_fn: Arc<dyn WeightFunction>) -> Self {
        self.weight_fn = weight_fn;
        self
    }

    pub async fn register_worker(&self, worker: Worker) {
        debug!(worker = %worker.id, "Registered voter");
        self.workers.write().await.insert(worker.id.clone(), worker);
    }

    pub async fn unregister_worker(&self, worker_id: &str) -> Option<Worker> {
        self.workers.write().await.remove(worker_id)
    }

    async fn session_handle(&self, session_id: &str) -> Result<Arc<Mutex<VotingSession>>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| BatonError::UnknownSession(session_id.to_string()))
    }

    fn transition(&self, operation: &str, error: Option<String>) {
        let mut outcome = OperationOutcome::new(operation);
        if let Some(error) = error {
            outcome = outcome.with_error(error);
        }
        self.events
            .publish(COMPONENT, EventPayload::state_transition(outcome));
    }

    /// Open a new session over `options`
    pub async fn create_session(
        &self,
        topic: impl Into<String>,
        options: Vec<VoteOption>,
        quorum: Option<usize>,
    ) -> Result<VotingSession> {
        if options.is_empty() {
            return Err(BatonError::Validation(
                "a voting session needs at least one option".into(),
            ));
        }
        for (i, option) in options.iter().enumerate() {
            if options[..i].iter().any(|o| o.id == option.id) {
                return Err(BatonError::Validation(format!(
                    "duplicate option id: {}",
                    option.id
                )));
            }
        }
        if quorum == Some(0) {
            return Err(BatonError::Validation("quorum must be at least 1".into()));
        }

        let session = VotingSession {
            id: self.ids.next_id("session"),
            topic: topic.into(),
            options,
            votes: Vec::new(),
            status: SessionStatus::Open,
            quorum,
            created_at: self.clock.now(),
        };

        info!(session = %session.id, topic = %session.topic, "Created voting session");
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::new(Mutex::new(session.clone())));
        self.transition("session.open", None);
        Ok(session)
    }

    /// Import a session persisted elsewhere, replacing any with the same id
    pub async fn load_session(&self, session: VotingSession) {
        debug!(session = %session.id, votes = session.votes.len(), "Loaded voting session");
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::new(Mutex::new(session)));
    }

    /// Record a vote
    ///
    /// Returns `Ok(false)` when the session is no longer open, the option is
    /// unknown or the worker has already voted.
    #[instrument(skip(self, rationale))]
    pub async fn cast_vote(
        &self,
        session_id: &str,
        worker_id: &str,
        option_id: &str,
        rationale: Option<String>,
    ) -> Result<bool> {
        let handle = self.session_handle(session_id).await?;
        let weight = {
            let workers = self.workers.read().await;
            let worker = workers
                .get(worker_id)
                .ok_or_else(|| BatonError::UnknownWorker(worker_id.to_string()))?;
            self.weight_fn.weight(worker)
        };

        let mut session = handle.lock().await;
        if !session.is_open() {
            debug!("Session closed, vote rejected");
            return Ok(false);
        }
        if !session.has_option(option_id) {
            debug!("Unknown option, vote rejected");
            return Ok(false);
        }
        if session.has_voted(worker_id) {
            debug!("Worker already voted");
            return Ok(false);
        }

        session.votes.push(Vote {
            worker_id: worker_id.to_string(),
            option_id: option_id.to_string(),
            weight,
            timestamp: self.clock.now(),
            rationale,
        });
        Ok(true)
    }

    /// Close a session and compute its result
    ///
    /// `threshold` defaults to the configured supermajority threshold and is
    /// used by supermajority and consensus-threshold.
    #[instrument(skip(self))]
    pub async fn close_session(
        &self,
        session_id: &str,
        algorithm: ConsensusAlgorithm,
        threshold: Option<f64>,
    ) -> Result<ConsensusResult> {
        let threshold = threshold.unwrap_or(self.config.default_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(BatonError::Validation(format!(
                "threshold must be within [0, 1], got {}",
                threshold
            )));
        }

        let handle = self.session_handle(session_id).await?;
        let mut session = handle.lock().await;
        if !session.is_open() {
            self.transition(
                "session.close",
                Some(format!("session {} is already closed", session_id)),
            );
            return Err(BatonError::SessionClosed(session_id.to_string()));
        }
        session.status = SessionStatus::Closed;

        let now = self.clock.now();
        let found = detect(&session, self.config.conflict_window(), now, || {
            self.ids.next_id("conflict")
        });
        if !found.is_empty() {
            warn!(count = found.len(), "Voting conflicts detected");
            for conflict in &found {
                self.events.publish(
                    COMPONENT,
                    EventPayload::ConflictDetected(ConflictDetected {
                        conflict_id: conflict.id.clone(),
                        session_id: conflict.session_id.clone(),
                        kind: conflict.kind.to_string(),
                        agent_ids: conflict.worker_ids.clone(),
                    }),
                );
            }
            self.conflicts.write().await.extend(found);
        }

        let registered: HashMap<WorkerId, f64> = self
            .workers
            .read()
            .await
            .values()
            .map(|w| (w.id.clone(), self.weight_fn.weight(w)))
            .collect();
        let result = resolve(&session, algorithm, threshold, &registered, now);
        if result.consensus_reached {
            session.status = SessionStatus::Resolved;
        }

        info!(
            winner = ?result.winning_option,
            confidence = result.confidence,
            reached = result.consensus_reached,
            "Closed voting session"
        );
        self.results
            .write()
            .await
            .insert(session_id.to_string(), result.clone());
        self.transition("session.close", None);
        self.events.publish(
            COMPONENT,
            EventPayload::ConsensusResolved(ConsensusResolved {
                session_id: session_id.to_string(),
                topic: session.topic.clone(),
                winning_option: result.winning_option.clone(),
                confidence: result.confidence,
                consensus_reached: result.consensus_reached,
                method: algorithm.to_string(),
            }),
        );
        Ok(result)
    }

    /// Settle a recorded conflict. Each conflict can be resolved once.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        details: Option<String>,
    ) -> Result<StateSyncConflict> {
        let mut conflicts = self.conflicts.write().await;
        let conflict = conflicts
            .iter_mut()
            .find(|c| c.id == conflict_id)
            .ok_or_else(|| BatonError::UnknownConflict(conflict_id.to_string()))?;

        if conflict.is_resolved() {
            return Err(BatonError::ConflictAlreadyResolved(conflict_id.to_string()));
        }

        conflict.resolution = Some(strategy);
        conflict.details = details;
        conflict.resolved_at = Some(self.clock.now());
        info!(conflict = %conflict_id, ?strategy, "Resolved conflict");
        let resolved = conflict.clone();
        drop(conflicts);

        self.transition("conflict.resolve", None);
        Ok(resolved)
    }

    pub async fn session(&self, session_id: &str) -> Option<VotingSession> {
        let handle = self.session_handle(session_id).await.ok()?;
        let session = handle.lock().await;
        Some(session.clone())
    }

    pub async fn result(&self, session_id: &str) -> Option<ConsensusResult> {
        self.results.read().await.get(session_id).cloned()
    }

    /// Recorded conflicts, optionally limited to one session
    pub async fn conflicts(&self, session_id: Option<&str>) -> Vec<StateSyncConflict> {
        self.conflicts
            .read()
            .await
            .iter()
            .filter(|c| session_id.map_or(true, |id| c.session_id == id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictKind;
    use baton_core::{ManualClock, SequentialIds};
    use chrono::Duration;

    async fn engine() -> (ConsensusEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let ids: SharedIds = Arc::new(SequentialIds::new());
        let events = EventChannel::new(&Default::default(), clock.clone(), ids.clone());
        let engine = ConsensusEngine::new(ConsensusConfig::default(), events, clock.clone(), ids);
        for id in ["w1", "w2", "w3"] {
            engine.register_worker(Worker::new(id, id, 1)).await;
        }
        (engine, clock)
    }

    fn options() -> Vec<VoteOption> {
        vec![VoteOption::new("A", "Option A"), VoteOption::new("B", "Option B")]
    }

    async fn vote(engine: &ConsensusEngine, clock: &ManualClock, session: &str, worker: &str, option: &str) -> bool {
        clock.advance(Duration::seconds(1));
        engine.cast_vote(session, worker, option, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_simple_majority_two_of_three() {
        let (engine, clock) = engine().await;
        let session = engine.create_session("merge strategy", options(), None).await.unwrap();

        assert!(vote(&engine, &clock, &session.id, "w1", "A").await);
        assert!(vote(&engine, &clock, &session.id, "w2", "A").await);
        assert!(vote(&engine, &clock, &session.id, "w3", "B").await);

        let result = engine
            .close_session(&session.id, ConsensusAlgorithm::SimpleMajority, None)
            .await
            .unwrap();

        assert_eq!(result.winning_option.as_deref(), Some("A"));
        assert!((result.confidence - 0.667).abs() < 0.001);
        assert!(result.consensus_reached);
        assert_eq!(
            engine.session(&session.id).await.unwrap().status,
            SessionStatus::Resolved
        );
        assert_eq!(engine.result(&session.id).await, Some(result));
        assert!(engine.conflicts(Some(&session.id)).await.is_empty());
    }

    #[tokio::test]
    async fn test_one_vote_per_worker() {
        let (engine, clock) = engine().await;
        let session = engine.create_session("t", options(), None).await.unwrap();

        assert!(vote(&engine, &clock, &session.id, "w1", "A").await);
        assert!(!vote(&engine, &clock, &session.id, "w1", "B").await);
        assert!(!vote(&engine, &clock, &session.id, "w2", "Z").await);
        assert_eq!(engine.session(&session.id).await.unwrap().votes.len(), 1);
    }

    #[tokio::test]
    async fn test_vote_validation_errors() {
        let (engine, _) = engine().await;
        let session = engine.create_session("t", options(), None).await.unwrap();

        assert!(matches!(
            engine.cast_vote("missing", "w1", "A", None).await,
            Err(BatonError::UnknownSession(_))
        ));
        assert!(matches!(
            engine.cast_vote(&session.id, "stranger", "A", None).await,
            Err(BatonError::UnknownWorker(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_session_rejects_votes_and_second_close() {
        let (engine, clock) = engine().await;
        let session = engine.create_session("t", options(), None).await.unwrap();
        engine
            .close_session(&session.id, ConsensusAlgorithm::SimpleMajority, None)
            .await
            .unwrap();

        assert!(!vote(&engine, &clock, &session.id, "w1", "A").await);
        assert!(matches!(
            engine
                .close_session(&session.id, ConsensusAlgorithm::SimpleMajority, None)
                .await,
            Err(BatonError::SessionClosed(_))
        ));
        assert_eq!(
            engine.session(&session.id).await.unwrap().status,
            SessionStatus::Closed
        );
    }

    #[tokio::test]
    async fn test_quorum_shortfall() {
        let (engine, clock) = engine().await;
        let session = engine.create_session("t", options(), Some(3)).await.unwrap();
        vote(&engine, &clock, &session.id, "w1", "A").await;
        vote(&engine, &clock, &session.id, "w2", "A").await;

        let result = engine
            .close_session(&session.id, ConsensusAlgorithm::SimpleMajority, None)
            .await
            .unwrap();
        assert!(!result.consensus_reached);
        assert!(result.explanation.contains("Quorum not met"));
    }

    #[tokio::test]
    async fn test_weighted_by_expertise() {
        let (engine, clock) = engine().await;
        engine
            .register_worker(Worker::new("expert", "Expert", 1).with_expertise(["a", "b", "c", "d"]))
            .await;
        let session = engine.create_session("t", options(), None).await.unwrap();

        vote(&engine, &clock, &session.id, "w1", "A").await;
        vote(&engine, &clock, &session.id, "w2", "A").await;
        vote(&engine, &clock, &session.id, "expert", "B").await;

        let result = engine
            .close_session(&session.id, ConsensusAlgorithm::WeightedMajority, None)
            .await
            .unwrap();
        assert_eq!(result.winning_option.as_deref(), Some("B"));
        assert_eq!(result.distribution[1].weight, 4.0);
    }

    #[tokio::test]
    async fn test_consensus_threshold_after_roster_change() {
        let (engine, clock) = engine().await;
        let session = engine.create_session("t", options(), None).await.unwrap();
        for worker in ["w1", "w2", "w3"] {
            vote(&engine, &clock, &session.id, worker, "A").await;
        }
        engine.register_worker(Worker::new("w4", "w4", 1)).await;
        engine.unregister_worker("w1").await;

        // Three ballots against three registered workers, but w4 never voted
        let result = engine
            .close_session(&session.id, ConsensusAlgorithm::ConsensusThreshold, None)
            .await
            .unwrap();
        assert!(!result.consensus_reached);
        assert_eq!(result.winning_option, None);
    }

    #[tokio::test]
    async fn test_near_simultaneous_votes_recorded() {
        let (engine, clock) = engine().await;
        let session = engine.create_session("t", options(), None).await.unwrap();

        engine.cast_vote(&session.id, "w1", "A", None).await.unwrap();
        clock.advance(Duration::milliseconds(20));
        engine.cast_vote(&session.id, "w2", "B", None).await.unwrap();

        engine
            .close_session(&session.id, ConsensusAlgorithm::SimpleMajority, None)
            .await
            .unwrap();

        let conflicts = engine.conflicts(Some(&session.id)).await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::NearSimultaneous);

        let resolved = engine
            .resolve_conflict(&conflicts[0].id, ResolutionStrategy::Negotiate, Some("agreed".into()))
            .await
            .unwrap();
        assert!(resolved.resolved_at.is_some());
        assert!(matches!(
            engine
                .resolve_conflict(&conflicts[0].id, ResolutionStrategy::Merge, None)
                .await,
            Err(BatonError::ConflictAlreadyResolved(_))
        ));
        // Conflicts are kept after resolution
        assert_eq!(engine.conflicts(None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_vote_in_loaded_session() {
        let (engine, clock) = engine().await;
        let mut session = engine.create_session("t", options(), None).await.unwrap();
        let now = chrono::Utc::now();
        for (worker, option, offset) in [("w1", "A", 0), ("w1", "B", 5)] {
            session.votes.push(Vote {
                worker_id: worker.into(),
                option_id: option.into(),
                weight: 1.0,
                timestamp: now + Duration::seconds(offset),
                rationale: None,
            });
        }
        engine.load_session(session.clone()).await;
        clock.advance(Duration::seconds(10));

        engine
            .close_session(&session.id, ConsensusAlgorithm::SimpleMajority, None)
            .await
            .unwrap();
        let conflicts = engine.conflicts(None).await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::DuplicateVote);
    }

    #[tokio::test]
    async fn test_create_session_validation() {
        let (engine, _) = engine().await;
        assert!(engine.create_session("t", vec![], None).await.is_err());
        assert!(engine
            .create_session(
                "t",
                vec![VoteOption::new("A", "x"), VoteOption::new("A", "y")],
                None
            )
            .await
            .is_err());
        assert!(engine.create_session("t", options(), Some(0)).await.is_err());
    }
}
