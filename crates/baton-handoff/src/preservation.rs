//! Context preservation store
//!
//! Snapshots of handoff context, keyed by handoff id. Snapshots are not
//! time-bounded and outlive the handoff records they belong to; callers
//! remove them with [`ContextPreservationStore::rollback`] or by completing
//! the handoff.

use baton_core::{BatonError, Result, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Context captured when a handoff starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub handoff_id: String,
    pub task_id: TaskId,
    pub context: serde_json::Value,
    pub preserved_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ContextPreservationStore {
    snapshots: RwLock<HashMap<String, ContextSnapshot>>,
}

impl ContextPreservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a snapshot, replacing any previous one for the same handoff
    pub async fn preserve(&self, snapshot: ContextSnapshot) {
        self.snapshots
            .write()
            .await
            .insert(snapshot.handoff_id.clone(), snapshot);
    }

    /// Copy of the preserved context; the snapshot stays in place
    pub async fn restore(&self, handoff_id: &str) -> Result<serde_json::Value> {
        self.snapshots
            .read()
            .await
            .get(handoff_id)
            .map(|s| s.context.clone())
            .ok_or_else(|| BatonError::NoPreservedContext(handoff_id.to_string()))
    }

    /// Remove and return the snapshot, if any
    pub async fn take(&self, handoff_id: &str) -> Option<ContextSnapshot> {
        self.snapshots.write().await.remove(handoff_id)
    }

    /// Discard a snapshot permanently
    pub async fn rollback(&self, handoff_id: &str) -> Result<ContextSnapshot> {
        self.take(handoff_id)
            .await
            .ok_or_else(|| BatonError::NoPreservedContext(handoff_id.to_string()))
    }

    pub async fn contains(&self, handoff_id: &str) -> bool {
        self.snapshots.read().await.contains_key(handoff_id)
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(id: &str) -> ContextSnapshot {
        ContextSnapshot {
            handoff_id: id.to_string(),
            task_id: "t-1".to_string(),
            context: json!({"files": ["src/main.rs"]}),
            preserved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_restore_is_repeatable() {
        let store = ContextPreservationStore::new();
        store.preserve(snapshot("h-1")).await;

        let first = store.restore("h-1").await.unwrap();
        let second = store.restore("h-1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_rollback_discards() {
        let store = ContextPreservationStore::new();
        store.preserve(snapshot("h-1")).await;

        store.rollback("h-1").await.unwrap();
        assert!(matches!(
            store.restore("h-1").await,
            Err(BatonError::NoPreservedContext(_))
        ));
        assert!(store.rollback("h-1").await.is_err());
    }
}
