use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use conductor_core::error::{ConductorError, Result};
use conductor_core::feedback::{Feedback, FeedbackKind, RoutingPreference, TrainingExemplar};
use conductor_core::traits::{CheckpointStore, FeedbackStore};
use conductor_core::types::{Checkpoint, ExecutionId, ExecutionRecord};

#[derive(Default)]
struct Inner {
    checkpoints: HashMap<ExecutionId, Vec<Checkpoint>>,
    records: HashMap<ExecutionId, ExecutionRecord>,
    feedback: Vec<Feedback>,
    feedback_keys: HashSet<(String, String, FeedbackKind)>,
    exemplars: Vec<TrainingExemplar>,
    preferences: HashMap<String, Vec<RoutingPreference>>,
}

/// Process-local store for ephemeral runs and tests. Same semantics as
/// `SqliteStore`, nothing survives a restart.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| ConductorError::Database(e.to_string()))
    }

    /// Number of checkpoints held for an execution.
    pub fn checkpoint_count(&self, execution_id: &ExecutionId) -> usize {
        self.lock()
            .map(|inner| inner.checkpoints.get(execution_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Every checkpoint of an execution, in save order.
    pub fn checkpoints(&self, execution_id: &ExecutionId) -> Vec<Checkpoint> {
        self.lock()
            .ok()
            .and_then(|inner| inner.checkpoints.get(execution_id).cloned())
            .unwrap_or_default()
    }

    pub fn feedback_count(&self) -> usize {
        self.lock().map(|inner| inner.feedback.len()).unwrap_or(0)
    }
}

impl CheckpointStore for InMemoryStore {
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let checkpoint = checkpoint.clone();
        Box::pin(async move {
            self.lock()?
                .checkpoints
                .entry(checkpoint.execution_id.clone())
                .or_default()
                .push(checkpoint);
            Ok(())
        })
    }

    fn load_checkpoint(
        &self,
        execution_id: &ExecutionId,
    ) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let execution_id = execution_id.clone();
        Box::pin(async move {
            Ok(self
                .lock()?
                .checkpoints
                .get(&execution_id)
                .and_then(|cps| cps.iter().max_by_key(|c| c.sequence).cloned()))
        })
    }

    fn save_record(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            self.lock()?
                .records
                .insert(record.execution_id.clone(), record);
            Ok(())
        })
    }

    fn load_record(
        &self,
        execution_id: &ExecutionId,
    ) -> BoxFuture<'_, Result<Option<ExecutionRecord>>> {
        let execution_id = execution_id.clone();
        Box::pin(async move { Ok(self.lock()?.records.get(&execution_id).cloned()) })
    }

    fn list_records(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>> {
        Box::pin(async move {
            let mut records: Vec<ExecutionRecord> =
                self.lock()?.records.values().cloned().collect();
            records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            records.truncate(limit);
            Ok(records)
        })
    }

    fn delete_checkpoints(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<usize>> {
        let execution_id = execution_id.clone();
        Box::pin(async move {
            Ok(self
                .lock()?
                .checkpoints
                .remove(&execution_id)
                .map_or(0, |cps| cps.len()))
        })
    }
}

impl FeedbackStore for InMemoryStore {
    fn append_feedback(&self, feedback: &Feedback) -> BoxFuture<'_, Result<bool>> {
        let feedback = feedback.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;
            let key = (
                feedback.request_id.clone(),
                feedback.capability.clone(),
                feedback.kind,
            );
            if !inner.feedback_keys.insert(key) {
                return Ok(false);
            }
            inner.feedback.push(feedback);
            Ok(true)
        })
    }

    fn append_correction(
        &self,
        feedback: &Feedback,
        exemplar: &TrainingExemplar,
    ) -> BoxFuture<'_, Result<bool>> {
        let feedback = feedback.clone();
        let exemplar = exemplar.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;
            let key = (
                feedback.request_id.clone(),
                feedback.capability.clone(),
                feedback.kind,
            );
            if !inner.feedback_keys.insert(key) {
                return Ok(false);
            }
            inner.feedback.push(feedback);
            inner.exemplars.push(exemplar);
            Ok(true)
        })
    }

    fn query_feedback(
        &self,
        founder_id: &str,
        capability: Option<&str>,
        since: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Feedback>>> {
        let founder_id = founder_id.to_string();
        let capability = capability.map(String::from);
        Box::pin(async move {
            let mut rows: Vec<Feedback> = self
                .lock()?
                .feedback
                .iter()
                .filter(|f| f.founder_id == founder_id && f.created_at >= since)
                .filter(|f| capability.as_ref().map_or(true, |c| &f.capability == c))
                .cloned()
                .collect();
            rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(rows)
        })
    }

    fn save_exemplar(&self, exemplar: &TrainingExemplar) -> BoxFuture<'_, Result<()>> {
        let exemplar = exemplar.clone();
        Box::pin(async move {
            self.lock()?.exemplars.push(exemplar);
            Ok(())
        })
    }

    fn list_exemplars(
        &self,
        founder_id: &str,
        capability: Option<&str>,
    ) -> BoxFuture<'_, Result<Vec<TrainingExemplar>>> {
        let founder_id = founder_id.to_string();
        let capability = capability.map(String::from);
        Box::pin(async move {
            Ok(self
                .lock()?
                .exemplars
                .iter()
                .filter(|e| e.founder_id == founder_id)
                .filter(|e| capability.as_ref().map_or(true, |c| &e.capability == c))
                .cloned()
                .collect())
        })
    }

    fn save_preferences(
        &self,
        founder_id: &str,
        preferences: &[RoutingPreference],
    ) -> BoxFuture<'_, Result<()>> {
        let founder_id = founder_id.to_string();
        let preferences = preferences.to_vec();
        Box::pin(async move {
            self.lock()?.preferences.insert(founder_id, preferences);
            Ok(())
        })
    }

    fn load_preferences(&self, founder_id: &str) -> BoxFuture<'_, Result<Vec<RoutingPreference>>> {
        let founder_id = founder_id.to_string();
        Box::pin(async move {
            Ok(self
                .lock()?
                .preferences
                .get(&founder_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn list_founders(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let mut founders: Vec<String> = self
                .lock()?
                .feedback
                .iter()
                .map(|f| f.founder_id.clone())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            founders.sort();
            Ok(founders)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use conductor_core::feedback::FeedbackSubmission;

    #[tokio::test]
    async fn test_duplicate_feedback_not_inserted() {
        let store = InMemoryStore::new();
        let a = FeedbackSubmission::rating("crm", 4.0)
            .into_feedback("e1", "f1", "w1")
            .unwrap();
        let b = FeedbackSubmission::rating("crm", 1.0)
            .into_feedback("e1", "f1", "w1")
            .unwrap();
        assert!(store.append_feedback(&a).await.unwrap());
        assert!(!store.append_feedback(&b).await.unwrap());
        assert_eq!(store.feedback_count(), 1);

        let rows = store
            .query_feedback("f1", None, Utc::now() - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(rows[0].rating, 4.0);
    }

    #[tokio::test]
    async fn test_correction_and_exemplar_written_together() {
        let store = InMemoryStore::new();
        let mut corrected = conductor_core::types::Payload::new();
        corrected.insert("summary".into(), serde_json::json!("fixed"));
        let fb = FeedbackSubmission::correction("generate", corrected.clone())
            .into_feedback("e1", "f1", "w1")
            .unwrap();
        let exemplar = TrainingExemplar {
            request_id: "e1".into(),
            capability: "generate".into(),
            founder_id: "f1".into(),
            input: None,
            wrong_output: None,
            corrected_output: corrected,
            created_at: Utc::now(),
        };

        assert!(store.append_correction(&fb, &exemplar).await.unwrap());
        assert!(!store.append_correction(&fb, &exemplar).await.unwrap());
        assert_eq!(store.feedback_count(), 1);
        assert_eq!(store.list_exemplars("f1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_latest_checkpoint_by_sequence() {
        let store = InMemoryStore::new();
        let id = ExecutionId::from_string("e1");
        for (seq, node) in [(2u64, "b"), (1, "a")] {
            store
                .save_checkpoint(&Checkpoint {
                    execution_id: id.clone(),
                    sequence: seq,
                    node_id: node.into(),
                    variables: Default::default(),
                    statuses: Default::default(),
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.checkpoint_count(&id), 2);
        assert_eq!(store.load_checkpoint(&id).await.unwrap().unwrap().node_id, "b");
        assert_eq!(store.delete_checkpoints(&id).await.unwrap(), 2);
        assert_eq!(store.checkpoint_count(&id), 0);
    }
}
