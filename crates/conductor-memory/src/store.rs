use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use conductor_core::error::{ConductorError, Result};
use conductor_core::feedback::{Feedback, FeedbackKind, RoutingPreference, TrainingExemplar};
use conductor_core::traits::{CheckpointStore, FeedbackStore};
use conductor_core::types::{Checkpoint, ExecutionId, ExecutionRecord, Payload};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS checkpoints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        execution_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        node_id TEXT NOT NULL,
        variables TEXT NOT NULL,
        statuses TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_checkpoints_execution
        ON checkpoints(execution_id, sequence DESC);

    CREATE TABLE IF NOT EXISTS execution_records (
        execution_id TEXT PRIMARY KEY,
        graph_id TEXT NOT NULL,
        founder_id TEXT NOT NULL,
        status TEXT NOT NULL,
        record TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS feedback (
        id TEXT PRIMARY KEY,
        request_id TEXT NOT NULL,
        capability TEXT NOT NULL,
        kind TEXT NOT NULL,
        rating REAL NOT NULL,
        correction TEXT,
        founder_id TEXT NOT NULL,
        workspace_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE(request_id, capability, kind)
    );

    CREATE INDEX IF NOT EXISTS idx_feedback_founder
        ON feedback(founder_id, created_at);

    CREATE TABLE IF NOT EXISTS exemplars (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        request_id TEXT NOT NULL,
        capability TEXT NOT NULL,
        founder_id TEXT NOT NULL,
        input TEXT,
        wrong_output TEXT,
        corrected_output TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS preferences (
        founder_id TEXT NOT NULL,
        capability TEXT NOT NULL,
        avoid INTEGER NOT NULL,
        reason TEXT NOT NULL,
        confidence REAL NOT NULL,
        average_rating REAL NOT NULL,
        samples INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (founder_id, capability)
    );";

/// SQLite-backed store for checkpoints, execution records and feedback.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConductorError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db)?;

        // WAL for concurrent readers while the engine writes checkpoints
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| ConductorError::Database(e.to_string()))
    }
}

fn db(e: rusqlite::Error) -> ConductorError {
    ConductorError::Database(e.to_string())
}

/// Fixed-width UTC timestamps so text comparison orders correctly.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn opt_payload(text: Option<String>) -> Option<Payload> {
    text.and_then(|t| serde_json::from_str(&t).ok())
}

/// Insert a feedback row; `false` when the (request, capability, kind) key exists.
fn insert_feedback(conn: &Connection, fb: &Feedback) -> Result<bool> {
    let correction = fb.correction.as_ref().map(to_json).transpose()?;
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO feedback
             (id, request_id, capability, kind, rating, correction, founder_id, workspace_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                fb.id,
                fb.request_id,
                fb.capability,
                fb.kind.as_str(),
                fb.rating,
                correction,
                fb.founder_id,
                fb.workspace_id,
                ts(&fb.created_at),
            ],
        )
        .map_err(db)?;
    Ok(inserted > 0)
}

fn insert_exemplar(conn: &Connection, ex: &TrainingExemplar) -> Result<()> {
    let input = ex.input.as_ref().map(to_json).transpose()?;
    let wrong = ex.wrong_output.as_ref().map(to_json).transpose()?;
    let corrected = to_json(&ex.corrected_output)?;
    conn.execute(
        "INSERT INTO exemplars (request_id, capability, founder_id, input, wrong_output, corrected_output, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            ex.request_id,
            ex.capability,
            ex.founder_id,
            input,
            wrong,
            corrected,
            ts(&ex.created_at),
        ],
    )
    .map_err(db)?;
    Ok(())
}

impl CheckpointStore for SqliteStore {
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let row = (|| -> Result<_> {
            Ok((
                checkpoint.execution_id.0.clone(),
                checkpoint.sequence as i64,
                checkpoint.node_id.clone(),
                to_json(&checkpoint.variables)?,
                to_json(&checkpoint.statuses)?,
                ts(&checkpoint.timestamp),
            ))
        })();

        Box::pin(async move {
            let (execution_id, sequence, node_id, variables, statuses, timestamp) = row?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO checkpoints (execution_id, sequence, node_id, variables, statuses, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![execution_id, sequence, node_id, variables, statuses, timestamp],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn load_checkpoint(
        &self,
        execution_id: &ExecutionId,
    ) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let execution_id = execution_id.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let row = conn
                .query_row(
                    "SELECT sequence, node_id, variables, statuses, timestamp
                     FROM checkpoints
                     WHERE execution_id = ?1
                     ORDER BY sequence DESC
                     LIMIT 1",
                    params![execution_id.0],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(db)?;

            let Some((sequence, node_id, variables, statuses, timestamp)) = row else {
                return Ok(None);
            };
            Ok(Some(Checkpoint {
                execution_id,
                sequence: sequence as u64,
                node_id,
                variables: serde_json::from_str(&variables)?,
                statuses: serde_json::from_str(&statuses)?,
                timestamp: parse_ts(&timestamp),
            }))
        })
    }

    fn save_record(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let row = to_json(record).map(|json| {
            (
                record.execution_id.0.clone(),
                record.graph_id.clone(),
                record.founder_id.clone(),
                serde_json::to_value(record.status)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default(),
                json,
                ts(&record.created_at),
            )
        });

        Box::pin(async move {
            let (execution_id, graph_id, founder_id, status, json, created_at) = row?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO execution_records (execution_id, graph_id, founder_id, status, record, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(execution_id) DO UPDATE SET
                     status = excluded.status,
                     record = excluded.record,
                     updated_at = excluded.updated_at",
                params![execution_id, graph_id, founder_id, status, json, created_at, ts(&Utc::now())],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn load_record(
        &self,
        execution_id: &ExecutionId,
    ) -> BoxFuture<'_, Result<Option<ExecutionRecord>>> {
        let execution_id = execution_id.0.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let json: Option<String> = conn
                .query_row(
                    "SELECT record FROM execution_records WHERE execution_id = ?1",
                    params![execution_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;
            match json {
                Some(j) => Ok(Some(serde_json::from_str(&j)?)),
                None => Ok(None),
            }
        })
    }

    fn list_records(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT record FROM execution_records ORDER BY created_at DESC LIMIT ?1",
                )
                .map_err(db)?;
            let rows = stmt
                .query_map(params![limit as i64], |row| row.get::<_, String>(0))
                .map_err(db)?;

            let mut records = Vec::new();
            for row in rows {
                let json = row.map_err(db)?;
                records.push(serde_json::from_str(&json)?);
            }
            Ok(records)
        })
    }

    fn delete_checkpoints(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<usize>> {
        let execution_id = execution_id.0.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let deleted = conn
                .execute(
                    "DELETE FROM checkpoints WHERE execution_id = ?1",
                    params![execution_id],
                )
                .map_err(db)?;
            Ok(deleted)
        })
    }
}

impl FeedbackStore for SqliteStore {
    fn append_feedback(&self, feedback: &Feedback) -> BoxFuture<'_, Result<bool>> {
        let fb = feedback.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            insert_feedback(&conn, &fb)
        })
    }

    fn append_correction(
        &self,
        feedback: &Feedback,
        exemplar: &TrainingExemplar,
    ) -> BoxFuture<'_, Result<bool>> {
        let fb = feedback.clone();
        let ex = exemplar.clone();
        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db)?;
            if !insert_feedback(&tx, &fb)? {
                return Ok(false);
            }
            insert_exemplar(&tx, &ex)?;
            tx.commit().map_err(db)?;
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
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, request_id, capability, kind, rating, correction, founder_id, workspace_id, created_at
                     FROM feedback
                     WHERE founder_id = ?1
                       AND created_at >= ?2
                       AND (?3 IS NULL OR capability = ?3)
                     ORDER BY created_at ASC",
                )
                .map_err(db)?;
            let rows = stmt
                .query_map(params![founder_id, ts(&since), capability], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                })
                .map_err(db)?;

            let mut feedback = Vec::new();
            for row in rows {
                let (id, request_id, capability, kind, rating, correction, founder_id, workspace_id, created_at) =
                    row.map_err(db)?;
                let Some(kind) = FeedbackKind::parse(&kind) else {
                    continue;
                };
                feedback.push(Feedback {
                    id,
                    request_id,
                    capability,
                    kind,
                    rating,
                    correction: opt_payload(correction),
                    founder_id,
                    workspace_id,
                    created_at: parse_ts(&created_at),
                });
            }
            Ok(feedback)
        })
    }

    fn save_exemplar(&self, exemplar: &TrainingExemplar) -> BoxFuture<'_, Result<()>> {
        let ex = exemplar.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            insert_exemplar(&conn, &ex)
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
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT request_id, capability, founder_id, input, wrong_output, corrected_output, created_at
                     FROM exemplars
                     WHERE founder_id = ?1 AND (?2 IS NULL OR capability = ?2)
                     ORDER BY id ASC",
                )
                .map_err(db)?;
            let rows = stmt
                .query_map(params![founder_id, capability], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })
                .map_err(db)?;

            let mut exemplars = Vec::new();
            for row in rows {
                let (request_id, capability, founder_id, input, wrong, corrected, created_at) =
                    row.map_err(db)?;
                exemplars.push(TrainingExemplar {
                    request_id,
                    capability,
                    founder_id,
                    input: opt_payload(input),
                    wrong_output: opt_payload(wrong),
                    corrected_output: serde_json::from_str(&corrected)?,
                    created_at: parse_ts(&created_at),
                });
            }
            Ok(exemplars)
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
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db)?;
            tx.execute(
                "DELETE FROM preferences WHERE founder_id = ?1",
                params![founder_id],
            )
            .map_err(db)?;
            for p in &preferences {
                tx.execute(
                    "INSERT INTO preferences
                     (founder_id, capability, avoid, reason, confidence, average_rating, samples, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        founder_id,
                        p.capability,
                        p.avoid,
                        p.reason,
                        p.confidence,
                        p.average_rating,
                        p.samples as i64,
                        ts(&p.updated_at),
                    ],
                )
                .map_err(db)?;
            }
            tx.commit().map_err(db)?;
            Ok(())
        })
    }

    fn load_preferences(&self, founder_id: &str) -> BoxFuture<'_, Result<Vec<RoutingPreference>>> {
        let founder_id = founder_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT capability, avoid, reason, confidence, average_rating, samples, updated_at
                     FROM preferences WHERE founder_id = ?1 ORDER BY capability",
                )
                .map_err(db)?;
            let rows = stmt
                .query_map(params![founder_id], |row| {
                    Ok(RoutingPreference {
                        founder_id: founder_id.clone(),
                        capability: row.get(0)?,
                        avoid: row.get(1)?,
                        reason: row.get(2)?,
                        confidence: row.get(3)?,
                        average_rating: row.get(4)?,
                        samples: row.get::<_, i64>(5)? as usize,
                        updated_at: parse_ts(&row.get::<_, String>(6)?),
                    })
                })
                .map_err(db)?;
            let preferences = rows
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db)?;
            Ok(preferences)
        })
    }

    fn list_founders(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT DISTINCT founder_id FROM feedback ORDER BY founder_id")
                .map_err(db)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db)?;
            let founders = rows
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db)?;
            Ok(founders)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use chrono::Duration;
    use conductor_core::feedback::FeedbackSubmission;
    use conductor_core::types::{NodeRecord, NodeStatus, RunStatus};

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("conductor.db")).unwrap();
        (dir, store)
    }

    fn checkpoint(exec: &str, sequence: u64, node: &str) -> Checkpoint {
        let mut variables = Payload::new();
        variables.insert(node.to_string(), serde_json::json!({"seq": sequence}));
        let mut statuses = BTreeMap::new();
        statuses.insert(node.to_string(), NodeStatus::Succeeded);
        Checkpoint {
            execution_id: ExecutionId::from_string(exec),
            sequence,
            node_id: node.to_string(),
            variables,
            statuses,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_latest_checkpoint_and_delete() {
        let (_dir, store) = temp_store();
        store.save_checkpoint(&checkpoint("e1", 1, "a")).await.unwrap();
        store.save_checkpoint(&checkpoint("e1", 2, "b")).await.unwrap();
        store.save_checkpoint(&checkpoint("e2", 1, "a")).await.unwrap();

        let id = ExecutionId::from_string("e1");
        let latest = store.load_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.node_id, "b");
        assert_eq!(latest.statuses["b"], NodeStatus::Succeeded);

        assert_eq!(store.delete_checkpoints(&id).await.unwrap(), 2);
        assert!(store.load_checkpoint(&id).await.unwrap().is_none());
        assert!(store
            .load_checkpoint(&ExecutionId::from_string("e2"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_record_upsert() {
        let store = SqliteStore::in_memory().unwrap();
        let mut record = ExecutionRecord {
            execution_id: ExecutionId::from_string("e1"),
            graph_id: "g".into(),
            founder_id: "f".into(),
            workspace_id: "w".into(),
            status: RunStatus::Running,
            nodes: vec![NodeRecord::pending("a", "echo")],
            created_at: Utc::now(),
            finished_at: None,
            final_state: None,
        };
        store.save_record(&record).await.unwrap();
        record.status = RunStatus::Completed;
        record.nodes[0].status = NodeStatus::Succeeded;
        store.save_record(&record).await.unwrap();

        let loaded = store
            .load_record(&ExecutionId::from_string("e1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.nodes[0].status, NodeStatus::Succeeded);
        assert_eq!(store.list_records(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_feedback_unique_per_request_capability_kind() {
        let store = SqliteStore::in_memory().unwrap();
        let first = FeedbackSubmission::rating("crm", 4.0)
            .into_feedback("e1", "f1", "w1")
            .unwrap();
        let dup = FeedbackSubmission::rating("crm", 2.0)
            .into_feedback("e1", "f1", "w1")
            .unwrap();
        let other_kind = FeedbackSubmission::implicit("crm", conductor_core::feedback::ImplicitAction::Accepted)
            .into_feedback("e1", "f1", "w1")
            .unwrap();

        assert!(store.append_feedback(&first).await.unwrap());
        assert!(!store.append_feedback(&dup).await.unwrap());
        assert!(store.append_feedback(&other_kind).await.unwrap());

        let since = Utc::now() - Duration::days(1);
        let all = store.query_feedback("f1", None, since).await.unwrap();
        assert_eq!(all.len(), 2);
        let only_crm = store.query_feedback("f1", Some("crm"), since).await.unwrap();
        assert_eq!(only_crm.len(), 2);
        assert!(store.query_feedback("f1", Some("x"), since).await.unwrap().is_empty());
        assert_eq!(store.list_founders().await.unwrap(), vec!["f1".to_string()]);
    }

    #[tokio::test]
    async fn test_feedback_window() {
        let store = SqliteStore::in_memory().unwrap();
        let mut old = FeedbackSubmission::rating("crm", 1.0)
            .into_feedback("old", "f1", "w1")
            .unwrap();
        old.created_at = Utc::now() - Duration::days(90);
        store.append_feedback(&old).await.unwrap();

        let rows = store
            .query_feedback("f1", None, Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_preferences_replace() {
        let store = SqliteStore::in_memory().unwrap();
        let pref = |cap: &str, avoid: bool| RoutingPreference {
            founder_id: "f1".into(),
            capability: cap.into(),
            avoid,
            reason: "test".into(),
            confidence: 0.5,
            average_rating: 2.0,
            samples: 3,
            updated_at: Utc::now(),
        };
        store
            .save_preferences("f1", &[pref("a", true), pref("b", false)])
            .await
            .unwrap();
        store.save_preferences("f1", &[pref("c", true)]).await.unwrap();

        let loaded = store.load_preferences("f1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].capability, "c");
        assert!(loaded[0].avoid);
    }

    #[tokio::test]
    async fn test_correction_rolls_back_when_exemplar_insert_fails() {
        let store = SqliteStore::in_memory().unwrap();
        let mut corrected = Payload::new();
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
        let since = Utc::now() - Duration::days(1);

        store.lock().unwrap().execute_batch("DROP TABLE exemplars").unwrap();
        assert!(store.append_correction(&fb, &exemplar).await.is_err());
        assert!(store.query_feedback("f1", None, since).await.unwrap().is_empty());

        store.lock().unwrap().execute_batch(SCHEMA).unwrap();
        assert!(store.append_correction(&fb, &exemplar).await.unwrap());
        assert!(!store.append_correction(&fb, &exemplar).await.unwrap());
        assert_eq!(store.query_feedback("f1", None, since).await.unwrap().len(), 1);
        assert_eq!(store.list_exemplars("f1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exemplar_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let mut corrected = Payload::new();
        corrected.insert("summary".into(), serde_json::json!("fixed"));
        store
            .save_exemplar(&TrainingExemplar {
                request_id: "e1".into(),
                capability: "generate".into(),
                founder_id: "f1".into(),
                input: None,
                wrong_output: Some(Payload::new()),
                corrected_output: corrected,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let all = store.list_exemplars("f1", None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].input.is_none());
        assert_eq!(all[0].corrected_output["summary"], serde_json::json!("fixed"));
        assert!(store.list_exemplars("f1", Some("other")).await.unwrap().is_empty());
    }
}
