use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use conductor_core::config::AppConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::event::EventBus;
use conductor_core::feedback::{FeedbackSubmission, RoutingPreference};
use conductor_core::traits::{CheckpointStore, FeedbackStore, InferenceClient};
use conductor_core::types::{ExecutionEvent, ExecutionId, ExecutionRecord, NodeStatus, RunStatus};
use conductor_memory::InMemoryStore;

use crate::graph::{ExecutableGraph, GraphDefinition, GraphExecutor, RunHandle};
use crate::learning::LearningEngine;
use crate::reflection::ReflectionValidator;
use crate::registry::AgentRegistry;
use crate::run_log::RunLogger;
use crate::scheduler::PreferenceRefresher;

type LiveRuns = Arc<RwLock<HashMap<ExecutionId, RunHandle>>>;

/// Wires the registry, stores, inference client and event bus into an
/// [`Orchestrator`]. Missing stores default to one shared in-memory store.
pub struct OrchestratorBuilder {
    config: AppConfig,
    registry: AgentRegistry,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    feedback: Option<Arc<dyn FeedbackStore>>,
    inference: Option<Arc<dyn InferenceClient>>,
    events: Option<Arc<EventBus>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig, registry: AgentRegistry) -> Self {
        Self {
            config,
            registry,
            checkpoints: None,
            feedback: None,
            inference: None,
            events: None,
        }
    }

    /// Use one store for checkpoints, records and feedback.
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: CheckpointStore + FeedbackStore,
    {
        self.checkpoints = Some(store.clone());
        self.feedback = Some(store);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn feedback_store(mut self, store: Arc<dyn FeedbackStore>) -> Self {
        self.feedback = Some(store);
        self
    }

    /// Inference client for reflection self-correction. Without one,
    /// reflection still checks outputs but cannot correct them.
    pub fn inference(mut self, client: Arc<dyn InferenceClient>) -> Self {
        self.inference = Some(client);
        self
    }

    pub fn events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn build(self) -> Orchestrator {
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(EventBus::new(self.config.engine.event_capacity)));

        let (checkpoints, feedback) = match (self.checkpoints, self.feedback) {
            (Some(c), Some(f)) => (c, f),
            (c, f) => {
                let memory = Arc::new(InMemoryStore::new());
                let checkpoints = c.unwrap_or_else(|| memory.clone() as Arc<dyn CheckpointStore>);
                let feedback = f.unwrap_or_else(|| memory as Arc<dyn FeedbackStore>);
                (checkpoints, feedback)
            }
        };

        let learning = Arc::new(
            LearningEngine::new(feedback, self.config.learning.clone())
                .with_events(Arc::clone(&events)),
        );
        let validator = match self.inference {
            Some(client) => ReflectionValidator::new(client, self.config.reflection.clone()),
            None => ReflectionValidator::checks_only(self.config.reflection.clone()),
        };

        let executor = GraphExecutor::new(
            self.registry,
            Arc::clone(&checkpoints),
            Arc::clone(&events),
            self.config.engine.clone(),
        )
        .with_reflection(Arc::new(validator))
        .with_preferences(learning.clone())
        .keep_checkpoints(self.config.store.keep_checkpoints);

        let run_log = match &self.config.log {
            Some(log) if log.enabled => Some((self.config.log_dir(), log.level)),
            _ => None,
        };

        Orchestrator {
            executor,
            checkpoints,
            learning,
            events,
            runs: Arc::new(RwLock::new(HashMap::new())),
            run_log,
            refresh_schedule: self.config.learning.refresh_schedule.clone(),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Public entry point: submit graphs, query and cancel executions, and
/// collect feedback.
pub struct Orchestrator {
    executor: GraphExecutor,
    checkpoints: Arc<dyn CheckpointStore>,
    learning: Arc<LearningEngine>,
    events: Arc<EventBus>,
    runs: LiveRuns,
    run_log: Option<(PathBuf, u8)>,
    refresh_schedule: String,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn builder(config: AppConfig, registry: AgentRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config, registry)
    }

    /// Validate a graph and start it in the background.
    ///
    /// Definition errors (cycles, unknown nodes or capabilities, bad entry,
    /// bad expressions) are returned here and no node runs.
    pub async fn submit_graph(&self, definition: GraphDefinition) -> Result<ExecutionId> {
        let graph = ExecutableGraph::build(definition)?;
        let rx = self.events.subscribe();
        let handle = self.executor.start(graph, self.shutdown.child_token())?;
        self.track(handle, rx).await
    }

    /// Continue an execution that did not finish, from its last checkpoint.
    ///
    /// `definition` must be the graph the execution was started with.
    pub async fn resume_execution(
        &self,
        definition: GraphDefinition,
        execution_id: &ExecutionId,
    ) -> Result<ExecutionId> {
        let not_resumable = |reason: String| ConductorError::NotResumable {
            execution_id: execution_id.to_string(),
            reason,
        };

        if self.runs.read().await.contains_key(execution_id) {
            return Err(not_resumable("execution is still running".into()));
        }
        let record = self
            .checkpoints
            .load_record(execution_id)
            .await?
            .ok_or_else(|| ConductorError::ExecutionNotFound(execution_id.to_string()))?;
        if matches!(record.status, RunStatus::Completed | RunStatus::Failed) {
            return Err(not_resumable(format!(
                "execution already finished as {:?}",
                record.status
            )));
        }
        if record.graph_id != definition.id {
            return Err(not_resumable(format!(
                "execution ran graph '{}', not '{}'",
                record.graph_id, definition.id
            )));
        }

        let graph = ExecutableGraph::build(definition)?;
        let checkpoint = self.checkpoints.load_checkpoint(execution_id).await?;
        let rx = self.events.subscribe();
        let handle = self
            .executor
            .resume(graph, record, checkpoint, self.shutdown.child_token())?;
        self.track(handle, rx).await
    }

    async fn track(
        &self,
        handle: RunHandle,
        rx: broadcast::Receiver<ExecutionEvent>,
    ) -> Result<ExecutionId> {
        let execution_id = handle.execution_id().clone();

        if let Some((dir, level)) = &self.run_log {
            let logger = RunLogger::new(dir.clone(), *level);
            tokio::spawn(logger.run(
                rx,
                execution_id.clone(),
                handle.finished(),
                self.shutdown.child_token(),
            ));
        }

        self.runs
            .write()
            .await
            .insert(execution_id.clone(), handle.clone());

        let runs = Arc::clone(&self.runs);
        let id = execution_id.clone();
        tokio::spawn(async move {
            handle.wait().await;
            runs.write().await.remove(&id);
            debug!(execution_id = %id, "Execution released");
        });

        info!(execution_id = %execution_id, "Execution submitted");
        Ok(execution_id)
    }

    /// Best-effort record: live progress while running, the stored record
    /// afterwards.
    pub async fn get_execution_status(&self, execution_id: &ExecutionId) -> Result<ExecutionRecord> {
        let live = self.runs.read().await.get(execution_id).cloned();
        if let Some(handle) = live {
            return Ok(handle.snapshot().await);
        }
        self.checkpoints
            .load_record(execution_id)
            .await?
            .ok_or_else(|| ConductorError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Request cancellation. Returns `false` when the execution had already
    /// finished.
    pub async fn cancel_execution(&self, execution_id: &ExecutionId) -> Result<bool> {
        let live = self.runs.read().await.get(execution_id).cloned();
        match live {
            Some(handle) if !handle.is_finished() => {
                info!(execution_id = %execution_id, "Cancelling execution");
                handle.cancel();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                self.get_execution_status(execution_id).await?;
                Ok(false)
            }
        }
    }

    /// Wait for an execution to finish.
    pub async fn wait(&self, execution_id: &ExecutionId) -> Result<ExecutionRecord> {
        let live = self.runs.read().await.get(execution_id).cloned();
        match live {
            Some(handle) => Ok(handle.wait().await),
            None => self.get_execution_status(execution_id).await,
        }
    }

    /// Record feedback on a capability used by an execution.
    ///
    /// Returns `false` for a duplicate of already-recorded feedback.
    pub async fn submit_feedback(
        &self,
        execution_id: &ExecutionId,
        submission: FeedbackSubmission,
    ) -> Result<bool> {
        let record = self.get_execution_status(execution_id).await?;
        // Prefer a node that produced output; any match still scopes the feedback.
        let matching = || {
            record
                .nodes
                .iter()
                .filter(|n| n.capability == submission.capability)
        };
        let origin = matching()
            .find(|n| n.status == NodeStatus::Succeeded)
            .or_else(|| matching().next())
            .cloned();
        if origin.is_none() {
            return Err(ConductorError::InvalidFeedback(format!(
                "capability '{}' was not used by execution {}",
                submission.capability, execution_id
            )));
        }

        let feedback = submission.into_feedback(
            execution_id.as_str(),
            &record.founder_id,
            &record.workspace_id,
        )?;
        self.learning.record(feedback, origin.as_ref()).await
    }

    pub async fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        self.checkpoints.list_records(limit).await
    }

    pub async fn preferences(&self, founder_id: &str) -> Result<Vec<RoutingPreference>> {
        self.learning.preferences(founder_id).await
    }

    pub async fn refresh_preferences(&self, founder_id: &str) -> Result<Vec<RoutingPreference>> {
        self.learning.refresh_preferences(founder_id).await
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.executor
            .registry()
            .capabilities()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn learning(&self) -> Arc<LearningEngine> {
        Arc::clone(&self.learning)
    }

    /// Background task refreshing every founder's preferences on the
    /// configured schedule. Stops on `shutdown`.
    pub fn preference_refresher(&self) -> Result<PreferenceRefresher> {
        PreferenceRefresher::new(
            &self.refresh_schedule,
            self.learning(),
            self.shutdown.child_token(),
        )
    }

    /// Cancel every live execution and background task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeDefinition, RunCondition};
    use conductor_core::feedback::{FeedbackSubmission, ImplicitAction};
    use conductor_core::types::Payload;
    use conductor_test_utils::{payload, ScriptedHandler, Step};
    use std::time::Duration;

    fn registry() -> AgentRegistry {
        AgentRegistry::builder()
            .register(ScriptedHandler::new("crm"))
            .register(ScriptedHandler::new("email"))
            .register(
                ScriptedHandler::new("slow").with_fallback(Step::Delay(
                    Duration::from_secs(30),
                    Payload::new(),
                )),
            )
            .build()
    }

    fn graph() -> GraphDefinition {
        GraphDefinition::new("outreach", "founder-1", "ws-1", "a")
            .node(NodeDefinition::new("a", "crm"))
            .node(NodeDefinition::new("b", "email").depends_on(["a"]))
    }

    #[tokio::test]
    async fn test_submit_then_status() {
        let orchestrator = Orchestrator::builder(AppConfig::default(), registry()).build();
        let id = orchestrator.submit_graph(graph()).await.unwrap();

        let record = orchestrator.wait(&id).await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);

        // Finished runs are served from the store.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stored = orchestrator.get_execution_status(&id).await.unwrap();
        assert_eq!(stored.status_of("b"), Some(NodeStatus::Succeeded));
        assert!(!orchestrator.cancel_execution(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_definition_errors_are_synchronous() {
        let orchestrator = Orchestrator::builder(AppConfig::default(), registry()).build();
        let cyclic = GraphDefinition::new("loop", "f", "w", "a")
            .node(NodeDefinition::new("a", "crm"))
            .node(NodeDefinition::new("b", "crm").depends_on(["a", "c"]))
            .node(NodeDefinition::new("c", "crm").depends_on(["b"]));
        let err = orchestrator.submit_graph(cyclic).await.unwrap_err();
        assert!(err.is_definition_error());
        assert!(orchestrator.list_executions(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let orchestrator = Orchestrator::builder(AppConfig::default(), registry()).build();
        let missing = ExecutionId::from_string("nope");
        assert!(matches!(
            orchestrator.get_execution_status(&missing).await,
            Err(ConductorError::ExecutionNotFound(_))
        ));
        assert!(orchestrator.cancel_execution(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_running_execution() {
        let orchestrator = Orchestrator::builder(AppConfig::default(), registry()).build();
        let def = GraphDefinition::new("slow", "f", "w", "a").node(NodeDefinition::new("a", "slow"));
        let id = orchestrator.submit_graph(def).await.unwrap();

        assert!(orchestrator.cancel_execution(&id).await.unwrap());
        let record = orchestrator.wait(&id).await.unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);
        assert_eq!(record.status_of("a"), Some(NodeStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_feedback_is_idempotent_and_scoped() {
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = Orchestrator::builder(AppConfig::default(), registry())
            .store(store.clone())
            .build();
        let id = orchestrator.submit_graph(graph()).await.unwrap();
        orchestrator.wait(&id).await.unwrap();

        let submission = FeedbackSubmission::implicit("email", ImplicitAction::Ignored);
        assert!(orchestrator.submit_feedback(&id, submission.clone()).await.unwrap());
        assert!(!orchestrator.submit_feedback(&id, submission).await.unwrap());
        assert_eq!(store.feedback_count(), 1);

        let foreign = FeedbackSubmission::rating("calendar", 4.0);
        assert!(matches!(
            orchestrator.submit_feedback(&id, foreign).await,
            Err(ConductorError::InvalidFeedback(_))
        ));
    }

    #[tokio::test]
    async fn test_correction_stores_exemplar() {
        let orchestrator = Orchestrator::builder(AppConfig::default(), registry()).build();
        let id = orchestrator.submit_graph(graph()).await.unwrap();
        orchestrator.wait(&id).await.unwrap();

        let corrected = payload(serde_json::json!({"subject": "Follow-up on pricing"}));
        orchestrator
            .submit_feedback(&id, FeedbackSubmission::correction("email", corrected))
            .await
            .unwrap();

        let exemplars = orchestrator
            .learning()
            .exemplars("founder-1", Some("email"))
            .await
            .unwrap();
        assert_eq!(exemplars.len(), 1);
        assert_eq!(exemplars[0].request_id, id.as_str());
        assert!(exemplars[0].wrong_output.is_some());
    }

    #[tokio::test]
    async fn test_correction_prefers_succeeded_node() {
        let orchestrator = Orchestrator::builder(AppConfig::default(), registry()).build();
        // "b" sorts first but is skipped; "c" uses the same capability and runs.
        let def = GraphDefinition::new("outreach", "founder-1", "ws-1", "a")
            .node(NodeDefinition::new("a", "crm"))
            .node(
                NodeDefinition::new("b", "email")
                    .depends_on(["a"])
                    .with_condition(RunCondition::IfAnyDependencyFailed),
            )
            .node(NodeDefinition::new("c", "email").depends_on(["a"]));
        let id = orchestrator.submit_graph(def).await.unwrap();
        let record = orchestrator.wait(&id).await.unwrap();
        assert_eq!(record.status_of("b"), Some(NodeStatus::Skipped));
        assert_eq!(record.nodes.iter().position(|n| n.node_id == "b"), Some(1));

        let corrected = payload(serde_json::json!({"subject": "Better subject"}));
        assert!(orchestrator
            .submit_feedback(&id, FeedbackSubmission::correction("email", corrected))
            .await
            .unwrap());

        let exemplars = orchestrator
            .learning()
            .exemplars("founder-1", Some("email"))
            .await
            .unwrap();
        assert_eq!(exemplars.len(), 1);
        assert_eq!(exemplars[0].wrong_output, record.node("c").unwrap().output);
        assert!(exemplars[0].wrong_output.is_some());
    }

    #[tokio::test]
    async fn test_resume_rejects_finished_execution() {
        let orchestrator = Orchestrator::builder(AppConfig::default(), registry()).build();
        let id = orchestrator.submit_graph(graph()).await.unwrap();
        orchestrator.wait(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = orchestrator.resume_execution(graph(), &id).await.unwrap_err();
        assert!(matches!(err, ConductorError::NotResumable { .. }));
    }

    #[tokio::test]
    async fn test_run_log_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.store.data_dir = dir.path().display().to_string();
        config.log = Some(conductor_core::config::LogConfig {
            enabled: true,
            log_dir: None,
            level: 2,
        });
        let orchestrator = Orchestrator::builder(config, registry()).build();
        let id = orchestrator.submit_graph(graph()).await.unwrap();
        orchestrator.wait(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let run_dir = dir.path().join("logs").join(id.as_str());
        let file = std::fs::read_dir(&run_dir).unwrap().next().unwrap().unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        assert!(text.lines().next().unwrap().contains("run_started"));
        assert!(text.lines().last().unwrap().contains("run_complete"));
    }
}
