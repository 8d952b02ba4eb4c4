use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conductor_core::config::{EngineConfig, RetryConfig};
use conductor_core::error::{ConductorError, Result};
use conductor_core::event::EventBus;
use conductor_core::schema::OutputSchema;
use conductor_core::traits::{AgentHandler, CheckpointStore};
use conductor_core::types::{
    Checkpoint, ExecutionEvent, ExecutionId, ExecutionRecord, HandlerContext, NodeRecord,
    NodeStatus, Payload, QualityFlag, RunStatus,
};

use super::builder::ExecutableGraph;
use super::condition::RunCondition;
use super::node::NodeDefinition;
use super::state::GraphState;
use crate::learning::PreferenceSource;
use crate::reflection::{ReflectionRequest, ReflectionValidator};
use crate::registry::AgentRegistry;

/// State key prefix under which reflection results are published.
pub const QUALITY_KEY: &str = "_quality";

/// Runs validated graphs.
///
/// Each run gets one scheduler task. The scheduler dispatches every node
/// whose dependencies are terminal onto a `JoinSet` (bounded by
/// `max_parallelism`), evaluates run conditions, retries transient
/// failures with exponential backoff, and checkpoints state after every
/// node. Graph state is only written by the scheduler.
#[derive(Clone)]
pub struct GraphExecutor {
    registry: AgentRegistry,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Arc<EventBus>,
    reflection: Option<Arc<ReflectionValidator>>,
    preferences: Option<Arc<dyn PreferenceSource>>,
    config: EngineConfig,
    keep_checkpoints: bool,
}

impl GraphExecutor {
    pub fn new(
        registry: AgentRegistry,
        checkpoints: Arc<dyn CheckpointStore>,
        events: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            events,
            reflection: None,
            preferences: None,
            config,
            keep_checkpoints: false,
        }
    }

    pub fn with_reflection(mut self, validator: Arc<ReflectionValidator>) -> Self {
        self.reflection = Some(validator);
        self
    }

    pub fn with_preferences(mut self, source: Arc<dyn PreferenceSource>) -> Self {
        self.preferences = Some(source);
        self
    }

    /// Keep checkpoints after a run finishes instead of deleting them.
    pub fn keep_checkpoints(mut self, keep: bool) -> Self {
        self.keep_checkpoints = keep;
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Every declared capability must have a handler. Alternatives are
    /// optional and only used when registered.
    pub fn validate(&self, graph: &ExecutableGraph) -> Result<()> {
        for node in &graph.definition().nodes {
            if !self.registry.contains(&node.capability) {
                return Err(ConductorError::UnknownCapability(node.capability.clone()));
            }
        }
        Ok(())
    }

    /// Start a new run and return immediately.
    ///
    /// Cancelling `cancel` cancels the run.
    pub fn start(&self, graph: ExecutableGraph, cancel: CancellationToken) -> Result<RunHandle> {
        self.validate(&graph)?;

        let execution_id = ExecutionId::new();
        let definition = graph.definition();
        let state = GraphState::new(
            execution_id.clone(),
            definition.founder_id.clone(),
            definition.workspace_id.clone(),
            definition.initial_state.clone(),
        );
        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
            graph_id: graph.id().to_string(),
            founder_id: definition.founder_id.clone(),
            workspace_id: definition.workspace_id.clone(),
            status: RunStatus::Running,
            nodes: graph
                .order_indices()
                .iter()
                .map(|&i| {
                    let node = graph.node_at(i);
                    NodeRecord::pending(&node.id, &node.capability)
                })
                .collect(),
            created_at: Utc::now(),
            finished_at: None,
            final_state: None,
        };
        let statuses = vec![NodeStatus::Pending; graph.len()];

        Ok(self.launch(graph, record, state, statuses, 0, cancel))
    }

    /// Continue an interrupted run from its last checkpoint.
    ///
    /// Nodes that succeeded, failed or were skipped keep their status and
    /// are not re-run; everything else is dispatched again. Without a
    /// checkpoint the run restarts from the initial state.
    pub fn resume(
        &self,
        graph: ExecutableGraph,
        mut record: ExecutionRecord,
        checkpoint: Option<Checkpoint>,
        cancel: CancellationToken,
    ) -> Result<RunHandle> {
        self.validate(&graph)?;

        let definition = graph.definition();
        let (variables, kept, sequence) = match checkpoint {
            Some(cp) => (cp.variables, cp.statuses, cp.sequence),
            None => (definition.initial_state.clone(), BTreeMap::new(), 0),
        };

        let mut statuses = vec![NodeStatus::Pending; graph.len()];
        let mut nodes = Vec::with_capacity(graph.len());
        for &i in graph.order_indices() {
            let node = graph.node_at(i);
            let restored = kept
                .get(&node.id)
                .copied()
                .filter(|s| resumable_terminal(*s));
            let previous = record.nodes.iter().position(|n| n.node_id == node.id);
            match (restored, previous) {
                (Some(status), Some(pos)) => {
                    statuses[i] = status;
                    let mut entry = record.nodes.swap_remove(pos);
                    entry.status = status;
                    nodes.push(entry);
                }
                (Some(status), None) => {
                    statuses[i] = status;
                    let mut entry = NodeRecord::pending(&node.id, &node.capability);
                    entry.status = status;
                    nodes.push(entry);
                }
                (None, _) => nodes.push(NodeRecord::pending(&node.id, &node.capability)),
            }
        }

        record.nodes = nodes;
        record.status = RunStatus::Running;
        record.finished_at = None;
        record.final_state = None;

        let state = GraphState::new(
            record.execution_id.clone(),
            record.founder_id.clone(),
            record.workspace_id.clone(),
            variables,
        );

        info!(
            execution_id = %record.execution_id,
            restored = statuses.iter().filter(|s| s.is_terminal()).count(),
            sequence,
            "Resuming execution"
        );
        Ok(self.launch(graph, record, state, statuses, sequence, cancel))
    }

    /// Run a graph to completion.
    pub async fn run(&self, graph: ExecutableGraph) -> Result<ExecutionRecord> {
        let handle = self.start(graph, CancellationToken::new())?;
        Ok(handle.wait().await)
    }

    fn launch(
        &self,
        graph: ExecutableGraph,
        record: ExecutionRecord,
        state: GraphState,
        statuses: Vec<NodeStatus>,
        sequence: u64,
        cancel: CancellationToken,
    ) -> RunHandle {
        let execution_id = record.execution_id.clone();
        let (done_tx, done_rx) = watch::channel(false);
        let shared = Arc::new(RunShared {
            execution_id: execution_id.clone(),
            record: RwLock::new(record),
            state: RwLock::new(state),
            cancel,
            finished: done_rx,
        });

        self.events.publish(ExecutionEvent::RunStarted {
            execution_id: execution_id.clone(),
            graph_id: graph.id().to_string(),
        });
        info!(
            execution_id = %execution_id,
            graph_id = %graph.id(),
            nodes = graph.len(),
            "Execution started"
        );

        let scheduler = Scheduler {
            executor: self.clone(),
            graph: Arc::new(graph),
            shared: Arc::clone(&shared),
            statuses,
            sequence,
            started: Instant::now(),
        };
        tokio::spawn(async move {
            scheduler.drive().await;
            let _ = done_tx.send(true);
        });

        RunHandle { shared }
    }
}

/// Statuses a resumed run keeps. Cancelled and running nodes run again.
fn resumable_terminal(status: NodeStatus) -> bool {
    matches!(
        status,
        NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped
    )
}

struct RunShared {
    execution_id: ExecutionId,
    record: RwLock<ExecutionRecord>,
    state: RwLock<GraphState>,
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

/// Handle to a run in progress. Cheap to clone.
#[derive(Clone)]
pub struct RunHandle {
    shared: Arc<RunShared>,
}

impl RunHandle {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.shared.execution_id
    }

    /// Best-effort snapshot of the execution record.
    pub async fn snapshot(&self) -> ExecutionRecord {
        self.shared.record.read().await.clone()
    }

    /// Current graph variables.
    pub async fn state(&self) -> Payload {
        self.shared.state.read().await.variables().clone()
    }

    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        *self.shared.finished.borrow()
    }

    /// Flips to `true` once the run has published `RunComplete`.
    pub fn finished(&self) -> watch::Receiver<bool> {
        self.shared.finished.clone()
    }

    /// Wait for the run to finish and return the final record.
    pub async fn wait(&self) -> ExecutionRecord {
        let mut finished = self.shared.finished.clone();
        if finished.wait_for(|done| *done).await.is_err() {
            warn!(execution_id = %self.shared.execution_id, "Scheduler exited without signalling");
        }
        self.snapshot().await
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("execution_id", &self.shared.execution_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Everything a node task needs; owned so the task is `'static`.
struct NodeJob {
    index: usize,
    execution_id: ExecutionId,
    node_id: String,
    capability: String,
    handler: Arc<dyn AgentHandler>,
    input: Payload,
    founder_id: String,
    workspace_id: String,
    timeout: Duration,
    max_retries: u32,
    retry: RetryConfig,
    cancel: CancellationToken,
    events: Arc<EventBus>,
    reflection: Option<ReflectionJob>,
}

struct ReflectionJob {
    validator: Arc<ReflectionValidator>,
    context: Payload,
    schema: Option<OutputSchema>,
    instructions: Option<String>,
}

struct NodeOutcome {
    index: usize,
    status: NodeStatus,
    attempts: u32,
    output: Option<Payload>,
    error: Option<String>,
    quality: Option<QualityFlag>,
    envelope: Option<Value>,
}

impl NodeOutcome {
    fn new(index: usize, status: NodeStatus, attempts: u32) -> Self {
        Self {
            index,
            status,
            attempts,
            output: None,
            error: None,
            quality: None,
            envelope: None,
        }
    }

    fn failed(index: usize, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(index, NodeStatus::Failed, attempts)
        }
    }
}

struct Scheduler {
    executor: GraphExecutor,
    graph: Arc<ExecutableGraph>,
    shared: Arc<RunShared>,
    statuses: Vec<NodeStatus>,
    sequence: u64,
    started: Instant,
}

impl Scheduler {
    async fn drive(mut self) {
        let avoided = self.load_avoided().await;
        self.save_record().await;

        let max_parallelism = self.executor.config.max_parallelism.max(1);
        let mut in_flight: JoinSet<NodeOutcome> = JoinSet::new();

        loop {
            if self.shared.cancel.is_cancelled() {
                self.cancel_pending().await;
            } else {
                self.dispatch_ready(&mut in_flight, max_parallelism, &avoided)
                    .await;
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined {
                Ok(outcome) => self.complete(outcome).await,
                Err(e) => error!(
                    execution_id = %self.shared.execution_id,
                    error = %e,
                    "Node task aborted"
                ),
            }
        }

        self.finish().await;
    }

    /// Capabilities the founder's preferences say to avoid. Only loaded when
    /// some node opts into preference-aware routing.
    async fn load_avoided(&self) -> HashSet<String> {
        let wants = self
            .graph
            .definition()
            .nodes
            .iter()
            .any(|n| n.preference_aware && !n.alternatives.is_empty());
        match (&self.executor.preferences, wants) {
            (Some(source), true) => {
                source
                    .avoided_capabilities(&self.graph.definition().founder_id)
                    .await
            }
            _ => HashSet::new(),
        }
    }

    async fn dispatch_ready(
        &mut self,
        in_flight: &mut JoinSet<NodeOutcome>,
        max_parallelism: usize,
        avoided: &HashSet<String>,
    ) {
        let graph = Arc::clone(&self.graph);
        for &i in graph.order_indices() {
            if in_flight.len() >= max_parallelism {
                break;
            }
            if self.statuses[i] != NodeStatus::Pending {
                continue;
            }
            let deps = graph.dependency_indices(i);
            if !deps.iter().all(|&d| self.statuses[d].is_terminal()) {
                continue;
            }

            let node = graph.node_at(i);
            let run = {
                let state = self.shared.state.read().await;
                self.condition_met(i, node, &deps, &state)
            };
            if !run {
                debug!(
                    execution_id = %self.shared.execution_id,
                    node_id = %node.id,
                    condition = node.condition.as_str(),
                    "Condition not met, skipping node"
                );
                self.complete(NodeOutcome::new(i, NodeStatus::Skipped, 0))
                    .await;
                continue;
            }

            let job = self.prepare(i, node, avoided).await;
            match job {
                Ok(job) => {
                    in_flight.spawn(async move {
                        let index = job.index;
                        match AssertUnwindSafe(run_node(job)).catch_unwind().await {
                            Ok(outcome) => outcome,
                            Err(_) => NodeOutcome::failed(index, 1, "handler panicked"),
                        }
                    });
                }
                Err(e) => {
                    self.complete(NodeOutcome::failed(i, 0, e.to_string()))
                        .await;
                }
            }
        }
    }

    fn condition_met(
        &self,
        i: usize,
        node: &NodeDefinition,
        deps: &[usize],
        state: &GraphState,
    ) -> bool {
        match &node.condition {
            RunCondition::Always | RunCondition::ParallelEligible => true,
            RunCondition::IfAnyDependencySucceeded => deps
                .iter()
                .any(|&d| self.statuses[d] == NodeStatus::Succeeded),
            RunCondition::IfAnyDependencyFailed => {
                deps.iter().any(|&d| self.statuses[d] == NodeStatus::Failed)
            }
            RunCondition::IfExpression { expr } => match self.graph.expression_at(i) {
                Some(compiled) => match compiled.evaluate(state) {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(
                            execution_id = %self.shared.execution_id,
                            node_id = %node.id,
                            expr = %expr,
                            error = %e,
                            "Condition evaluation failed, treating as false"
                        );
                        false
                    }
                },
                None => false,
            },
        }
    }

    /// Pick the capability to invoke. Preference-aware nodes take the first
    /// registered, non-avoided capability among the declared one and its
    /// alternatives, and fall back to the declared capability.
    fn choose_capability(&self, node: &NodeDefinition, avoided: &HashSet<String>) -> String {
        if !node.preference_aware || node.alternatives.is_empty() {
            return node.capability.clone();
        }
        let chosen = std::iter::once(&node.capability)
            .chain(node.alternatives.iter())
            .find(|c| !avoided.contains(c.as_str()) && self.executor.registry.contains(c));
        match chosen {
            Some(c) => {
                if *c != node.capability {
                    info!(
                        execution_id = %self.shared.execution_id,
                        node_id = %node.id,
                        declared = %node.capability,
                        chosen = %c,
                        "Routing around avoided capability"
                    );
                }
                c.clone()
            }
            None => node.capability.clone(),
        }
    }

    async fn prepare(
        &mut self,
        i: usize,
        node: &NodeDefinition,
        avoided: &HashSet<String>,
    ) -> Result<NodeJob> {
        let capability = self.choose_capability(node, avoided);
        let handler = self.executor.registry.resolve(&capability)?;

        let (input, context) = {
            let state = self.shared.state.read().await;
            let input = state.resolve_input(&node.input_mapping);
            let context = node.reflection.then(|| state.variables().clone());
            (input, context)
        };

        let reflection = match (&self.executor.reflection, context) {
            (Some(validator), Some(context)) => Some(ReflectionJob {
                validator: Arc::clone(validator),
                context,
                schema: handler.output_schema(),
                instructions: node.reflection_instructions.clone(),
            }),
            _ => None,
        };

        self.statuses[i] = NodeStatus::Running;
        {
            let mut record = self.shared.record.write().await;
            if let Some(entry) = record.node_mut(&node.id) {
                entry.status = NodeStatus::Running;
                entry.capability = capability.clone();
                entry.started_at = Some(Utc::now());
                entry.input = Some(input.clone());
            }
        }
        self.executor.events.publish(ExecutionEvent::NodeStatusChanged {
            execution_id: self.shared.execution_id.clone(),
            node_id: node.id.clone(),
            status: NodeStatus::Running,
            attempt: 1,
        });
        debug!(
            execution_id = %self.shared.execution_id,
            node_id = %node.id,
            capability = %capability,
            "Dispatching node"
        );

        let definition = self.graph.definition();
        Ok(NodeJob {
            index: i,
            execution_id: self.shared.execution_id.clone(),
            node_id: node.id.clone(),
            capability,
            handler,
            input,
            founder_id: definition.founder_id.clone(),
            workspace_id: definition.workspace_id.clone(),
            timeout: Duration::from_millis(
                node.timeout_ms
                    .unwrap_or(self.executor.config.default_timeout_ms),
            ),
            max_retries: node
                .max_retries
                .unwrap_or(self.executor.config.default_max_retries),
            retry: self.executor.config.retry.clone(),
            cancel: self.shared.cancel.child_token(),
            events: Arc::clone(&self.executor.events),
            reflection,
        })
    }

    /// Record a terminal node outcome, write its output to state and
    /// persist a checkpoint before anything else is dispatched.
    async fn complete(&mut self, outcome: NodeOutcome) {
        let i = outcome.index;
        let node = self.graph.node_at(i);
        let node_id = node.id.clone();
        self.statuses[i] = outcome.status;

        if outcome.status == NodeStatus::Succeeded {
            let mut state = self.shared.state.write().await;
            if let Some(output) = &outcome.output {
                state.apply_output(&node_id, &node.output_mapping, output);
            }
            if let Some(envelope) = &outcome.envelope {
                state.set_path(&format!("{}.{}", QUALITY_KEY, node_id), envelope.clone());
            }
        }

        if let Some(quality) = &outcome.quality {
            self.executor
                .events
                .publish(ExecutionEvent::ReflectionFinished {
                    execution_id: self.shared.execution_id.clone(),
                    node_id: node_id.clone(),
                    quality: quality.clone(),
                });
        }

        {
            let mut record = self.shared.record.write().await;
            if let Some(entry) = record.node_mut(&node_id) {
                entry.status = outcome.status;
                entry.attempts = outcome.attempts;
                entry.finished_at = Some(Utc::now());
                entry.error = outcome.error.clone();
                entry.quality = outcome.quality.clone();
                entry.output = outcome.output;
            }
        }

        match outcome.status {
            NodeStatus::Failed => warn!(
                execution_id = %self.shared.execution_id,
                node_id = %node_id,
                attempts = outcome.attempts,
                error = outcome.error.as_deref().unwrap_or(""),
                "Node failed"
            ),
            status => info!(
                execution_id = %self.shared.execution_id,
                node_id = %node_id,
                status = %status,
                attempts = outcome.attempts,
                "Node finished"
            ),
        }
        self.executor.events.publish(ExecutionEvent::NodeStatusChanged {
            execution_id: self.shared.execution_id.clone(),
            node_id: node_id.clone(),
            status: outcome.status,
            attempt: outcome.attempts,
        });

        if outcome.status != NodeStatus::Cancelled {
            self.checkpoint(&node_id).await;
        }
    }

    async fn checkpoint(&mut self, node_id: &str) {
        self.sequence += 1;
        let checkpoint = Checkpoint {
            execution_id: self.shared.execution_id.clone(),
            sequence: self.sequence,
            node_id: node_id.to_string(),
            variables: self.shared.state.read().await.variables().clone(),
            statuses: self.status_map(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.executor.checkpoints.save_checkpoint(&checkpoint).await {
            warn!(
                execution_id = %self.shared.execution_id,
                node_id = %node_id,
                error = %e,
                "Failed to save checkpoint"
            );
        }
        self.save_record().await;
    }

    async fn save_record(&self) {
        let record = self.shared.record.read().await.clone();
        if let Err(e) = self.executor.checkpoints.save_record(&record).await {
            warn!(
                execution_id = %self.shared.execution_id,
                error = %e,
                "Failed to save execution record"
            );
        }
    }

    fn status_map(&self) -> BTreeMap<String, NodeStatus> {
        self.graph
            .order_indices()
            .iter()
            .map(|&i| (self.graph.node_at(i).id.clone(), self.statuses[i]))
            .collect()
    }

    async fn cancel_pending(&mut self) {
        let pending: Vec<usize> = self
            .graph
            .order_indices()
            .iter()
            .copied()
            .filter(|&i| self.statuses[i] == NodeStatus::Pending)
            .collect();
        for i in pending {
            self.complete(NodeOutcome::new(i, NodeStatus::Cancelled, 0))
                .await;
        }
    }

    async fn finish(mut self) {
        // Anything left non-terminal lost its task.
        let stranded: Vec<usize> = (0..self.statuses.len())
            .filter(|&i| !self.statuses[i].is_terminal())
            .collect();
        for i in stranded {
            let status = if self.shared.cancel.is_cancelled() {
                NodeStatus::Cancelled
            } else {
                NodeStatus::Failed
            };
            let mut outcome = NodeOutcome::new(i, status, 0);
            if status == NodeStatus::Failed {
                outcome.error = Some("node task aborted".into());
            }
            self.complete(outcome).await;
        }

        let entry = self.graph.index_of(self.graph.entry());
        let entry_failed = entry.is_some_and(|i| self.statuses[i] == NodeStatus::Failed);
        let any_cancelled = self.statuses.contains(&NodeStatus::Cancelled);
        let status = if self.shared.cancel.is_cancelled() && any_cancelled {
            RunStatus::Cancelled
        } else if entry_failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        let final_state = self.shared.state.read().await.variables().clone();
        {
            let mut record = self.shared.record.write().await;
            record.status = status;
            record.finished_at = Some(Utc::now());
            record.final_state = Some(final_state);
        }
        self.save_record().await;

        if !self.executor.keep_checkpoints && status != RunStatus::Cancelled {
            match self
                .executor
                .checkpoints
                .delete_checkpoints(&self.shared.execution_id)
                .await
            {
                Ok(n) => debug!(execution_id = %self.shared.execution_id, deleted = n, "Checkpoints removed"),
                Err(e) => warn!(execution_id = %self.shared.execution_id, error = %e, "Failed to delete checkpoints"),
            }
        }

        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        info!(
            execution_id = %self.shared.execution_id,
            status = ?status,
            elapsed_ms,
            "Execution finished"
        );
        self.executor.events.publish(ExecutionEvent::RunComplete {
            execution_id: self.shared.execution_id.clone(),
            status,
            elapsed_ms,
        });
    }
}

/// Invoke a handler with timeout and retries, then reflect on the output.
async fn run_node(job: NodeJob) -> NodeOutcome {
    let mut attempt = 0u32;
    let output = loop {
        attempt += 1;
        let ctx = HandlerContext {
            execution_id: job.execution_id.clone(),
            node_id: job.node_id.clone(),
            founder_id: job.founder_id.clone(),
            workspace_id: job.workspace_id.clone(),
            attempt,
            cancel: job.cancel.clone(),
        };
        let call = job.handler.execute(ctx, job.input.clone());
        // A handler that has already finished wins over a concurrent cancel.
        let result = tokio::select! {
            biased;
            r = tokio::time::timeout(job.timeout, call) => r,
            _ = job.cancel.cancelled() => {
                return NodeOutcome::new(job.index, NodeStatus::Cancelled, attempt);
            }
        };

        let err = match result {
            Ok(Ok(output)) => break output,
            Ok(Err(e)) => e.into_conductor(&job.capability),
            Err(_) => ConductorError::HandlerTimeout {
                capability: job.capability.clone(),
                timeout_ms: job.timeout.as_millis() as u64,
            },
        };

        if !err.is_retryable() || attempt > job.max_retries {
            return NodeOutcome::failed(job.index, attempt, err.to_string());
        }

        let backoff = job.retry.backoff(attempt - 1);
        warn!(
            execution_id = %job.execution_id,
            node_id = %job.node_id,
            capability = %job.capability,
            attempt,
            max_retries = job.max_retries,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Node attempt failed, retrying"
        );
        job.events.publish(ExecutionEvent::NodeRetrying {
            execution_id: job.execution_id.clone(),
            node_id: job.node_id.clone(),
            attempt,
            backoff_ms: backoff.as_millis() as u64,
            error: err.to_string(),
        });

        tokio::select! {
            _ = job.cancel.cancelled() => {
                return NodeOutcome::new(job.index, NodeStatus::Cancelled, attempt);
            }
            _ = tokio::time::sleep(backoff) => {}
        }
    };

    let mut outcome = NodeOutcome::new(job.index, NodeStatus::Succeeded, attempt);
    let Some(reflection) = job.reflection else {
        outcome.output = Some(output);
        return outcome;
    };

    let request = ReflectionRequest {
        capability: &job.capability,
        input: &job.input,
        context: &reflection.context,
        schema: reflection.schema.as_ref(),
        instructions: reflection.instructions.as_deref(),
    };
    let reflected = reflection
        .validator
        .validate_and_correct(request, output)
        .await;
    let quality = reflected.quality();
    if quality != QualityFlag::Clean {
        outcome.envelope = Some(reflected.envelope());
    }
    if !reflected.valid {
        outcome.error = Some(
            ConductorError::ValidationUnresolved {
                iterations: reflected.iterations,
                issues: reflected.issues.clone(),
            }
            .to_string(),
        );
    }
    outcome.quality = Some(quality);
    outcome.output = Some(reflected.output);
    outcome
}
