use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handler input/output and graph variables: string keys, JSON values.
pub type Payload = HashMap<String, serde_json::Value>;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a single node within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of a graph run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Every node reached a terminal state and the entry node did not fail.
    Completed,
    /// The entry node failed.
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Quality flag attached to a node whose output went through reflection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QualityFlag {
    /// Passed every check on the first try.
    Clean,
    /// Passed after `iterations` rounds of self-correction.
    Corrected { iterations: usize, resolved: Vec<String> },
    /// Still failing after the correction budget was spent.
    Unresolved { iterations: usize, issues: Vec<String> },
}

impl QualityFlag {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Unresolved { .. })
    }
}

/// Per-node entry in an execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    /// Capability actually invoked (may differ from the declared one when
    /// preference-aware routing picked an alternative).
    pub capability: String,
    pub status: NodeStatus,
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub quality: Option<QualityFlag>,
    #[serde(default)]
    pub input: Option<Payload>,
    #[serde(default)]
    pub output: Option<Payload>,
}

impl NodeRecord {
    pub fn pending(node_id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            capability: capability.into(),
            status: NodeStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            error: None,
            quality: None,
            input: None,
            output: None,
        }
    }
}

/// One graph run. Node entries are kept in topological order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub graph_id: String,
    pub founder_id: String,
    pub workspace_id: String,
    pub status: RunStatus,
    pub nodes: Vec<NodeRecord>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub final_state: Option<Payload>,
}

impl ExecutionRecord {
    pub fn node(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut NodeRecord> {
        self.nodes.iter_mut().find(|n| n.node_id == node_id)
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.node(node_id).map(|n| n.status)
    }

    /// Node statuses in topological order.
    pub fn status_sequence(&self) -> Vec<(String, NodeStatus)> {
        self.nodes
            .iter()
            .map(|n| (n.node_id.clone(), n.status))
            .collect()
    }
}

/// State snapshot persisted after a node reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: ExecutionId,
    /// Monotonic per-execution sequence number.
    pub sequence: u64,
    /// The node whose completion produced this checkpoint.
    pub node_id: String,
    pub variables: Payload,
    pub statuses: BTreeMap<String, NodeStatus>,
    pub timestamp: DateTime<Utc>,
}

/// Context passed to handlers for each invocation.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub founder_id: String,
    pub workspace_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Triggered when the run is cancelled.
    pub cancel: CancellationToken,
}

/// Execution event broadcast to all subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Graph run started.
    RunStarted {
        execution_id: ExecutionId,
        graph_id: String,
    },
    /// A node moved to a new status.
    NodeStatusChanged {
        execution_id: ExecutionId,
        node_id: String,
        status: NodeStatus,
        attempt: u32,
    },
    /// A node attempt failed and will be retried after a backoff.
    NodeRetrying {
        execution_id: ExecutionId,
        node_id: String,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    /// Reflection finished for a node.
    ReflectionFinished {
        execution_id: ExecutionId,
        node_id: String,
        quality: QualityFlag,
    },
    /// Graph run finished.
    RunComplete {
        execution_id: ExecutionId,
        status: RunStatus,
        elapsed_ms: u64,
    },
    /// Routing preferences were rebuilt for a founder.
    PreferencesRefreshed {
        founder_id: String,
        avoided: Vec<String>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> Option<&ExecutionId> {
        match self {
            Self::RunStarted { execution_id, .. }
            | Self::NodeStatusChanged { execution_id, .. }
            | Self::NodeRetrying { execution_id, .. }
            | Self::ReflectionFinished { execution_id, .. }
            | Self::RunComplete { execution_id, .. } => Some(execution_id),
            Self::PreferencesRefreshed { .. } => None,
        }
    }
}
