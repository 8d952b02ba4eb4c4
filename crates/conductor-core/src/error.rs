use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConductorError {
    // Definition-time errors
    #[error("Graph contains a cycle through node '{0}'")]
    CyclicGraph(String),

    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownNode { node: String, dependency: String },

    #[error("Invalid entry node: {0}")]
    InvalidEntry(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Invalid condition expression on node '{node}': {message}")]
    InvalidExpression { node: String, message: String },

    #[error("No handler registered for capability: {0}")]
    UnknownCapability(String),

    // Handler errors
    #[error("Handler timeout after {timeout_ms}ms: {capability}")]
    HandlerTimeout { capability: String, timeout_ms: u64 },

    #[error("Handler transient error: {capability}: {message}")]
    HandlerTransient { capability: String, message: String },

    #[error("Handler permanent error: {capability}: {message}")]
    HandlerPermanent { capability: String, message: String },

    // Reflection
    #[error("Validation unresolved after {iterations} correction(s): {}", issues.join("; "))]
    ValidationUnresolved {
        iterations: usize,
        issues: Vec<String>,
    },

    #[error("Execution cancelled")]
    Cancelled,

    // Collaborator errors
    #[error("Inference request failed: {0}")]
    Inference(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Invalid feedback: {0}")]
    InvalidFeedback(String),

    #[error("Cannot resume execution {execution_id}: {reason}")]
    NotResumable { execution_id: String, reason: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConductorError {
    /// Whether the engine should retry a node that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConductorError::HandlerTimeout { .. } | ConductorError::HandlerTransient { .. }
        )
    }

    /// Errors raised while validating a graph definition, before any node runs.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            ConductorError::CyclicGraph(_)
                | ConductorError::UnknownNode { .. }
                | ConductorError::InvalidEntry(_)
                | ConductorError::DuplicateNode(_)
                | ConductorError::InvalidExpression { .. }
                | ConductorError::UnknownCapability(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;

/// Error returned by a task handler.
///
/// Handlers classify their own failures; the engine retries `Transient`
/// errors and fails the node immediately on `Permanent` ones.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Attach the capability name, producing the engine-level error.
    pub fn into_conductor(self, capability: &str) -> ConductorError {
        match self {
            HandlerError::Transient(message) => ConductorError::HandlerTransient {
                capability: capability.to_string(),
                message,
            },
            HandlerError::Permanent(message) => ConductorError::HandlerPermanent {
                capability: capability.to_string(),
                message,
            },
        }
    }
}
