use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::{HandlerError, Result};
use crate::feedback::{Feedback, RoutingPreference, TrainingExemplar};
use crate::schema::OutputSchema;
use crate::types::*;

/// Agent handler: one specialized capability the engine can route to.
pub trait AgentHandler: Send + Sync + 'static {
    /// Capability-type this handler serves (registry key).
    fn capability(&self) -> &str;

    /// Run the handler on a mapped input payload.
    ///
    /// Handlers should watch `ctx.cancel` for long operations.
    fn execute(
        &self,
        ctx: HandlerContext,
        input: Payload,
    ) -> BoxFuture<'_, std::result::Result<Payload, HandlerError>>;

    /// Schema the output is checked against when reflection is enabled.
    fn output_schema(&self) -> Option<OutputSchema> {
        None
    }
}

/// Text generation backend used for self-correction.
pub trait InferenceClient: Send + Sync + 'static {
    /// Generate a completion for a single prompt. Errors are transient.
    fn generate(&self, prompt: String) -> BoxFuture<'_, Result<String>>;
}

/// Checkpoint and execution-record persistence.
pub trait CheckpointStore: Send + Sync + 'static {
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>>;

    /// Latest checkpoint (highest sequence) for an execution.
    fn load_checkpoint(&self, execution_id: &ExecutionId)
        -> BoxFuture<'_, Result<Option<Checkpoint>>>;

    /// Upsert an execution record.
    fn save_record(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>>;

    fn load_record(&self, execution_id: &ExecutionId)
        -> BoxFuture<'_, Result<Option<ExecutionRecord>>>;

    /// Most recent records first.
    fn list_records(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>>;

    /// Drop every checkpoint of an execution; returns how many were removed.
    fn delete_checkpoints(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<usize>>;
}

/// Feedback, exemplar and preference persistence.
pub trait FeedbackStore: Send + Sync + 'static {
    /// Append a feedback row. Returns `false` when a row with the same
    /// (request id, capability, kind) already exists.
    fn append_feedback(&self, feedback: &Feedback) -> BoxFuture<'_, Result<bool>>;

    /// Append a correction row and its exemplar as one unit. On error
    /// neither is stored; on a duplicate key neither is written.
    fn append_correction(
        &self,
        feedback: &Feedback,
        exemplar: &TrainingExemplar,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Feedback for a founder created at or after `since`, oldest first.
    fn query_feedback(
        &self,
        founder_id: &str,
        capability: Option<&str>,
        since: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Feedback>>>;

    fn save_exemplar(&self, exemplar: &TrainingExemplar) -> BoxFuture<'_, Result<()>>;

    fn list_exemplars(
        &self,
        founder_id: &str,
        capability: Option<&str>,
    ) -> BoxFuture<'_, Result<Vec<TrainingExemplar>>>;

    /// Replace the full preference set for a founder.
    fn save_preferences(
        &self,
        founder_id: &str,
        preferences: &[RoutingPreference],
    ) -> BoxFuture<'_, Result<()>>;

    fn load_preferences(&self, founder_id: &str) -> BoxFuture<'_, Result<Vec<RoutingPreference>>>;

    /// Every founder with at least one feedback row.
    fn list_founders(&self) -> BoxFuture<'_, Result<Vec<String>>>;
}
