pub mod graph;
pub mod learning;
pub mod orchestrator;
pub mod reflection;
pub mod registry;
pub mod run_log;
pub mod scheduler;

pub use graph::{
    ExecutableGraph, GraphDefinition, GraphExecutor, GraphState, NodeDefinition, RunCondition,
    RunHandle,
};
pub use learning::{LearningEngine, PreferenceSource};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use reflection::{ReflectionOutcome, ReflectionRequest, ReflectionValidator};
pub use registry::{AgentRegistry, AgentRegistryBuilder};
pub use run_log::RunLogger;
pub use scheduler::PreferenceRefresher;
