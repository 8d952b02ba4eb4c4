//! Routing graph model: definitions, validation and execution.
//!
//! A graph is a DAG of `NodeDefinition`s. Each node names a capability to
//! invoke, the nodes it depends on and a `RunCondition` gating it once those
//! dependencies are terminal. `ExecutableGraph::build` validates the
//! definition; `GraphExecutor` runs it against an `AgentRegistry`, moving
//! data between nodes through the shared `GraphState`.

pub mod builder;
pub mod condition;
pub mod definition;
pub mod executor;
pub mod expr;
pub mod node;
pub mod state;

pub use builder::ExecutableGraph;
pub use condition::RunCondition;
pub use definition::GraphDefinition;
pub use executor::{GraphExecutor, RunHandle};
pub use expr::{EvalError, Expression};
pub use node::NodeDefinition;
pub use state::GraphState;
