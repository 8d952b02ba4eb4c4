//! Test doubles and fixtures shared by the Conductor crates.

pub mod fixtures;
pub mod handlers;
pub mod inference;

pub use fixtures::{chain_graph_json, payload, temp_config};
pub use handlers::{HookHandler, ScriptedHandler, Step};
pub use inference::FakeInference;
