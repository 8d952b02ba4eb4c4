use std::path::Path;

use serde::{Deserialize, Serialize};

use conductor_core::error::{ConductorError, Result};
use conductor_core::types::Payload;

use super::node::NodeDefinition;

/// Immutable description of a routing graph, as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub id: String,
    pub founder_id: String,
    #[serde(default)]
    pub workspace_id: String,
    pub nodes: Vec<NodeDefinition>,
    /// Id of the single root node.
    pub entry: String,
    #[serde(default)]
    pub initial_state: Payload,
}

impl GraphDefinition {
    pub fn new(
        id: impl Into<String>,
        founder_id: impl Into<String>,
        workspace_id: impl Into<String>,
        entry: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            founder_id: founder_id.into(),
            workspace_id: workspace_id.into(),
            nodes: vec![],
            entry: entry.into(),
            initial_state: Payload::new(),
        }
    }

    pub fn node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_state(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.initial_state.insert(key.into(), value);
        self
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a definition from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| ConductorError::Config(e.to_string()))
            }
            _ => Self::from_json(&content),
        }
    }
}
