use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::condition::RunCondition;

/// A node in the routing graph: one handler invocation.
///
/// Input mapping pulls values out of graph state (handler input key to state
/// path); output mapping writes handler output back (output key to state
/// path). Paths are dotted, e.g. `crm.account.owner`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique identifier within the graph.
    pub id: String,
    /// Capability-type looked up in the agent registry.
    pub capability: String,
    #[serde(default)]
    pub condition: RunCondition,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Per-attempt timeout; the engine default applies when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Retries after the first attempt; the engine default applies when unset.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub reflection: bool,
    #[serde(default)]
    pub reflection_instructions: Option<String>,
    /// Equivalent capabilities the engine may substitute when the founder's
    /// routing preferences avoid `capability`.
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub preference_aware: bool,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            condition: RunCondition::Always,
            depends_on: vec![],
            timeout_ms: None,
            max_retries: None,
            input_mapping: BTreeMap::new(),
            output_mapping: BTreeMap::new(),
            reflection: false,
            reflection_instructions: None,
            alternatives: vec![],
            preference_aware: false,
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_condition(mut self, condition: RunCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Map handler input `key` from state `path`.
    pub fn input(mut self, key: impl Into<String>, path: impl Into<String>) -> Self {
        self.input_mapping.insert(key.into(), path.into());
        self
    }

    /// Map handler output `key` to state `path`.
    pub fn output(mut self, key: impl Into<String>, path: impl Into<String>) -> Self {
        self.output_mapping.insert(key.into(), path.into());
        self
    }

    pub fn with_reflection(mut self, instructions: Option<String>) -> Self {
        self.reflection = true;
        self.reflection_instructions = instructions;
        self
    }

    /// Opt into preference-aware routing over the given alternatives.
    pub fn with_alternatives<I, S>(mut self, alternatives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alternatives = alternatives.into_iter().map(Into::into).collect();
        self.preference_aware = true;
        self
    }
}
