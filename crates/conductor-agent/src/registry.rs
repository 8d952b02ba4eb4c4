use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use conductor_core::error::{ConductorError, Result};
use conductor_core::schema::OutputSchema;
use conductor_core::traits::AgentHandler;

/// Collects handlers at startup. Call `build()` to freeze the table.
#[derive(Default)]
pub struct AgentRegistryBuilder {
    handlers: HashMap<String, Arc<dyn AgentHandler>>,
}

impl AgentRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its capability. A later registration for
    /// the same capability replaces the earlier one.
    pub fn register(self, handler: impl AgentHandler) -> Self {
        self.register_arc(Arc::new(handler))
    }

    pub fn register_arc(mut self, handler: Arc<dyn AgentHandler>) -> Self {
        let capability = handler.capability().to_string();
        if self.handlers.insert(capability.clone(), handler).is_some() {
            warn!(capability = %capability, "Replacing previously registered handler");
        } else {
            debug!(capability = %capability, "Registered handler");
        }
        self
    }

    pub fn build(self) -> AgentRegistry {
        AgentRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Immutable capability → handler table, cheap to clone and share.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    handlers: Arc<HashMap<String, Arc<dyn AgentHandler>>>,
}

impl AgentRegistry {
    pub fn builder() -> AgentRegistryBuilder {
        AgentRegistryBuilder::new()
    }

    pub fn get(&self, capability: &str) -> Option<Arc<dyn AgentHandler>> {
        self.handlers.get(capability).cloned()
    }

    /// Like `get`, but a missing capability is an error.
    pub fn resolve(&self, capability: &str) -> Result<Arc<dyn AgentHandler>> {
        self.get(capability)
            .ok_or_else(|| ConductorError::UnknownCapability(capability.to_string()))
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.handlers.contains_key(capability)
    }

    /// Registered capabilities, sorted.
    pub fn capabilities(&self) -> Vec<&str> {
        let mut caps: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        caps.sort_unstable();
        caps
    }

    pub fn schema(&self, capability: &str) -> Option<OutputSchema> {
        self.handlers.get(capability).and_then(|h| h.output_schema())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::schema::{FieldSpec, FieldType};
    use conductor_test_utils::ScriptedHandler;

    #[test]
    fn test_lookup_and_listing() {
        let registry = AgentRegistry::builder()
            .register(ScriptedHandler::new("notify"))
            .register(ScriptedHandler::new("crm-lookup"))
            .build();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("notify"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.capabilities(), vec!["crm-lookup", "notify"]);
        assert!(matches!(
            registry.resolve("missing"),
            Err(ConductorError::UnknownCapability(c)) if c == "missing"
        ));
    }

    #[test]
    fn test_later_registration_wins() {
        let schema = OutputSchema::new().field(FieldSpec::required("summary", FieldType::String));
        let registry = AgentRegistry::builder()
            .register(ScriptedHandler::new("generate"))
            .register(ScriptedHandler::new("generate").with_schema(schema.clone()))
            .build();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.schema("generate"), Some(schema));
    }

    #[test]
    fn test_clones_share_table() {
        let registry = AgentRegistry::builder()
            .register(ScriptedHandler::new("echo"))
            .build();
        let clone = registry.clone();
        assert!(Arc::ptr_eq(
            &registry.get("echo").unwrap(),
            &clone.get("echo").unwrap()
        ));
    }
}
