use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use conductor_core::types::{ExecutionId, Payload};

/// Per-execution key/value store shared by every node of one run.
///
/// Top-level keys live in `variables`; dotted paths reach into nested
/// JSON objects (`crm.account.owner`). Only the scheduler mutates state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphState {
    pub execution_id: ExecutionId,
    pub founder_id: String,
    pub workspace_id: String,
    variables: Payload,
}

impl GraphState {
    pub fn new(
        execution_id: ExecutionId,
        founder_id: impl Into<String>,
        workspace_id: impl Into<String>,
        initial: Payload,
    ) -> Self {
        Self {
            execution_id,
            founder_id: founder_id.into(),
            workspace_id: workspace_id.into(),
            variables: initial,
        }
    }

    /// Look up a dotted path. Array elements are reachable by index.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.variables.get(first)?;
        for seg in segments {
            current = match current {
                Value::Object(map) => map.get(seg)?,
                Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Write a dotted path, creating intermediate objects. A non-object
    /// intermediate value is replaced.
    pub fn set_path(&mut self, path: &str, value: Value) {
        let mut segments: Vec<&str> = path.split('.').collect();
        let Some(last) = segments.pop() else {
            return;
        };
        if segments.is_empty() {
            self.variables.insert(last.to_string(), value);
            return;
        }

        let root = self
            .variables
            .entry(segments[0].to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        let mut current = root;
        for seg in &segments[1..] {
            if !current.is_object() {
                *current = Value::Object(Default::default());
            }
            current = match current {
                Value::Object(map) => map
                    .entry(seg.to_string())
                    .or_insert_with(|| Value::Object(Default::default())),
                _ => return,
            };
        }
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        if let Value::Object(map) = current {
            map.insert(last.to_string(), value);
        }
    }

    /// Build a handler input from an input mapping. Unresolved paths are
    /// left out of the input.
    pub fn resolve_input(&self, mapping: &BTreeMap<String, String>) -> Payload {
        mapping
            .iter()
            .filter_map(|(key, path)| self.get_path(path).map(|v| (key.clone(), v.clone())))
            .collect()
    }

    /// Write handler output back into state.
    ///
    /// With an empty mapping the whole output is stored as an object under
    /// `node_id`. Output keys missing from `output` are skipped.
    pub fn apply_output(
        &mut self,
        node_id: &str,
        mapping: &BTreeMap<String, String>,
        output: &Payload,
    ) {
        if mapping.is_empty() {
            let object: serde_json::Map<String, Value> =
                output.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            self.variables.insert(node_id.to_string(), Value::Object(object));
            return;
        }
        for (key, path) in mapping {
            if let Some(value) = output.get(key) {
                self.set_path(path, value.clone());
            }
        }
    }

    pub fn variables(&self) -> &Payload {
        &self.variables
    }

    /// Replace all variables (checkpoint restore).
    pub fn restore(&mut self, variables: Payload) {
        self.variables = variables;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> GraphState {
        let mut initial = Payload::new();
        initial.insert("request".into(), json!({"topic": "pricing", "tags": ["a", "b"]}));
        initial.insert("score".into(), json!(4));
        GraphState::new(ExecutionId::from_string("e1"), "f1", "w1", initial)
    }

    #[test]
    fn test_get_nested_paths() {
        let s = state();
        assert_eq!(s.get_path("request.topic"), Some(&json!("pricing")));
        assert_eq!(s.get_path("request.tags.1"), Some(&json!("b")));
        assert_eq!(s.get_path("score"), Some(&json!(4)));
        assert_eq!(s.get_path("request.missing"), None);
        assert_eq!(s.get_path("score.deeper"), None);
    }

    #[test]
    fn test_set_creates_intermediates() {
        let mut s = state();
        s.set_path("report.summary.text", json!("ok"));
        assert_eq!(s.get_path("report.summary.text"), Some(&json!("ok")));

        // Overwrites a scalar intermediate
        s.set_path("score.detail", json!(1));
        assert_eq!(s.get_path("score.detail"), Some(&json!(1)));
    }

    #[test]
    fn test_resolve_input_skips_missing() {
        let s = state();
        let mut mapping = BTreeMap::new();
        mapping.insert("topic".to_string(), "request.topic".to_string());
        mapping.insert("owner".to_string(), "crm.owner".to_string());

        let input = s.resolve_input(&mapping);
        assert_eq!(input.len(), 1);
        assert_eq!(input["topic"], json!("pricing"));
    }

    #[test]
    fn test_apply_output_with_and_without_mapping() {
        let mut s = state();
        let mut output = Payload::new();
        output.insert("summary".into(), json!("short"));
        output.insert("extra".into(), json!(true));

        let mut mapping = BTreeMap::new();
        mapping.insert("summary".to_string(), "report.summary".to_string());
        mapping.insert("absent".to_string(), "report.absent".to_string());
        s.apply_output("summarize", &mapping, &output);
        assert_eq!(s.get_path("report.summary"), Some(&json!("short")));
        assert_eq!(s.get_path("report.absent"), None);
        assert_eq!(s.get_path("report.extra"), None);

        s.apply_output("raw", &BTreeMap::new(), &output);
        assert_eq!(s.get_path("raw.extra"), Some(&json!(true)));
    }
}
