use serde::{Deserialize, Serialize};

/// Gate evaluated once every dependency of a node is terminal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunCondition {
    /// Always run.
    #[default]
    Always,
    /// Run if at least one dependency succeeded.
    IfAnyDependencySucceeded,
    /// Run if at least one dependency failed.
    IfAnyDependencyFailed,
    /// Run if the expression evaluates to true against graph state.
    /// See [`super::expr`] for the grammar.
    IfExpression { expr: String },
    /// Marker for nodes that may share a wave with their siblings.
    /// Evaluates like `Always`; concurrency is decided by dependencies alone.
    ParallelEligible,
}

impl RunCondition {
    pub fn expression(expr: impl Into<String>) -> Self {
        Self::IfExpression { expr: expr.into() }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::IfAnyDependencySucceeded => "if_any_dependency_succeeded",
            Self::IfAnyDependencyFailed => "if_any_dependency_failed",
            Self::IfExpression { .. } => "if_expression",
            Self::ParallelEligible => "parallel_eligible",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_serde() {
        let c: RunCondition =
            serde_json::from_str(r#"{"type": "if_expression", "expr": "score > 3"}"#).unwrap();
        assert_eq!(c, RunCondition::expression("score > 3"));

        let c: RunCondition =
            serde_json::from_str(r#"{"type": "if_any_dependency_failed"}"#).unwrap();
        assert_eq!(c.as_str(), "if_any_dependency_failed");
    }
}
