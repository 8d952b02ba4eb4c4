use std::collections::{BTreeSet, HashMap, HashSet};

use conductor_core::error::{ConductorError, Result};

use super::condition::RunCondition;
use super::definition::GraphDefinition;
use super::expr::Expression;
use super::node::NodeDefinition;

/// A validated graph ready for execution.
///
/// Holds a deterministic topological order (Kahn's algorithm, ties broken
/// by node id), each node's dependents and depth, and pre-compiled
/// condition expressions.
#[derive(Debug, Clone)]
pub struct ExecutableGraph {
    definition: GraphDefinition,
    index: HashMap<String, usize>,
    order: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    depth: Vec<usize>,
    expressions: Vec<Option<Expression>>,
}

impl ExecutableGraph {
    /// Validate a definition and build the executable form.
    pub fn build(definition: GraphDefinition) -> Result<Self> {
        let mut index = HashMap::with_capacity(definition.nodes.len());
        for (i, node) in definition.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(ConductorError::DuplicateNode(node.id.clone()));
            }
        }

        let mut dependents = vec![Vec::new(); definition.nodes.len()];
        let mut indegree = vec![0usize; definition.nodes.len()];
        for (i, node) in definition.nodes.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &node.depends_on {
                let Some(&d) = index.get(dep) else {
                    return Err(ConductorError::UnknownNode {
                        node: node.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                if seen.insert(d) {
                    dependents[d].push(i);
                    indegree[i] += 1;
                }
            }
        }

        let order = topological_order(&definition.nodes, &index, &dependents, &indegree)?;
        validate_entry(&definition, &index, &indegree)?;

        let mut depth = vec![0usize; definition.nodes.len()];
        for &i in &order {
            depth[i] = definition.nodes[i]
                .depends_on
                .iter()
                .filter_map(|d| index.get(d))
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut expressions = Vec::with_capacity(definition.nodes.len());
        for node in &definition.nodes {
            expressions.push(match &node.condition {
                RunCondition::IfExpression { expr } => {
                    Some(Expression::parse(expr).map_err(|message| {
                        ConductorError::InvalidExpression {
                            node: node.id.clone(),
                            message,
                        }
                    })?)
                }
                _ => None,
            });
        }

        Ok(Self {
            definition,
            index,
            order,
            dependents,
            depth,
            expressions,
        })
    }

    pub fn definition(&self) -> &GraphDefinition {
        &self.definition
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn entry(&self) -> &str {
        &self.definition.entry
    }

    pub fn len(&self) -> usize {
        self.definition.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definition.nodes.is_empty()
    }

    /// Node ids in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&i| self.definition.nodes[i].id.as_str())
            .collect()
    }

    pub(crate) fn order_indices(&self) -> &[usize] {
        &self.order
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.index_of(id).map(|i| &self.definition.nodes[i])
    }

    pub(crate) fn node_at(&self, i: usize) -> &NodeDefinition {
        &self.definition.nodes[i]
    }

    pub(crate) fn dependency_indices(&self, i: usize) -> Vec<usize> {
        self.definition.nodes[i]
            .depends_on
            .iter()
            .filter_map(|d| self.index.get(d).copied())
            .collect()
    }

    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.index_of(id)
            .map(|i| {
                self.dependents[i]
                    .iter()
                    .map(|&d| self.definition.nodes[d].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Longest dependency path from the entry node.
    pub fn depth(&self, id: &str) -> Option<usize> {
        self.index_of(id).map(|i| self.depth[i])
    }

    pub(crate) fn expression_at(&self, i: usize) -> Option<&Expression> {
        self.expressions[i].as_ref()
    }

    /// Every capability the graph may invoke, including alternatives.
    pub fn capabilities(&self) -> BTreeSet<&str> {
        self.definition
            .nodes
            .iter()
            .flat_map(|n| {
                std::iter::once(n.capability.as_str()).chain(n.alternatives.iter().map(String::as_str))
            })
            .collect()
    }
}

fn topological_order(
    nodes: &[NodeDefinition],
    index: &HashMap<String, usize>,
    dependents: &[Vec<usize>],
    indegree: &[usize],
) -> Result<Vec<usize>> {
    let mut remaining = indegree.to_vec();
    let mut ready: BTreeSet<(&str, usize)> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| remaining[*i] == 0)
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(first) = ready.iter().next().copied() {
        ready.remove(&first);
        let (_, i) = first;
        order.push(i);
        for &d in &dependents[i] {
            remaining[d] -= 1;
            if remaining[d] == 0 {
                ready.insert((nodes[d].id.as_str(), d));
            }
        }
    }

    if order.len() < nodes.len() {
        return Err(ConductorError::CyclicGraph(node_on_cycle(nodes, index, &remaining)));
    }
    Ok(order)
}

/// Every node left over by Kahn's algorithm has an unprocessed dependency,
/// so following those dependencies must revisit a node on a cycle.
fn node_on_cycle(
    nodes: &[NodeDefinition],
    index: &HashMap<String, usize>,
    remaining: &[usize],
) -> String {
    let start = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| remaining[*i] > 0)
        .min_by(|a, b| a.1.id.cmp(&b.1.id))
        .map(|(i, _)| i);
    let Some(mut current) = start else {
        return String::new();
    };

    let mut visited = HashSet::new();
    while visited.insert(current) {
        let mut deps: Vec<&String> = nodes[current].depends_on.iter().collect();
        deps.sort();
        let next = deps
            .into_iter()
            .filter_map(|d| index.get(d).copied())
            .find(|&d| remaining[d] > 0);
        match next {
            Some(n) => current = n,
            None => break,
        }
    }
    nodes[current].id.clone()
}

fn validate_entry(
    definition: &GraphDefinition,
    index: &HashMap<String, usize>,
    indegree: &[usize],
) -> Result<()> {
    let Some(&entry) = index.get(&definition.entry) else {
        return Err(ConductorError::InvalidEntry(format!(
            "entry node '{}' is not defined",
            definition.entry
        )));
    };
    if indegree[entry] > 0 {
        return Err(ConductorError::InvalidEntry(format!(
            "entry node '{}' has dependencies",
            definition.entry
        )));
    }
    let roots: Vec<&str> = definition
        .nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| indegree[*i] == 0 && *i != entry)
        .map(|(_, n)| n.id.as_str())
        .collect();
    if !roots.is_empty() {
        return Err(ConductorError::InvalidEntry(format!(
            "nodes without dependencies besides entry '{}': {}",
            definition.entry,
            roots.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(entry: &str, nodes: Vec<NodeDefinition>) -> GraphDefinition {
        let mut def = GraphDefinition::new("g", "f", "w", entry);
        def.nodes = nodes;
        def
    }

    #[test]
    fn test_diamond_order_and_depth() {
        let def = graph(
            "a",
            vec![
                NodeDefinition::new("d", "echo").depends_on(["b", "c"]),
                NodeDefinition::new("c", "echo").depends_on(["a"]),
                NodeDefinition::new("b", "echo").depends_on(["a"]),
                NodeDefinition::new("a", "echo"),
            ],
        );
        let g = ExecutableGraph::build(def).unwrap();
        assert_eq!(g.order(), vec!["a", "b", "c", "d"]);
        assert_eq!(g.depth("a"), Some(0));
        assert_eq!(g.depth("b"), Some(1));
        assert_eq!(g.depth("d"), Some(2));
        assert_eq!(g.dependents("a"), vec!["c", "b"]);
    }

    #[test]
    fn test_depth_is_longest_path() {
        let def = graph(
            "a",
            vec![
                NodeDefinition::new("a", "echo"),
                NodeDefinition::new("b", "echo").depends_on(["a"]),
                NodeDefinition::new("c", "echo").depends_on(["b"]),
                NodeDefinition::new("d", "echo").depends_on(["a", "c"]),
            ],
        );
        let g = ExecutableGraph::build(def).unwrap();
        assert_eq!(g.depth("d"), Some(3));
    }

    #[test]
    fn test_cycle_rejected() {
        let def = graph(
            "a",
            vec![
                NodeDefinition::new("a", "echo"),
                NodeDefinition::new("b", "echo").depends_on(["a", "c"]),
                NodeDefinition::new("c", "echo").depends_on(["b"]),
            ],
        );
        match ExecutableGraph::build(def) {
            Err(ConductorError::CyclicGraph(node)) => assert!(node == "b" || node == "c"),
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_loop_rejected() {
        let def = graph(
            "a",
            vec![
                NodeDefinition::new("a", "echo"),
                NodeDefinition::new("b", "echo").depends_on(["a", "b"]),
            ],
        );
        assert!(matches!(
            ExecutableGraph::build(def),
            Err(ConductorError::CyclicGraph(n)) if n == "b"
        ));
    }

    #[test]
    fn test_duplicate_and_unknown() {
        let dup = graph(
            "a",
            vec![NodeDefinition::new("a", "echo"), NodeDefinition::new("a", "echo")],
        );
        assert!(matches!(
            ExecutableGraph::build(dup),
            Err(ConductorError::DuplicateNode(n)) if n == "a"
        ));

        let unknown = graph(
            "a",
            vec![
                NodeDefinition::new("a", "echo"),
                NodeDefinition::new("b", "echo").depends_on(["zzz"]),
            ],
        );
        assert!(matches!(
            ExecutableGraph::build(unknown),
            Err(ConductorError::UnknownNode { node, dependency }) if node == "b" && dependency == "zzz"
        ));
    }

    #[test]
    fn test_entry_validation() {
        let missing = graph("x", vec![NodeDefinition::new("a", "echo")]);
        assert!(matches!(
            ExecutableGraph::build(missing),
            Err(ConductorError::InvalidEntry(_))
        ));

        let has_deps = graph(
            "b",
            vec![
                NodeDefinition::new("a", "echo"),
                NodeDefinition::new("b", "echo").depends_on(["a"]),
            ],
        );
        assert!(matches!(
            ExecutableGraph::build(has_deps),
            Err(ConductorError::InvalidEntry(_))
        ));

        let two_roots = graph(
            "a",
            vec![NodeDefinition::new("a", "echo"), NodeDefinition::new("b", "echo")],
        );
        assert!(matches!(
            ExecutableGraph::build(two_roots),
            Err(ConductorError::InvalidEntry(msg)) if msg.contains('b')
        ));
    }

    #[test]
    fn test_bad_expression_rejected_at_build() {
        let def = graph(
            "a",
            vec![
                NodeDefinition::new("a", "echo"),
                NodeDefinition::new("b", "echo")
                    .depends_on(["a"])
                    .with_condition(RunCondition::expression("score >")),
            ],
        );
        assert!(matches!(
            ExecutableGraph::build(def),
            Err(ConductorError::InvalidExpression { node, .. }) if node == "b"
        ));
    }

    #[test]
    fn test_deeply_nested_expression_rejected_at_build() {
        let parens = format!("{}x == 1{}", "(".repeat(10_000), ")".repeat(10_000));
        let negations = format!("{}x", "not ".repeat(10_000));
        for expr in [parens, negations] {
            let def = graph(
                "a",
                vec![
                    NodeDefinition::new("a", "echo"),
                    NodeDefinition::new("b", "echo")
                        .depends_on(["a"])
                        .with_condition(RunCondition::expression(expr)),
                ],
            );
            assert!(matches!(
                ExecutableGraph::build(def),
                Err(ConductorError::InvalidExpression { node, message })
                    if node == "b" && message.contains("nested too deeply")
            ));
        }
    }

    #[test]
    fn test_capabilities_include_alternatives() {
        let def = graph(
            "a",
            vec![NodeDefinition::new("a", "crm-v1").with_alternatives(["crm-v2"])],
        );
        let g = ExecutableGraph::build(def).unwrap();
        let caps: Vec<&str> = g.capabilities().into_iter().collect();
        assert_eq!(caps, vec!["crm-v1", "crm-v2"]);
    }
}
