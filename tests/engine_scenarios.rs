use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use conductor_agent::{
    AgentRegistry, ExecutableGraph, GraphDefinition, GraphExecutor, NodeDefinition, Orchestrator,
    ReflectionRequest, ReflectionValidator, RunCondition,
};
use conductor_core::config::{AppConfig, EngineConfig, ReflectionConfig, RetryConfig};
use conductor_core::error::ConductorError;
use conductor_core::event::EventBus;
use conductor_core::feedback::FeedbackSubmission;
use conductor_core::schema::{FieldSpec, FieldType, OutputSchema};
use conductor_core::traits::CheckpointStore;
use conductor_core::types::{NodeStatus, Payload, RunStatus};
use conductor_memory::InMemoryStore;
use conductor_test_utils::{chain_graph_json, payload, FakeInference, HookHandler, ScriptedHandler};

fn engine_config() -> EngineConfig {
    EngineConfig {
        max_parallelism: 4,
        default_timeout_ms: 1_000,
        default_max_retries: 3,
        retry: RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 10,
            jitter: 0.0,
        },
        event_capacity: 64,
    }
}

fn executor(registry: AgentRegistry) -> GraphExecutor {
    GraphExecutor::new(
        registry,
        Arc::new(InMemoryStore::new()),
        Arc::new(EventBus::default()),
        engine_config(),
    )
}

fn app_config() -> AppConfig {
    AppConfig {
        engine: engine_config(),
        ..Default::default()
    }
}

/// A always runs; B runs if A succeeded; C runs if A failed.
fn branch_graph() -> ExecutableGraph {
    ExecutableGraph::build(
        GraphDefinition::new("branch", "founder-1", "ws-1", "a")
            .node(NodeDefinition::new("a", "fetch"))
            .node(
                NodeDefinition::new("b", "enrich")
                    .depends_on(["a"])
                    .with_condition(RunCondition::IfAnyDependencySucceeded),
            )
            .node(
                NodeDefinition::new("c", "notify")
                    .depends_on(["a"])
                    .with_condition(RunCondition::IfAnyDependencyFailed),
            ),
    )
    .unwrap()
}

#[tokio::test]
async fn test_cyclic_graph_runs_nothing() {
    let handler = Arc::new(ScriptedHandler::new("echo"));
    let store = Arc::new(InMemoryStore::new());
    let orchestrator = Orchestrator::builder(
        app_config(),
        AgentRegistry::builder().register_arc(handler.clone()).build(),
    )
    .store(store.clone())
    .build();

    let definition = GraphDefinition::new("loop", "f", "w", "a")
        .node(NodeDefinition::new("a", "echo"))
        .node(NodeDefinition::new("b", "echo").depends_on(["a", "c"]))
        .node(NodeDefinition::new("c", "echo").depends_on(["b"]));

    let err = orchestrator.submit_graph(definition).await.unwrap_err();
    assert!(matches!(err, ConductorError::CyclicGraph(_)));
    assert_eq!(handler.calls(), 0);
    assert!(store.list_records(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_same_inputs_give_same_record() {
    let mut results = Vec::new();
    for _ in 0..2 {
        let registry = AgentRegistry::builder()
            .register(ScriptedHandler::new("fetch").with_output(payload(json!({"rows": 3}))))
            .register(ScriptedHandler::new("enrich"))
            .register(ScriptedHandler::new("report"))
            .build();
        let definition: GraphDefinition =
            serde_json::from_value(chain_graph_json("fetch", "enrich", "report")).unwrap();
        let record = executor(registry)
            .run(ExecutableGraph::build(definition).unwrap())
            .await
            .unwrap();
        let statuses: Vec<(String, NodeStatus, u32)> = record
            .nodes
            .iter()
            .map(|n| (n.node_id.clone(), n.status, n.attempts))
            .collect();
        results.push((record.status, statuses, record.final_state));
    }
    assert_eq!(results[0].0, results[1].0);
    assert_eq!(results[0].1, results[1].1);
    assert_eq!(results[0].2, results[1].2);
}

#[tokio::test]
async fn test_failure_branch_runs_when_dependency_fails() {
    let cleanup = Arc::new(ScriptedHandler::new("cleanup"));
    let registry = AgentRegistry::builder()
        .register(ScriptedHandler::new("fetch"))
        .register(ScriptedHandler::permanent("enrich"))
        .register_arc(cleanup.clone())
        .build();
    let graph = ExecutableGraph::build(
        GraphDefinition::new("g", "f", "w", "fetch")
            .node(NodeDefinition::new("fetch", "fetch"))
            .node(NodeDefinition::new("enrich", "enrich").depends_on(["fetch"]))
            .node(
                NodeDefinition::new("cleanup", "cleanup")
                    .depends_on(["enrich"])
                    .with_condition(RunCondition::IfAnyDependencyFailed),
            ),
    )
    .unwrap();

    let record = executor(registry).run(graph).await.unwrap();

    assert_eq!(record.status_of("enrich"), Some(NodeStatus::Failed));
    assert_eq!(record.status_of("cleanup"), Some(NodeStatus::Succeeded));
    assert_eq!(cleanup.calls(), 1);
    // The entry node succeeded, so the run completes.
    assert_eq!(record.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_transient_failures_within_budget_succeed() {
    for failures in 0..3u32 {
        let flaky = Arc::new(ScriptedHandler::failing("flaky", failures as usize));
        let registry = AgentRegistry::builder().register_arc(flaky.clone()).build();
        let graph = ExecutableGraph::build(
            GraphDefinition::new("g", "f", "w", "a")
                .node(NodeDefinition::new("a", "flaky").with_max_retries(3)),
        )
        .unwrap();

        let record = executor(registry).run(graph).await.unwrap();

        let node = record.node("a").unwrap();
        assert_eq!(node.status, NodeStatus::Succeeded);
        assert_eq!(node.attempts, failures + 1);
        assert_eq!(flaky.calls(), failures + 1);
    }
}

#[tokio::test]
async fn test_cancel_between_nodes_leaves_finished_work_intact() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let first = Arc::new(HookHandler::new("first", move |_ctx, _input| {
        trigger.cancel();
        let mut out = Payload::new();
        out.insert("done".into(), json!(true));
        Ok(out)
    }));
    let second = Arc::new(ScriptedHandler::new("second"));
    let registry = AgentRegistry::builder()
        .register_arc(first.clone())
        .register_arc(second.clone())
        .build();
    let graph = ExecutableGraph::build(
        GraphDefinition::new("g", "f", "w", "a")
            .node(NodeDefinition::new("a", "first"))
            .node(NodeDefinition::new("b", "second").depends_on(["a"])),
    )
    .unwrap();

    let handle = executor(registry).start(graph, cancel).unwrap();
    let record = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap();

    assert_eq!(record.status_of("a"), Some(NodeStatus::Succeeded));
    assert_eq!(record.status_of("b"), Some(NodeStatus::Cancelled));
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 0);
    assert_eq!(record.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn test_reflection_validity_matches_issues() {
    let schema = OutputSchema::new().field(FieldSpec::required("summary", FieldType::String));
    let input = Payload::new();
    let context = Payload::new();
    let request = ReflectionRequest {
        capability: "summarize",
        input: &input,
        context: &context,
        schema: Some(&schema),
        instructions: None,
    };

    let checks_only = ReflectionValidator::checks_only(ReflectionConfig::default());
    let correcting = ReflectionValidator::new(
        Arc::new(FakeInference::always("not json at all")),
        ReflectionConfig::default(),
    );
    let candidates = [
        payload(json!({})),
        payload(json!({"summary": 42})),
        payload(json!({"summary": "the weekly pipeline review looks healthy overall"})),
    ];

    for validator in [&checks_only, &correcting] {
        for candidate in &candidates {
            let outcome = validator.validate_and_correct(request, candidate.clone()).await;
            assert_eq!(outcome.valid, outcome.issues.is_empty());
            assert_eq!(outcome.quality().is_valid(), outcome.valid);
        }
    }

    let outcome = correcting
        .validate_and_correct(request, payload(json!({})))
        .await;
    assert!(!outcome.valid);
    assert!(outcome.into_result().is_err());
}

#[tokio::test]
async fn test_duplicate_feedback_stored_once() {
    let store = Arc::new(InMemoryStore::new());
    let orchestrator = Orchestrator::builder(
        app_config(),
        AgentRegistry::builder().register(ScriptedHandler::new("draft")).build(),
    )
    .store(store.clone())
    .build();

    let id = orchestrator
        .submit_graph(
            GraphDefinition::new("g", "founder-1", "w", "a").node(NodeDefinition::new("a", "draft")),
        )
        .await
        .unwrap();
    orchestrator.wait(&id).await.unwrap();

    let first = orchestrator
        .submit_feedback(&id, FeedbackSubmission::rating("draft", 2.0))
        .await
        .unwrap();
    let second = orchestrator
        .submit_feedback(&id, FeedbackSubmission::rating("draft", 5.0))
        .await
        .unwrap();

    assert!(first);
    assert!(!second);
    assert_eq!(store.feedback_count(), 1);
}

#[tokio::test]
async fn test_fail_twice_then_succeed() {
    let notify = Arc::new(ScriptedHandler::new("notify"));
    let registry = AgentRegistry::builder()
        .register(ScriptedHandler::failing("fetch", 2))
        .register(ScriptedHandler::new("enrich"))
        .register_arc(notify.clone())
        .build();

    let record = executor(registry).run(branch_graph()).await.unwrap();

    let a = record.node("a").unwrap();
    assert_eq!(a.status, NodeStatus::Succeeded);
    assert_eq!(a.attempts, 3);
    assert_eq!(record.status_of("b"), Some(NodeStatus::Succeeded));
    assert_eq!(record.status_of("c"), Some(NodeStatus::Skipped));
    assert_eq!(notify.calls(), 0);
    assert_eq!(record.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_always_timeout_exhausts_retries() {
    let fetch = Arc::new(ScriptedHandler::hanging("fetch"));
    let registry = AgentRegistry::builder()
        .register_arc(fetch.clone())
        .register(ScriptedHandler::new("enrich"))
        .register(ScriptedHandler::new("notify"))
        .build();
    let graph = ExecutableGraph::build(
        GraphDefinition::new("branch", "founder-1", "ws-1", "a")
            .node(
                NodeDefinition::new("a", "fetch")
                    .with_timeout_ms(50)
                    .with_max_retries(2),
            )
            .node(
                NodeDefinition::new("b", "enrich")
                    .depends_on(["a"])
                    .with_condition(RunCondition::IfAnyDependencySucceeded),
            )
            .node(
                NodeDefinition::new("c", "notify")
                    .depends_on(["a"])
                    .with_condition(RunCondition::IfAnyDependencyFailed),
            ),
    )
    .unwrap();

    let record = executor(registry).run(graph).await.unwrap();

    let a = record.node("a").unwrap();
    assert_eq!(a.status, NodeStatus::Failed);
    assert_eq!(a.attempts, 3);
    assert_eq!(fetch.calls(), 3);
    assert!(a.error.as_deref().unwrap_or("").contains("timeout"));
    assert_eq!(record.status_of("b"), Some(NodeStatus::Skipped));
    assert_eq!(record.status_of("c"), Some(NodeStatus::Succeeded));
    assert_eq!(record.status, RunStatus::Failed);
}

/// entry -> {left, right} -> join, where join depends on both parents.
fn diamond(condition: RunCondition) -> ExecutableGraph {
    ExecutableGraph::build(
        GraphDefinition::new("diamond", "founder-1", "ws-1", "entry")
            .node(NodeDefinition::new("entry", "fetch"))
            .node(NodeDefinition::new("left", "left").depends_on(["entry"]))
            .node(NodeDefinition::new("right", "right").depends_on(["entry"]))
            .node(
                NodeDefinition::new("join", "join")
                    .depends_on(["left", "right"])
                    .with_condition(condition),
            ),
    )
    .unwrap()
}

fn diamond_registry(left_fails: bool, right_fails: bool, join: Arc<ScriptedHandler>) -> AgentRegistry {
    let parent = |capability: &str, fails: bool| {
        if fails {
            ScriptedHandler::permanent(capability)
        } else {
            ScriptedHandler::new(capability)
        }
    };
    AgentRegistry::builder()
        .register(ScriptedHandler::new("fetch"))
        .register(parent("left", left_fails))
        .register(parent("right", right_fails))
        .register_arc(join)
        .build()
}

#[tokio::test]
async fn test_failure_branch_with_mixed_parents() {
    let cases = [
        // (left fails, right fails, join runs)
        (false, true, true),
        (true, false, true),
        (true, true, true),
        (false, false, false),
    ];
    for (left_fails, right_fails, runs) in cases {
        let join = Arc::new(ScriptedHandler::new("join"));
        let registry = diamond_registry(left_fails, right_fails, join.clone());

        let record = executor(registry)
            .run(diamond(RunCondition::IfAnyDependencyFailed))
            .await
            .unwrap();

        let expected = if runs { NodeStatus::Succeeded } else { NodeStatus::Skipped };
        assert_eq!(
            record.status_of("join"),
            Some(expected),
            "left_fails={} right_fails={}",
            left_fails,
            right_fails
        );
        assert_eq!(join.calls(), u32::from(runs));
    }
}

#[tokio::test]
async fn test_success_branch_with_mixed_parents() {
    let cases = [
        (false, true, true),
        (true, false, true),
        (false, false, true),
        (true, true, false),
    ];
    for (left_fails, right_fails, runs) in cases {
        let join = Arc::new(ScriptedHandler::new("join"));
        let registry = diamond_registry(left_fails, right_fails, join.clone());

        let record = executor(registry)
            .run(diamond(RunCondition::IfAnyDependencySucceeded))
            .await
            .unwrap();

        let expected = if runs { NodeStatus::Succeeded } else { NodeStatus::Skipped };
        assert_eq!(
            record.status_of("join"),
            Some(expected),
            "left_fails={} right_fails={}",
            left_fails,
            right_fails
        );
        assert_eq!(join.calls(), u32::from(runs));
        assert_eq!(record.status, RunStatus::Completed);
    }
}
