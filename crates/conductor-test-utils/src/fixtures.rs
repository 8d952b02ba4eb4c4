use conductor_core::config::AppConfig;
use conductor_core::types::Payload;

/// Build a payload from a JSON object literal. Non-objects yield an empty
/// payload.
pub fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => Payload::new(),
    }
}

/// Config with fast, jitter-free retries and a data dir inside `dir`.
pub fn temp_config(dir: &std::path::Path) -> AppConfig {
    let toml_str = format!(
        r#"
[engine]
max_parallelism = 4
default_timeout_ms = 1000
default_max_retries = 3

[engine.retry]
initial_backoff_ms = 5
max_backoff_ms = 20
jitter = 0.0

[store]
data_dir = "{}"
"#,
        dir.display()
    );
    AppConfig::parse(&toml_str).unwrap_or_default()
}

/// A three-node chain `fetch -> enrich -> report` as definition JSON.
pub fn chain_graph_json(fetch: &str, enrich: &str, report: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chain",
        "founder_id": "founder-1",
        "workspace_id": "ws-1",
        "entry": "fetch",
        "initial_state": {"request": {"topic": "pipeline"}},
        "nodes": [
            {"id": "fetch", "capability": fetch,
             "input_mapping": {"topic": "request.topic"}},
            {"id": "enrich", "capability": enrich, "depends_on": ["fetch"]},
            {"id": "report", "capability": report, "depends_on": ["enrich"],
             "condition": {"type": "if_any_dependency_succeeded"}}
        ]
    })
}
