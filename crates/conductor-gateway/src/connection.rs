use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use conductor_agent::{GraphDefinition, Orchestrator};
use conductor_core::config::ApiKeyRole;
use conductor_core::feedback::FeedbackSubmission;
use conductor_core::types::ExecutionId;

use crate::auth;
use crate::protocol::{
    ClientFrame, ServerEvent, ServerResponse, FORBIDDEN, INVALID_PARAMS, METHOD_NOT_FOUND,
    PARSE_ERROR, REQUEST_FAILED,
};

type WsSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;
type Subscriptions = Arc<Mutex<HashSet<ExecutionId>>>;

/// Handle a single WebSocket connection.
///
/// Clients send request frames and receive response frames; execution
/// events are pushed for every execution the connection subscribed to.
pub async fn handle_connection(ws: WebSocket, orchestrator: Arc<Orchestrator>, role: ApiKeyRole) {
    let (ws_tx, mut ws_rx) = ws.split();
    let ws_tx: WsSink = Arc::new(Mutex::new(ws_tx));
    let subscriptions: Subscriptions = Arc::new(Mutex::new(HashSet::new()));

    let event_task = tokio::spawn(forward_events(
        orchestrator.subscribe(),
        ws_tx.clone(),
        subscriptions.clone(),
    ));

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "WebSocket read error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let response = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => {
                        let id = frame.id.clone();
                        match process_request(&frame, &orchestrator, &subscriptions, role).await {
                            Ok(result) => ServerResponse::ok(id, result),
                            Err((code, message)) => ServerResponse::err(id, code, message),
                        }
                    }
                    Err(e) => ServerResponse::err("0".into(), PARSE_ERROR, format!("Parse error: {}", e)),
                };
                if send_json(&ws_tx, &response).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(data) => {
                let mut tx = ws_tx.lock().await;
                let _ = tx.send(Message::Pong(data)).await;
            }
            _ => {}
        }
    }

    event_task.abort();
    debug!("Connection closed");
}

async fn send_json<T: serde::Serialize>(ws_tx: &WsSink, value: &T) -> Result<(), ()> {
    let json = serde_json::to_string(value).map_err(|_| ())?;
    let mut tx = ws_tx.lock().await;
    tx.send(Message::Text(json.into())).await.map_err(|_| ())
}

async fn forward_events(
    mut rx: broadcast::Receiver<conductor_core::types::ExecutionEvent>,
    ws_tx: WsSink,
    subscriptions: Subscriptions,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "WebSocket subscriber lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(execution_id) = event.execution_id() else {
            continue;
        };
        if !subscriptions.lock().await.contains(execution_id) {
            continue;
        }
        let Ok(payload) = serde_json::to_value(&event) else {
            continue;
        };
        let frame = ServerEvent::new(execution_id.to_string(), payload);
        if send_json(&ws_tx, &frame).await.is_err() {
            break;
        }
    }
}

type RequestError = (i32, String);

fn param_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, RequestError> {
    params[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| (INVALID_PARAMS, format!("{} is required", key)))
}

fn require(allowed: bool) -> Result<(), RequestError> {
    if allowed {
        Ok(())
    } else {
        Err((FORBIDDEN, "insufficient role".into()))
    }
}

fn failed(e: impl std::fmt::Display) -> RequestError {
    (REQUEST_FAILED, e.to_string())
}

async fn process_request(
    frame: &ClientFrame,
    orchestrator: &Orchestrator,
    subscriptions: &Mutex<HashSet<ExecutionId>>,
    role: ApiKeyRole,
) -> Result<Value, RequestError> {
    let params = &frame.params;
    match frame.method.as_str() {
        "execution.submit" => {
            require(auth::has_operator_access(role))?;
            let definition: GraphDefinition = serde_json::from_value(params["graph"].clone())
                .map_err(|e| (INVALID_PARAMS, format!("invalid graph: {}", e)))?;
            // Hold the lock across submission so early events are not dropped.
            let mut subs = subscriptions.lock().await;
            let execution_id = orchestrator.submit_graph(definition).await.map_err(failed)?;
            subs.insert(execution_id.clone());
            Ok(json!({ "execution_id": execution_id }))
        }
        "execution.subscribe" => {
            let id = ExecutionId::from_string(param_str(params, "execution_id")?);
            let record = orchestrator.get_execution_status(&id).await.map_err(failed)?;
            subscriptions.lock().await.insert(id);
            Ok(json!({ "subscribed": true, "status": record.status }))
        }
        "execution.unsubscribe" => {
            let id = ExecutionId::from_string(param_str(params, "execution_id")?);
            let removed = subscriptions.lock().await.remove(&id);
            Ok(json!({ "unsubscribed": removed }))
        }
        "execution.status" => {
            let id = ExecutionId::from_string(param_str(params, "execution_id")?);
            let record = orchestrator.get_execution_status(&id).await.map_err(failed)?;
            serde_json::to_value(record).map_err(failed)
        }
        "execution.cancel" => {
            require(auth::has_operator_access(role))?;
            let id = ExecutionId::from_string(param_str(params, "execution_id")?);
            let cancelled = orchestrator.cancel_execution(&id).await.map_err(failed)?;
            Ok(json!({ "cancelled": cancelled }))
        }
        "execution.feedback" => {
            require(auth::has_operator_access(role))?;
            let id = ExecutionId::from_string(param_str(params, "execution_id")?);
            let submission: FeedbackSubmission =
                serde_json::from_value(params["feedback"].clone())
                    .map_err(|e| (INVALID_PARAMS, format!("invalid feedback: {}", e)))?;
            let inserted = orchestrator
                .submit_feedback(&id, submission)
                .await
                .map_err(failed)?;
            Ok(json!({ "inserted": inserted }))
        }
        "capabilities.list" => Ok(json!({ "capabilities": orchestrator.capabilities() })),
        method => {
            warn!(method, "Unknown method");
            Err((METHOD_NOT_FOUND, format!("Unknown method: {}", method)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_agent::{AgentRegistry, NodeDefinition};
    use conductor_core::config::AppConfig;
    use conductor_test_utils::ScriptedHandler;

    fn orchestrator() -> Orchestrator {
        let registry = AgentRegistry::builder()
            .register(ScriptedHandler::new("echo"))
            .build();
        Orchestrator::builder(AppConfig::default(), registry).build()
    }

    fn frame(method: &str, params: Value) -> ClientFrame {
        ClientFrame {
            id: "1".into(),
            method: method.into(),
            params,
        }
    }

    #[tokio::test]
    async fn test_submit_subscribes_connection() {
        let orchestrator = orchestrator();
        let subs = Mutex::new(HashSet::new());
        let graph = GraphDefinition::new("g", "f", "w", "a").node(NodeDefinition::new("a", "echo"));

        let result = process_request(
            &frame("execution.submit", json!({ "graph": graph })),
            &orchestrator,
            &subs,
            ApiKeyRole::Operator,
        )
        .await
        .unwrap();

        let id = ExecutionId::from_string(result["execution_id"].as_str().unwrap());
        assert!(subs.lock().await.contains(&id));
    }

    #[tokio::test]
    async fn test_viewer_cannot_submit() {
        let orchestrator = orchestrator();
        let subs = Mutex::new(HashSet::new());
        let err = process_request(
            &frame("execution.submit", json!({ "graph": {} })),
            &orchestrator,
            &subs,
            ApiKeyRole::Viewer,
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, FORBIDDEN);
    }

    #[tokio::test]
    async fn test_missing_params_and_unknown_method() {
        let orchestrator = orchestrator();
        let subs = Mutex::new(HashSet::new());

        let err = process_request(&frame("execution.status", json!({})), &orchestrator, &subs, ApiKeyRole::Admin)
            .await
            .unwrap_err();
        assert_eq!(err.0, INVALID_PARAMS);

        let err = process_request(&frame("graph.delete", json!({})), &orchestrator, &subs, ApiKeyRole::Admin)
            .await
            .unwrap_err();
        assert_eq!(err.0, METHOD_NOT_FOUND);
    }
}
