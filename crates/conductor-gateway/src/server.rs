use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::info;

use conductor_agent::Orchestrator;
use conductor_core::config::GatewayConfig;

use crate::routes;
use crate::state::AppState;

/// Build the gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket
        .route("/ws", get(routes::ws_handler))
        // REST API
        .route("/api/health", get(routes::health))
        .route(
            "/api/executions",
            get(routes::list_executions).post(routes::submit_execution),
        )
        .route("/api/executions/{id}", get(routes::execution_status))
        .route("/api/executions/{id}/cancel", post(routes::cancel_execution))
        .route("/api/executions/{id}/feedback", post(routes::submit_feedback))
        .route("/api/capabilities", get(routes::list_capabilities))
        .route("/api/founders/{id}/preferences", get(routes::founder_preferences))
        .route(
            "/api/founders/{id}/preferences/refresh",
            post(routes::refresh_preferences),
        )
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

/// WebSocket + HTTP gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    orchestrator: Arc<Orchestrator>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            orchestrator: self.orchestrator.clone(),
        });
        let app = router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use conductor_agent::AgentRegistry;
    use conductor_core::config::{ApiKeyConfig, ApiKeyRole, AppConfig};
    use conductor_test_utils::ScriptedHandler;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(api_keys: Vec<ApiKeyConfig>) -> Router {
        let registry = AgentRegistry::builder()
            .register(ScriptedHandler::new("echo"))
            .build();
        let orchestrator = Arc::new(Orchestrator::builder(AppConfig::default(), registry).build());
        router(Arc::new(AppState {
            config: GatewayConfig {
                api_keys,
                ..Default::default()
            },
            orchestrator,
        }))
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&app(vec![]), Request::get("/api/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_submit_and_fetch_execution() {
        let app = app(vec![]);
        let graph = json!({
            "id": "g",
            "founder_id": "founder-1",
            "entry": "a",
            "nodes": [{ "id": "a", "capability": "echo" }]
        });
        let (status, body) = call(&app, post_json("/api/executions", graph)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = body["execution_id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            Request::get(format!("/api/executions/{}", id)).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["graph_id"], "g");
    }

    #[tokio::test]
    async fn test_cyclic_graph_rejected() {
        let graph = json!({
            "id": "loop",
            "founder_id": "f",
            "entry": "a",
            "nodes": [
                { "id": "a", "capability": "echo" },
                { "id": "b", "capability": "echo", "depends_on": ["a", "c"] },
                { "id": "c", "capability": "echo", "depends_on": ["b"] }
            ]
        });
        let (status, body) = call(&app(vec![]), post_json("/api/executions", graph)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("cycle"));
    }

    #[tokio::test]
    async fn test_unknown_execution_is_404() {
        let (status, _) = call(
            &app(vec![]),
            Request::get("/api/executions/missing").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_roles_enforced() {
        let app = app(vec![ApiKeyConfig {
            name: "dashboard".into(),
            key: "ck_view".into(),
            role: ApiKeyRole::Viewer,
        }]);

        let (status, _) = call(&app, Request::get("/api/capabilities").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(
            &app,
            Request::get("/api/capabilities")
                .header("authorization", "Bearer ck_view")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["capabilities"], json!(["echo"]));

        let (status, _) = call(
            &app,
            Request::post("/api/founders/f/preferences/refresh")
                .header("authorization", "Bearer ck_view")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
