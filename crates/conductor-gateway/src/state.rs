use std::sync::Arc;

use conductor_agent::Orchestrator;
use conductor_core::config::GatewayConfig;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub orchestrator: Arc<Orchestrator>,
}
