use conductor_core::config::{ApiKeyRole, GatewayConfig};

/// Result of a successful authentication.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub name: String,
    pub role: ApiKeyRole,
}

/// Bearer header -> api_keys -> legacy token -> query token -> anonymous.
///
/// Returns `None` on auth failure.
pub fn validate_auth(
    config: &GatewayConfig,
    bearer: Option<&str>,
    query_token: Option<&str>,
) -> Option<AuthResult> {
    if let Some(bearer_val) = bearer {
        if let Some(ak) = config.api_keys.iter().find(|ak| ak.key == bearer_val) {
            return Some(AuthResult {
                name: ak.name.clone(),
                role: ak.role,
            });
        }
        if config.token.as_deref() == Some(bearer_val) {
            return Some(AuthResult {
                name: "legacy-token".into(),
                role: ApiKeyRole::Admin,
            });
        }
        return None;
    }

    if let Some(expected) = &config.token {
        if query_token == Some(expected.as_str()) {
            return Some(AuthResult {
                name: "legacy-token".into(),
                role: ApiKeyRole::Admin,
            });
        }
        return None;
    }

    // No auth configured: anonymous access, unless api_keys exist.
    if config.api_keys.is_empty() {
        Some(AuthResult {
            name: "anonymous".into(),
            role: ApiKeyRole::Admin,
        })
    } else {
        None
    }
}

/// Extract `token` from a query string (`?token=...`).
pub fn extract_token_from_query(query: &str) -> Option<&str> {
    query.split('&').find_map(|pair| pair.strip_prefix("token="))
}

/// Read execution status, capabilities and preferences.
pub fn has_viewer_access(role: ApiKeyRole) -> bool {
    role >= ApiKeyRole::Viewer
}

/// Submit and cancel executions, send feedback.
pub fn has_operator_access(role: ApiKeyRole) -> bool {
    role >= ApiKeyRole::Operator
}

pub fn has_admin_access(role: ApiKeyRole) -> bool {
    role >= ApiKeyRole::Admin
}
