use serde::{Deserialize, Serialize};

/// A frame sent from the client.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A response frame sent to the client.
#[derive(Debug, Serialize)]
pub struct ServerResponse {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// An execution event pushed to subscribed clients.
#[derive(Debug, Serialize)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub execution_id: String,
    pub event: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub code: i32,
    pub message: String,
}

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const FORBIDDEN: i32 = -32003;
pub const REQUEST_FAILED: i32 = -32000;

impl ServerResponse {
    pub fn ok(id: String, result: serde_json::Value) -> Self {
        Self {
            frame_type: "response",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: String, code: i32, message: impl Into<String>) -> Self {
        Self {
            frame_type: "response",
            id,
            result: None,
            error: Some(ErrorPayload {
                code,
                message: message.into(),
            }),
        }
    }
}

impl ServerEvent {
    pub fn new(execution_id: String, event: serde_json::Value) -> Self {
        Self {
            frame_type: "event",
            execution_id,
            event,
        }
    }
}
