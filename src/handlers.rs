use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use conductor_agent::AgentRegistry;
use conductor_core::error::HandlerError;
use conductor_core::schema::{FieldSpec, FieldType, OutputSchema};
use conductor_core::traits::{AgentHandler, InferenceClient};
use conductor_core::types::{HandlerContext, Payload};

/// Returns its mapped input unchanged.
pub struct EchoHandler;

impl AgentHandler for EchoHandler {
    fn capability(&self) -> &str {
        "echo"
    }

    fn execute(
        &self,
        _ctx: HandlerContext,
        input: Payload,
    ) -> BoxFuture<'_, Result<Payload, HandlerError>> {
        Box::pin(async move { Ok(input) })
    }
}

/// Sends `input.prompt` to the configured inference backend and returns
/// `{"text": ...}`.
pub struct GenerateHandler {
    inference: Option<Arc<dyn InferenceClient>>,
}

impl GenerateHandler {
    pub fn new(inference: Option<Arc<dyn InferenceClient>>) -> Self {
        Self { inference }
    }
}

impl AgentHandler for GenerateHandler {
    fn capability(&self) -> &str {
        "generate"
    }

    fn execute(
        &self,
        ctx: HandlerContext,
        input: Payload,
    ) -> BoxFuture<'_, Result<Payload, HandlerError>> {
        Box::pin(async move {
            let Some(inference) = &self.inference else {
                return Err(HandlerError::permanent("no [inference] backend configured"));
            };
            let prompt = match input.get("prompt") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => return Err(HandlerError::permanent("input is missing 'prompt'")),
            };
            let text = tokio::select! {
                result = inference.generate(prompt) => {
                    result.map_err(|e| HandlerError::transient(e.to_string()))?
                }
                _ = ctx.cancel.cancelled() => {
                    return Err(HandlerError::transient("cancelled"));
                }
            };
            let mut output = Payload::new();
            output.insert("text".into(), json!(text));
            Ok(output)
        })
    }

    fn output_schema(&self) -> Option<OutputSchema> {
        Some(OutputSchema::new().field(FieldSpec::required("text", FieldType::String)))
    }
}

/// Registry with the built-in demo capabilities.
pub fn builtin_registry(inference: Option<Arc<dyn InferenceClient>>) -> AgentRegistry {
    AgentRegistry::builder()
        .register(EchoHandler)
        .register(GenerateHandler::new(inference))
        .build()
}
