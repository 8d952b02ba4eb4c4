use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use conductor_core::error::HandlerError;
use conductor_core::schema::OutputSchema;
use conductor_core::traits::AgentHandler;
use conductor_core::types::{HandlerContext, Payload};

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Step {
    Ok(Payload),
    Transient(String),
    Permanent(String),
    /// Sleep, then return the payload. Observes cancellation.
    Delay(Duration, Payload),
    /// Never return unless cancelled.
    Hang,
}

/// Handler that replays a script of responses, then repeats a fallback.
pub struct ScriptedHandler {
    capability: String,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    schema: Option<OutputSchema>,
    calls: AtomicU32,
    inputs: Mutex<Vec<Payload>>,
}

impl ScriptedHandler {
    /// Succeeds every call with `{"capability": <name>, "ok": true}`.
    pub fn new(capability: &str) -> Self {
        let mut output = Payload::new();
        output.insert("capability".into(), serde_json::json!(capability));
        output.insert("ok".into(), serde_json::json!(true));
        Self {
            capability: capability.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Step::Ok(output),
            schema: None,
            calls: AtomicU32::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Fails transiently `times` times, then falls back.
    pub fn failing(capability: &str, times: usize) -> Self {
        let handler = Self::new(capability);
        for i in 0..times {
            handler.push(Step::Transient(format!("transient failure {}", i + 1)));
        }
        handler
    }

    /// Fails permanently on every call.
    pub fn permanent(capability: &str) -> Self {
        Self::new(capability).with_fallback(Step::Permanent("permanent failure".into()))
    }

    /// Hangs on every call.
    pub fn hanging(capability: &str) -> Self {
        Self::new(capability).with_fallback(Step::Hang)
    }

    pub fn with_fallback(mut self, step: Step) -> Self {
        self.fallback = step;
        self
    }

    pub fn with_output(self, output: Payload) -> Self {
        self.with_fallback(Step::Ok(output))
    }

    pub fn with_schema(mut self, schema: OutputSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn then(self, step: Step) -> Self {
        self.push(step);
        self
    }

    fn push(&self, step: Step) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(step);
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Inputs received, in call order.
    pub fn inputs(&self) -> Vec<Payload> {
        self.inputs.lock().map(|i| i.clone()).unwrap_or_default()
    }
}

impl AgentHandler for ScriptedHandler {
    fn capability(&self) -> &str {
        &self.capability
    }

    fn execute(
        &self,
        ctx: HandlerContext,
        input: Payload,
    ) -> BoxFuture<'_, Result<Payload, HandlerError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut inputs) = self.inputs.lock() {
            inputs.push(input);
        }
        let step = self
            .script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| self.fallback.clone());

        Box::pin(async move {
            match step {
                Step::Ok(output) => Ok(output),
                Step::Transient(msg) => Err(HandlerError::Transient(msg)),
                Step::Permanent(msg) => Err(HandlerError::Permanent(msg)),
                Step::Delay(delay, output) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => Ok(output),
                        _ = ctx.cancel.cancelled() => Err(HandlerError::transient("cancelled")),
                    }
                }
                Step::Hang => {
                    ctx.cancel.cancelled().await;
                    Err(HandlerError::transient("cancelled"))
                }
            }
        })
    }

    fn output_schema(&self) -> Option<OutputSchema> {
        self.schema.clone()
    }
}

type Hook = Box<dyn Fn(&HandlerContext, &Payload) -> Result<Payload, HandlerError> + Send + Sync>;

/// Handler backed by a closure, for tests that need side effects
/// (cancelling a run, recording attempt numbers).
pub struct HookHandler {
    capability: String,
    hook: Hook,
    calls: AtomicU32,
}

impl HookHandler {
    pub fn new<F>(capability: &str, hook: F) -> Self
    where
        F: Fn(&HandlerContext, &Payload) -> Result<Payload, HandlerError> + Send + Sync + 'static,
    {
        Self {
            capability: capability.to_string(),
            hook: Box::new(hook),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AgentHandler for HookHandler {
    fn capability(&self) -> &str {
        &self.capability
    }

    fn execute(
        &self,
        ctx: HandlerContext,
        input: Payload,
    ) -> BoxFuture<'_, Result<Payload, HandlerError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = (self.hook)(&ctx, &input);
        Box::pin(async move { result })
    }
}
