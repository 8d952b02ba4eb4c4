use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::InferenceClient;

/// Inference client returning canned responses in order.
///
/// Once the queue is drained every call returns the fallback, or an
/// `Inference` error if none was set.
pub struct FakeInference {
    responses: Mutex<VecDeque<Result<String>>>,
    fallback: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl FakeInference {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with `text`.
    pub fn always(text: impl Into<String>) -> Self {
        Self {
            fallback: Some(text.into()),
            ..Self::new()
        }
    }

    pub fn respond(self, text: impl Into<String>) -> Self {
        if let Ok(mut r) = self.responses.lock() {
            r.push_back(Ok(text.into()));
        }
        self
    }

    pub fn fail(self, message: impl Into<String>) -> Self {
        if let Ok(mut r) = self.responses.lock() {
            r.push_back(Err(ConductorError::Inference(message.into())));
        }
        self
    }

    /// Prompts received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl Default for FakeInference {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceClient for FakeInference {
    fn generate(&self, prompt: String) -> BoxFuture<'_, Result<String>> {
        if let Ok(mut p) = self.prompts.lock() {
            p.push(prompt);
        }
        let next = self.responses.lock().ok().and_then(|mut r| r.pop_front());
        let result = match next {
            Some(r) => r,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| ConductorError::Inference("no scripted response".into())),
        };
        Box::pin(async move { result })
    }
}
