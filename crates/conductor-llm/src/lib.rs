pub mod openai;
pub mod retry;

use std::sync::Arc;

use conductor_core::config::InferenceConfig;
use conductor_core::traits::InferenceClient;

pub use openai::OpenAiClient;
pub use retry::RetryingClient;

/// Build the inference client described by `config`, wrapped in retries
/// when a retry policy is set.
pub fn create_client(config: &InferenceConfig) -> Arc<dyn InferenceClient> {
    let client = OpenAiClient::new(config.clone());
    match &config.retry {
        Some(retry) => Arc::new(RetryingClient::new(Box::new(client), retry.clone())),
        None => Arc::new(client),
    }
}
