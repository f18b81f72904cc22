// LLM Client Module
//
// Abstract capability bundle for the language model backend: embeddings,
// completions, streamed completions and a liveness probe. Two wire styles
// are supported and selected by configuration; the rest of the pipeline only
// sees the trait.

pub mod error;
pub mod ollama;
pub mod openai;

pub use error::LlmError;
pub use ollama::OllamaClient;
pub use openai::OpenAiCompatibleClient;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{LlmProvider, RagConfig};

pub const TEMPERATURE: f32 = 0.7;
pub const MAX_OUTPUT_TOKENS: u32 = 2048;
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(120);
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Lazy sequence of answer fragments in generation order. Transport failures
/// surface as `Err` items; end-of-stream ends the iterator.
pub type TokenStream = Box<dyn Iterator<Item = Result<String, LlmError>> + Send>;

/// Capability bundle every LLM backend must provide
pub trait LlmClient: Send + Sync {
    /// Embed a text into a fixed-dimension vector. Returns an empty vector on
    /// any transport, protocol or validation failure; never fails outright.
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Generate a full completion. The error is surfaced so callers can
    /// apply their own failure policy.
    fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, LlmError>;

    /// Generate a completion as a lazy stream of non-empty deltas.
    fn generate_stream(&self, prompt: &str, system: Option<&str>)
        -> Result<TokenStream, LlmError>;

    /// Probe the endpoint. Never fails; returns (ok, human-readable status).
    fn check_connection(&self) -> (bool, String);
}

/// Instantiate the configured client
pub fn create_client(config: &RagConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    match config.provider {
        LlmProvider::Ollama => {
            log::info!("[llm] Using Ollama client at {}", config.llm_base_url);
            Ok(Arc::new(OllamaClient::new(
                config.llm_base_url.clone(),
                config.embed_model.clone(),
                config.llm_model.clone(),
            )?))
        }
        LlmProvider::OpenAiCompatible => {
            log::info!(
                "[llm] Using OpenAI-compatible client at {}",
                config.llm_base_url
            );
            Ok(Arc::new(OpenAiCompatibleClient::new(
                config.llm_base_url.clone(),
                config.embed_model.clone(),
                config.llm_model.clone(),
                config.llm_api_key.clone(),
            )?))
        }
    }
}

/// Validate an embedding: every element must be finite, otherwise the whole
/// vector is discarded.
pub(crate) fn finite_or_empty(vector: Vec<f32>) -> Vec<f32> {
    if vector.iter().all(|v| v.is_finite()) {
        vector
    } else {
        log::warn!("[llm] Embedding contains non-finite values, discarding");
        Vec::new()
    }
}

pub(crate) fn build_http_client() -> Result<reqwest::blocking::Client, LlmError> {
    reqwest::blocking::Client::builder()
        .timeout(GENERATION_TIMEOUT)
        .build()
        .map_err(|e| LlmError::Network(format!("Failed to create HTTP client: {}", e)))
}
