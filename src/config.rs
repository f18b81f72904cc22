// RAG Configuration
//
// Unified view over the retrieval/generation knobs. Values are captured by
// the service at query entry, so edits take effect on the next query.

use serde::{Deserialize, Serialize};

pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_CHUNK_MAX_CHARS: usize = 2000;

/// Oversample factor per retrieval leg before RRF fusion. Each leg fetches
/// `top_k * FUSION_OVERSAMPLE_FACTOR` candidates so that cross-leg candidates
/// are not cut off before ranking.
pub const DEFAULT_FUSION_OVERSAMPLE_FACTOR: usize = 4;

/// Supported LLM wire styles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Ollama,
    OpenAiCompatible,
}

/// Configuration for the RAG service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Which wire style to speak to the LLM endpoint
    pub provider: LlmProvider,

    /// Base URL of the LLM endpoint
    pub llm_base_url: String,

    /// Bearer token for OpenAI-compatible endpoints, if any
    pub llm_api_key: Option<String>,

    /// Model used for embeddings
    pub embed_model: String,

    /// Model used for generation
    pub llm_model: String,

    /// Number of context documents returned by retrieval (>= 1)
    pub top_k: usize,

    /// Add a BM25 leg next to every vector leg
    pub hybrid_search_enabled: bool,

    /// Ask the LLM to vet each retrieved chunk before generation
    pub chunk_selection_enabled: bool,

    /// Total query count after expansion; 1 disables expansion
    pub transformed_query_count: usize,

    /// Upper bound on chunk size, in characters
    pub chunk_max_chars: usize,

    /// Per-leg oversample factor applied before fusion
    pub fusion_oversample_factor: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Ollama,
            llm_base_url: "http://localhost:11434".to_string(),
            llm_api_key: None,
            embed_model: "qwen3-embedding:8b".to_string(),
            llm_model: "qwen2.5:7b".to_string(),
            top_k: DEFAULT_TOP_K,
            hybrid_search_enabled: true,
            chunk_selection_enabled: false,
            transformed_query_count: 1,
            chunk_max_chars: DEFAULT_CHUNK_MAX_CHARS,
            fusion_oversample_factor: DEFAULT_FUSION_OVERSAMPLE_FACTOR,
        }
    }
}

impl RagConfig {
    /// Build a configuration from `RAG_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let provider = match env_string("RAG_LLM_PROVIDER") {
            Some(value) if value.eq_ignore_ascii_case("openai_compatible") => {
                LlmProvider::OpenAiCompatible
            }
            Some(value) if value.eq_ignore_ascii_case("ollama") => LlmProvider::Ollama,
            Some(value) => {
                log::warn!("[config] Unknown RAG_LLM_PROVIDER '{}', using default", value);
                defaults.provider
            }
            None => defaults.provider,
        };

        Self {
            provider,
            llm_base_url: env_string("RAG_LLM_BASE_URL").unwrap_or(defaults.llm_base_url),
            llm_api_key: env_string("RAG_LLM_API_KEY"),
            embed_model: env_string("RAG_EMBED_MODEL").unwrap_or(defaults.embed_model),
            llm_model: env_string("RAG_LLM_MODEL").unwrap_or(defaults.llm_model),
            top_k: env_usize("RAG_TOP_K", defaults.top_k).max(1),
            hybrid_search_enabled: env_bool(
                "RAG_HYBRID_SEARCH_ENABLED",
                defaults.hybrid_search_enabled,
            ),
            chunk_selection_enabled: env_bool(
                "RAG_CHUNK_SELECTION_ENABLED",
                defaults.chunk_selection_enabled,
            ),
            transformed_query_count: env_usize(
                "RAG_TRANSFORMED_QUERY_COUNT",
                defaults.transformed_query_count,
            )
            .max(1),
            chunk_max_chars: env_usize("RAG_CHUNK_MAX_CHARS", defaults.chunk_max_chars).max(1),
            fusion_oversample_factor: env_usize(
                "RAG_FUSION_OVERSAMPLE_FACTOR",
                defaults.fusion_oversample_factor,
            )
            .max(1),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_usize(key: &str, default: usize) -> usize {
    match env_string(key) {
        Some(value) => parse_usize(&value).unwrap_or_else(|| {
            log::warn!("[config] Invalid value '{}' for {}, using {}", value, key, default);
            default
        }),
        None => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key) {
        Some(value) => parse_bool(&value),
        None => default,
    }
}

fn parse_usize(value: &str) -> Option<usize> {
    value.parse::<usize>().ok()
}

fn parse_bool(value: &str) -> bool {
    value.to_lowercase() == "true"
}
