// Crate-level error type for the retrieval pipeline

use thiserror::Error;

use crate::llm::LlmError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Invalid vector blob: {0}")]
    InvalidVector(String),

    #[error("{0}")]
    Message(String),
}
