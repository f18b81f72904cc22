//! Muninn Core Library
//!
//! Backend logic for the Muninn note-taking application: the embedded
//! note/chunk store, hybrid retrieval (dense vectors + BM25 with rank
//! fusion) and the streaming answer pipeline driven by a pluggable
//! LLM client.

pub mod chunker;
pub mod config;
pub mod error;
pub mod expander;
pub mod fusion;
pub mod index;
pub mod llm;
pub mod prompts;
pub mod reindex;
pub mod selector;
pub mod service;
pub mod store;
pub mod vector;

pub use config::{LlmProvider, RagConfig};
pub use error::RagError;
pub use index::RagIndex;
pub use llm::{create_client, LlmClient, LlmError, TokenStream};
pub use reindex::{ReindexCoordinator, ReindexStatus};
pub use selector::{ChunkSelector, SelectionOutcome};
pub use service::{AnswerStream, RagAnswer, RagService, SourceRef, StreamEvent};
pub use store::{NoteRecord, RetrievedNote, Store, StoreError};

/// Initialize the library, specifically the logger.
/// This should be called once at the start of the application.
pub fn init() {
    env_logger::init();
    log::info!("[muninn-core] Library initialized");
}
