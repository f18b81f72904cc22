// Chunk Selector
//
// After retrieval, each candidate chunk is individually put to the LLM with
// a yes/no relevance question; irrelevant chunks are dropped before
// generation.
//
// The failure policy is asymmetric on purpose: an LLM *error* keeps the
// chunk (a connectivity blip must not silently drop content), while an empty
// or unrecognized *reply* drops it (the model answered and said nothing that
// looks like YES).

use std::sync::Arc;

use crate::llm::LlmClient;
use crate::prompts::build_chunk_relevance_prompt;
use crate::store::RetrievedNote;

/// Intentionally smaller than the retrieval chunk size: yes/no relevance
/// checks work well on short snippets and keep the selection phase cheap.
pub const SELECTION_CHUNK_MAX_CHARS: usize = 1500;

/// Per-chunk selection verdict, for diagnostics and tests
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub chunk: RetrievedNote,
    pub relevant: bool,
    pub reason: String,
}

pub struct ChunkSelector {
    client: Arc<dyn LlmClient>,
}

impl ChunkSelector {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    /// Ask the LLM whether a single chunk is relevant to the question.
    pub fn is_relevant(&self, chunk: &RetrievedNote, question: &str) -> bool {
        match self.evaluate(chunk, question) {
            Ok(response) => parse_response(&response),
            Err(()) => true,
        }
    }

    /// Keep only the chunks deemed relevant, preserving input order. Empty
    /// input short-circuits without any LLM call.
    pub fn select(&self, chunks: Vec<RetrievedNote>, question: &str) -> Vec<RetrievedNote> {
        if chunks.is_empty() {
            return chunks;
        }
        let total = chunks.len();
        let relevant: Vec<RetrievedNote> = chunks
            .into_iter()
            .filter(|chunk| self.is_relevant(chunk, question))
            .collect();
        log::info!(
            "[selector] Chunk selection: {}/{} chunks relevant to question",
            relevant.len(),
            total
        );
        relevant
    }

    /// Evaluate every chunk and return the full verdicts, including the raw
    /// LLM reply (or an error marker) as the reason.
    pub fn select_with_results(
        &self,
        chunks: Vec<RetrievedNote>,
        question: &str,
    ) -> Vec<SelectionOutcome> {
        chunks
            .into_iter()
            .map(|chunk| match self.evaluate(&chunk, question) {
                Ok(response) => {
                    let relevant = parse_response(&response);
                    SelectionOutcome {
                        chunk,
                        relevant,
                        reason: response.trim().to_string(),
                    }
                }
                Err(()) => SelectionOutcome {
                    chunk,
                    relevant: true,
                    reason: "LLM error; defaulted to relevant".to_string(),
                },
            })
            .collect()
    }

    /// One LLM round-trip; `Err(())` means the call itself failed and the
    /// fail-open policy applies.
    fn evaluate(&self, chunk: &RetrievedNote, question: &str) -> Result<String, ()> {
        let content: String = chunk.content.chars().take(SELECTION_CHUNK_MAX_CHARS).collect();
        let (system, user) = build_chunk_relevance_prompt(&content, question);
        self.client.generate(&user, Some(&system)).map_err(|e| {
            log::warn!(
                "[selector] LLM error during relevance check for chunk '{}'; defaulting to relevant: {}",
                chunk.title,
                e
            );
        })
    }
}

/// An empty reply is NOT relevant (fail-closed); otherwise the first word,
/// stripped of trailing punctuation and uppercased, must equal YES.
fn parse_response(response: &str) -> bool {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return false;
    }
    let first_word = match trimmed.split_whitespace().next() {
        Some(word) => word,
        None => return false,
    };
    first_word.trim_matches(|c| ".,!?;:".contains(c)).to_uppercase() == "YES"
}
