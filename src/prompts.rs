// Shared prompt templates for the answer pipeline

use crate::store::RetrievedNote;

/// Context excerpts are capped at this many characters per note when
/// formatted into the prompt.
pub const CONTEXT_MAX_CHARS: usize = 2000;

/// Build the system message and user prompt for answer generation.
pub fn build_prompt(contexts: &str, question: &str) -> (String, String) {
    let system = "You are an assistant that answers questions based on provided notes. \
        If the answer is not in the notes, say so clearly. Answer concisely.\n\n\
        IMPORTANT: When your answer refers to information from a specific note, \
        mention the note's exact title as written in the notes section below. \
        Do not use numeric references like [1] or [2] - always use the note's title."
        .to_string();
    let user = format!("Notes:\n{}\n\nQuestion: {}\n\nAnswer:", contexts, question);
    (system, user)
}

/// Format retrieved notes into the context block of the prompt.
pub fn format_contexts(contexts: &[RetrievedNote]) -> String {
    contexts
        .iter()
        .map(|note| {
            let content: String = note.content.chars().take(CONTEXT_MAX_CHARS).collect();
            format!("--- {} ---\n{}", note.title, content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Build the system and user prompt for the yes/no chunk relevance check.
/// The caller truncates the chunk content beforehand.
pub fn build_chunk_relevance_prompt(chunk_content: &str, question: &str) -> (String, String) {
    let system = "You are a relevance judge. Your sole task is to decide if a text chunk \
        is relevant to a question. Respond with a single word: YES or NO."
        .to_string();
    let user = format!(
        "Question: {}\n\nText chunk:\n{}\n\nIs this chunk relevant to the question above? \
         Answer YES or NO only.",
        question, chunk_content
    );
    (system, user)
}
