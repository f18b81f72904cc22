// RAG Index
//
// Owns the store handle and orchestrates both directions of the pipeline:
// indexing (chunk, embed, encode, replace) and retrieval (expand, search per
// leg, fuse, trim, hydrate). Every dependency is allowed to fail; a query
// degrades leg by leg and only returns empty when nothing at all survived.

use std::sync::Arc;

use crate::chunker::chunk_text;
use crate::config::RagConfig;
use crate::error::RagError;
use crate::expander::QueryExpander;
use crate::fusion::{reciprocal_rank_fusion, RRF_K};
use crate::llm::LlmClient;
use crate::store::{NoteRecord, RetrievedNote, Store};
use crate::vector;

/// Progress callback for full rebuilds: (current, total, note just processed)
pub type ProgressFn<'a> = &'a mut dyn FnMut(usize, usize, &NoteRecord);

pub struct RagIndex {
    store: Store,
    client: Arc<dyn LlmClient>,
    expander: QueryExpander,
    chunk_max_chars: usize,
    fusion_oversample_factor: usize,
}

impl RagIndex {
    pub fn new(store: Store, client: Arc<dyn LlmClient>, config: &RagConfig) -> Self {
        let expander = QueryExpander::new(Arc::clone(&client));
        Self {
            store,
            client,
            expander,
            chunk_max_chars: config.chunk_max_chars,
            fusion_oversample_factor: config.fusion_oversample_factor,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // -- index building ------------------------------------------------------

    /// Index or re-index a single note. Returns `Ok(false)` when the note
    /// does not exist or no chunk could be embedded; in the latter case the
    /// previously stored chunks are left untouched.
    pub fn index_note(&mut self, note_id: i64) -> Result<bool, RagError> {
        let note = match self.store.get_note(note_id)? {
            Some(note) => note,
            None => {
                log::warn!("[index] Note {} not found, nothing to index", note_id);
                return Ok(false);
            }
        };
        self.index_record(&note)
    }

    /// Rebuild the whole index. Reports progress after every note and
    /// returns the total note count.
    pub fn build_index(&mut self, mut progress: Option<ProgressFn>) -> Result<usize, RagError> {
        let notes = self.store.list_notes_for_embedding()?;
        let total = notes.len();
        log::info!("[index] Starting index build for {} notes", total);
        self.store.clear_all_chunks()?;
        let mut indexed_count = 0;
        for (idx, note) in notes.iter().enumerate() {
            log::debug!(
                "[index] Embedding note {}/{}: id={}, title='{}'",
                idx + 1,
                total,
                note.id,
                truncate_chars(&note.title, 50)
            );
            if self.index_record(note)? {
                indexed_count += 1;
            }
            if let Some(callback) = progress.as_deref_mut() {
                callback(idx + 1, total, note);
            }
        }
        log::info!(
            "[index] Index build complete: {}/{} notes indexed",
            indexed_count,
            total
        );
        Ok(total)
    }

    fn index_record(&mut self, note: &NoteRecord) -> Result<bool, RagError> {
        let text = note_text(note);
        let chunks = chunk_text(&text, self.chunk_max_chars);
        let mut chunk_embeddings: Vec<(String, Vec<u8>)> = Vec::new();
        for chunk in chunks {
            let embedding = self.client.embed(&chunk);
            if embedding.is_empty() {
                log::warn!("[index] Failed to embed chunk of note {}, skipping", note.id);
                continue;
            }
            let blob = vector::encode(&embedding);
            chunk_embeddings.push((chunk, blob));
        }
        if chunk_embeddings.is_empty() {
            log::warn!(
                "[index] No chunk of note {} could be embedded, keeping previous state",
                note.id
            );
            return Ok(false);
        }
        self.store.replace_chunks(note.id, &chunk_embeddings)?;
        Ok(true)
    }

    // -- querying ------------------------------------------------------------

    /// Expand the question into retrieval queries (1 disables expansion).
    pub fn expand_queries(&self, question: &str, transformed_query_count: usize) -> Vec<String> {
        self.expander.expand(question, transformed_query_count)
    }

    /// Run every retrieval leg for the already-expanded queries, fuse the
    /// ranked lists and hydrate the winners with their best chunk.
    pub fn query_expanded(
        &self,
        queries: &[String],
        top_k: usize,
        hybrid: bool,
    ) -> Result<Vec<RetrievedNote>, RagError> {
        let fetch_k = top_k * self.fusion_oversample_factor;
        let mut ranked_lists: Vec<Vec<RetrievedNote>> = Vec::new();
        let mut hydration_key: Option<Vec<u8>> = None;

        for query in queries {
            let embedding = self.client.embed(query);
            if embedding.is_empty() {
                log::warn!("[index] Failed to embed query '{}', skipping its legs", query);
                continue;
            }
            let blob = vector::encode(&embedding);
            ranked_lists.push(self.store.vector_search(&blob, fetch_k)?);
            if hybrid {
                ranked_lists.push(self.store.bm25_search(query, fetch_k));
            }
            if hydration_key.is_none() {
                hydration_key = Some(blob);
            }
        }

        if ranked_lists.is_empty() {
            log::warn!("[index] Every retrieval leg failed, returning no results");
            return Ok(Vec::new());
        }

        let mut fused = reciprocal_rank_fusion(ranked_lists, RRF_K);
        fused.truncate(top_k);

        // BM25 hits carry full-note content until this point; vector hits
        // already carry chunk text but are hydrated uniformly.
        if let Some(key) = hydration_key {
            for doc in &mut fused {
                if let Some(text) = self.store.best_chunk_text(doc.id, &key)? {
                    doc.content = text;
                }
            }
        }

        log::info!("[index] Retrieved {} context document(s)", fused.len());
        Ok(fused)
    }

    /// Full retrieval: expansion followed by the multi-leg search.
    pub fn query(
        &self,
        question: &str,
        top_k: usize,
        transformed_query_count: usize,
        hybrid: bool,
    ) -> Result<Vec<RetrievedNote>, RagError> {
        log::info!("[index] RAG query: '{}' (top_k={})", question, top_k);
        let queries = self.expand_queries(question, transformed_query_count);
        self.query_expanded(&queries, top_k, hybrid)
    }
}

fn note_text(note: &NoteRecord) -> String {
    format!("{}\n\n{}", note.title, note.content).trim().to_string()
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
