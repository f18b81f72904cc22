// RAG Service
//
// Public entry point of the pipeline: index building, the non-streaming
// `ask` path and the streaming `ask_stream` path. Configuration values are
// captured when a call starts; concurrent edits only affect later queries.
//
// `ask_stream` is a pull-driven iterator: each `next()` performs the work of
// the stage announced by the previous event, so the caller observes status
// transitions as they happen and provides back-pressure for the answer
// deltas. Cancellation is a caller-supplied predicate polled between deltas.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::config::RagConfig;
use crate::error::RagError;
use crate::index::{ProgressFn, RagIndex};
use crate::llm::{self, LlmClient, TokenStream};
use crate::prompts::{build_prompt, format_contexts};
use crate::selector::ChunkSelector;
use crate::store::{RetrievedNote, Store};

/// Result of the non-streaming ask path. `thinking` is reserved and
/// currently always empty.
#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub answer: String,
    pub thinking: String,
    pub sources: Vec<String>,
}

/// One selected context, as reported in the terminal stream event
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub id: i64,
    pub title: String,
}

/// A single event of the streaming answer sequence; only the named fields of
/// each event kind are populated.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub answer_delta: String,
    pub thinking_delta: String,
    pub done: bool,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceRef>>,
}

impl StreamEvent {
    fn status(label: &str) -> Self {
        Self {
            status: Some(label.to_string()),
            ..Self::default()
        }
    }

    fn answer_delta(delta: String) -> Self {
        Self {
            answer_delta: delta,
            ..Self::default()
        }
    }

    fn terminal(sources: Vec<SourceRef>, cancelled: bool) -> Self {
        Self {
            done: true,
            cancelled,
            sources: Some(sources),
            ..Self::default()
        }
    }
}

pub struct RagService {
    config: RagConfig,
    client: Arc<dyn LlmClient>,
    index: RagIndex,
    selector: Option<ChunkSelector>,
    db_path: PathBuf,
}

impl RagService {
    /// Build a service around an already-open store handle.
    pub fn new(store: Store, config: RagConfig) -> Result<Self, RagError> {
        let client = llm::create_client(&config)?;
        Self::with_client(store, config, client)
    }

    /// Build a service with an explicit client, bypassing the factory.
    pub fn with_client(
        store: Store,
        config: RagConfig,
        client: Arc<dyn LlmClient>,
    ) -> Result<Self, RagError> {
        let db_path = store.path().to_path_buf();
        let index = RagIndex::new(store, Arc::clone(&client), &config);
        let selector = if config.chunk_selection_enabled {
            Some(ChunkSelector::new(Arc::clone(&client)))
        } else {
            None
        };
        Ok(Self {
            config,
            client,
            index,
            selector,
            db_path,
        })
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Rebuild the whole index; delegates to the index and reports progress
    /// through the callback.
    pub fn build_index(&mut self, progress: Option<ProgressFn>) -> Result<usize, RagError> {
        self.index.build_index(progress)
    }

    /// Index or re-index a single note.
    pub fn index_note(&mut self, note_id: i64) -> Result<bool, RagError> {
        self.index.index_note(note_id)
    }

    /// Probe the configured LLM endpoint.
    pub fn check_connection(&self) -> (bool, String) {
        self.client.check_connection()
    }

    /// Non-streaming question answering: retrieve, optionally select, then
    /// generate. A generation failure degrades to an empty answer.
    pub fn ask(&self, question: &str) -> Result<RagAnswer, RagError> {
        let contexts = self.index.query(
            question,
            self.config.top_k,
            self.config.transformed_query_count,
            self.config.hybrid_search_enabled,
        )?;
        let contexts = match &self.selector {
            Some(selector) => selector.select(contexts, question),
            None => contexts,
        };

        let (system, user) = build_prompt(&format_contexts(&contexts), question);
        let answer = match self.client.generate(&user, Some(&system)) {
            Ok(answer) => answer,
            Err(e) => {
                log::error!("[service] Answer generation failed: {}", e);
                String::new()
            }
        };

        let sources = contexts
            .iter()
            .take(self.config.top_k)
            .map(|c| c.title.clone())
            .collect();
        Ok(RagAnswer {
            answer,
            thinking: String::new(),
            sources,
        })
    }

    /// Streaming question answering. The returned iterator yields status
    /// transitions, then answer deltas in generation order, then exactly one
    /// terminal event. `cancel` is polled between deltas; `status` mirrors
    /// the status events for callers that want a plain callback.
    pub fn ask_stream<'a>(
        &'a self,
        question: &str,
        cancel: Option<&'a dyn Fn() -> bool>,
        status: Option<&'a dyn Fn(&str)>,
    ) -> AnswerStream<'a> {
        log::info!("[service] RAG query started: '{}'", question);
        log::debug!(
            "[service] RAG config - top_k={}, transformed_query_count={}, hybrid={}, chunk_selection={}",
            self.config.top_k,
            self.config.transformed_query_count,
            self.config.hybrid_search_enabled,
            self.selector.is_some()
        );
        AnswerStream {
            service: self,
            question: question.to_string(),
            cancel,
            status,
            phase: Phase::Announce,
            queries: Vec::new(),
            contexts: Vec::new(),
            sources: Vec::new(),
            tokens: None,
        }
    }

    /// An independent service bound to a fresh store handle on the same
    /// database file, for use on another thread.
    pub fn clone_for_thread(&self) -> Result<RagService, RagError> {
        let store = Store::open(&self.db_path)?;
        RagService::with_client(store, self.config.clone(), Arc::clone(&self.client))
    }
}

enum Phase {
    Announce,
    Expand,
    Search,
    Select,
    StartGeneration,
    Stream,
    Finished,
}

/// Lazy event sequence backing `ask_stream`
pub struct AnswerStream<'a> {
    service: &'a RagService,
    question: String,
    cancel: Option<&'a dyn Fn() -> bool>,
    status: Option<&'a dyn Fn(&str)>,
    phase: Phase,
    queries: Vec<String>,
    contexts: Vec<RetrievedNote>,
    sources: Vec<SourceRef>,
    tokens: Option<TokenStream>,
}

impl<'a> AnswerStream<'a> {
    fn announce(&self, label: &str) -> StreamEvent {
        if let Some(callback) = self.status {
            callback(label);
        }
        StreamEvent::status(label)
    }

    fn cancelled_by_caller(&self) -> bool {
        self.cancel.map(|predicate| predicate()).unwrap_or(false)
    }

    fn finish(&mut self, cancelled: bool) -> StreamEvent {
        self.phase = Phase::Finished;
        self.tokens = None;
        StreamEvent::terminal(std::mem::take(&mut self.sources), cancelled)
    }

    fn fail(&mut self, error: RagError) -> Option<Result<StreamEvent, RagError>> {
        self.phase = Phase::Finished;
        self.tokens = None;
        Some(Err(error))
    }
}

impl<'a> Iterator for AnswerStream<'a> {
    type Item = Result<StreamEvent, RagError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.phase {
                Phase::Announce => {
                    self.phase = Phase::Expand;
                    return Some(Ok(self.announce("expanding")));
                }
                Phase::Expand => {
                    self.queries = self
                        .service
                        .index
                        .expand_queries(&self.question, self.service.config.transformed_query_count);
                    self.phase = Phase::Search;
                    return Some(Ok(self.announce("searching")));
                }
                Phase::Search => {
                    let retrieved = self.service.index.query_expanded(
                        &self.queries,
                        self.service.config.top_k,
                        self.service.config.hybrid_search_enabled,
                    );
                    self.contexts = match retrieved {
                        Ok(contexts) => contexts,
                        Err(e) => return self.fail(e),
                    };
                    log::info!(
                        "[service] Retrieved {} context document(s)",
                        self.contexts.len()
                    );
                    if self.service.selector.is_some() {
                        self.phase = Phase::Select;
                        return Some(Ok(self.announce("selecting")));
                    }
                    self.phase = Phase::StartGeneration;
                    return Some(Ok(self.announce("generating")));
                }
                Phase::Select => {
                    if let Some(selector) = &self.service.selector {
                        let candidates = std::mem::take(&mut self.contexts);
                        self.contexts = selector.select(candidates, &self.question);
                    }
                    self.phase = Phase::StartGeneration;
                    return Some(Ok(self.announce("generating")));
                }
                Phase::StartGeneration => {
                    self.sources = self
                        .contexts
                        .iter()
                        .map(|c| SourceRef {
                            id: c.id,
                            title: c.title.clone(),
                        })
                        .collect();
                    let (system, user) =
                        build_prompt(&format_contexts(&self.contexts), &self.question);
                    match self.service.client.generate_stream(&user, Some(&system)) {
                        Ok(tokens) => {
                            self.tokens = Some(tokens);
                            self.phase = Phase::Stream;
                            // fall through to pull the first delta
                        }
                        Err(e) => return self.fail(e.into()),
                    }
                }
                Phase::Stream => {
                    let delta = match self.tokens.as_mut() {
                        Some(tokens) => tokens.next(),
                        None => None,
                    };
                    match delta {
                        Some(Ok(delta)) => {
                            if self.cancelled_by_caller() {
                                log::info!("[service] RAG query cancelled by caller");
                                return Some(Ok(self.finish(true)));
                            }
                            return Some(Ok(StreamEvent::answer_delta(delta)));
                        }
                        Some(Err(e)) => return self.fail(e.into()),
                        None => {
                            log::info!("[service] RAG query completed, answer streamed");
                            return Some(Ok(self.finish(false)));
                        }
                    }
                }
                Phase::Finished => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, TokenStream};
    use std::cell::Cell;
    use std::sync::Mutex;

    /// Stub client with a scripted delta stream. Embeds route "python" and
    /// "sql" to orthogonal axes so retrieval behaves deterministically.
    struct ScriptedClient {
        deltas: Vec<Result<String, &'static str>>,
        selector_response: String,
        stream_calls: Mutex<usize>,
    }

    impl ScriptedClient {
        fn streaming(deltas: &[&str]) -> Self {
            Self {
                deltas: deltas.iter().map(|d| Ok(d.to_string())).collect(),
                selector_response: "YES".to_string(),
                stream_calls: Mutex::new(0),
            }
        }

        fn with_stream_error(deltas: &[&str]) -> Self {
            let mut scripted: Vec<Result<String, &'static str>> =
                deltas.iter().map(|d| Ok(d.to_string())).collect();
            scripted.push(Err("transport failed"));
            Self {
                deltas: scripted,
                selector_response: "YES".to_string(),
                stream_calls: Mutex::new(0),
            }
        }
    }

    impl LlmClient for ScriptedClient {
        fn embed(&self, text: &str) -> Vec<f32> {
            let lowered = text.to_lowercase();
            if lowered.contains("python") {
                vec![1.0, 0.0, 0.0]
            } else if lowered.contains("sql") {
                vec![0.0, 1.0, 0.0]
            } else {
                vec![0.0, 0.0, 1.0]
            }
        }

        fn generate(&self, _prompt: &str, _system: Option<&str>) -> Result<String, LlmError> {
            Ok(self.selector_response.clone())
        }

        fn generate_stream(
            &self,
            _prompt: &str,
            _system: Option<&str>,
        ) -> Result<TokenStream, LlmError> {
            *self.stream_calls.lock().unwrap() += 1;
            let items: Vec<Result<String, LlmError>> = self
                .deltas
                .iter()
                .map(|d| match d {
                    Ok(delta) => Ok(delta.clone()),
                    Err(message) => Err(LlmError::Network(message.to_string())),
                })
                .collect();
            Ok(Box::new(items.into_iter()))
        }

        fn check_connection(&self) -> (bool, String) {
            (true, "ok".to_string())
        }
    }

    fn service_with(client: ScriptedClient, config: RagConfig) -> RagService {
        let store = Store::open_in_memory().unwrap();
        store.create_note("Python note", "Python tips").unwrap();
        store.create_note("SQL note", "SQLite basics").unwrap();
        let mut service =
            RagService::with_client(store, config, Arc::new(client)).unwrap();
        service.build_index(None).unwrap();
        service
    }

    fn default_config() -> RagConfig {
        RagConfig {
            top_k: 1,
            hybrid_search_enabled: false,
            ..RagConfig::default()
        }
    }

    // ===== ask =====

    #[test]
    fn test_ask_returns_answer_and_sources() {
        struct AnswerClient(ScriptedClient);
        impl LlmClient for AnswerClient {
            fn embed(&self, text: &str) -> Vec<f32> {
                self.0.embed(text)
            }
            fn generate(&self, _p: &str, _s: Option<&str>) -> Result<String, LlmError> {
                Ok("the answer".to_string())
            }
            fn generate_stream(
                &self,
                p: &str,
                s: Option<&str>,
            ) -> Result<TokenStream, LlmError> {
                self.0.generate_stream(p, s)
            }
            fn check_connection(&self) -> (bool, String) {
                (true, "ok".to_string())
            }
        }

        let store = Store::open_in_memory().unwrap();
        store.create_note("Python note", "Python tips").unwrap();
        let mut service = RagService::with_client(
            store,
            default_config(),
            Arc::new(AnswerClient(ScriptedClient::streaming(&[]))),
        )
        .unwrap();
        service.build_index(None).unwrap();

        let result = service.ask("python question").unwrap();
        assert_eq!(result.answer, "the answer");
        assert_eq!(result.thinking, "");
        assert_eq!(result.sources, vec!["Python note".to_string()]);
    }

    #[test]
    fn test_ask_generation_failure_yields_empty_answer() {
        struct FailingGen(ScriptedClient);
        impl LlmClient for FailingGen {
            fn embed(&self, text: &str) -> Vec<f32> {
                self.0.embed(text)
            }
            fn generate(&self, _p: &str, _s: Option<&str>) -> Result<String, LlmError> {
                Err(LlmError::Network("down".to_string()))
            }
            fn generate_stream(
                &self,
                p: &str,
                s: Option<&str>,
            ) -> Result<TokenStream, LlmError> {
                self.0.generate_stream(p, s)
            }
            fn check_connection(&self) -> (bool, String) {
                (false, "down".to_string())
            }
        }

        let store = Store::open_in_memory().unwrap();
        store.create_note("Python note", "Python tips").unwrap();
        let mut service = RagService::with_client(
            store,
            default_config(),
            Arc::new(FailingGen(ScriptedClient::streaming(&[]))),
        )
        .unwrap();
        service.build_index(None).unwrap();

        let result = service.ask("python question").unwrap();
        assert_eq!(result.answer, "");
        assert!(!result.sources.is_empty());
    }

    // ===== ask_stream =====

    #[test]
    fn test_stream_event_sequence() {
        let service = service_with(
            ScriptedClient::streaming(&["Hello ", "world"]),
            default_config(),
        );
        let events: Vec<StreamEvent> = service
            .ask_stream("python question", None, None)
            .map(|e| e.unwrap())
            .collect();

        let statuses: Vec<&str> = events
            .iter()
            .filter_map(|e| e.status.as_deref())
            .collect();
        assert_eq!(statuses, vec!["expanding", "searching", "generating"]);

        let answer: String = events.iter().map(|e| e.answer_delta.as_str()).collect();
        assert_eq!(answer, "Hello world");

        let terminal = events.last().unwrap();
        assert!(terminal.done);
        assert!(!terminal.cancelled);
        let sources = terminal.sources.as_ref().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].title, "Python note");
        assert_eq!(
            events.iter().filter(|e| e.done).count(),
            1,
            "exactly one terminal event"
        );
    }

    #[test]
    fn test_stream_selecting_status_when_selection_enabled() {
        let config = RagConfig {
            chunk_selection_enabled: true,
            ..default_config()
        };
        let service = service_with(ScriptedClient::streaming(&["ok"]), config);
        let statuses: Vec<String> = service
            .ask_stream("python question", None, None)
            .map(|e| e.unwrap())
            .filter_map(|e| e.status)
            .collect();
        assert_eq!(statuses, vec!["expanding", "searching", "selecting", "generating"]);
    }

    #[test]
    fn test_stream_status_callback_mirrors_events() {
        let service = service_with(ScriptedClient::streaming(&["ok"]), default_config());
        let seen: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let status = |label: &str| seen.lock().unwrap().push(label.to_string());
        let _events: Vec<_> = service
            .ask_stream("python question", None, Some(&status))
            .collect();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["expanding", "searching", "generating"]
        );
    }

    #[test]
    fn test_stream_cancellation_after_two_deltas() {
        let service = service_with(
            ScriptedClient::streaming(&["one ", "two ", "three ", "four"]),
            default_config(),
        );
        let polls = Cell::new(0_usize);
        let cancel = move || {
            polls.set(polls.get() + 1);
            polls.get() > 2
        };

        let events: Vec<StreamEvent> = service
            .ask_stream("python question", Some(&cancel), None)
            .map(|e| e.unwrap())
            .collect();

        let deltas: Vec<&str> = events
            .iter()
            .filter(|e| !e.answer_delta.is_empty())
            .map(|e| e.answer_delta.as_str())
            .collect();
        assert_eq!(deltas, vec!["one ", "two "]);

        let terminal = events.last().unwrap();
        assert!(terminal.done);
        assert!(terminal.cancelled);
        assert!(terminal.sources.is_some());
        // Nothing after the terminal event
        assert_eq!(events.iter().filter(|e| e.done).count(), 1);
    }

    #[test]
    fn test_stream_transport_error_surfaces() {
        let service = service_with(
            ScriptedClient::with_stream_error(&["partial "]),
            default_config(),
        );
        let mut stream = service.ask_stream("python question", None, None);

        let mut saw_delta = false;
        let mut saw_error = false;
        for item in &mut stream {
            match item {
                Ok(event) if !event.answer_delta.is_empty() => saw_delta = true,
                Ok(_) => {}
                Err(e) => {
                    saw_error = true;
                    assert!(matches!(e, RagError::Llm(_)));
                    break;
                }
            }
        }
        assert!(saw_delta);
        assert!(saw_error);
        assert!(stream.next().is_none(), "stream ends after the error");
    }

    #[test]
    fn test_stream_empty_index_still_terminates() {
        let store = Store::open_in_memory().unwrap();
        let service = RagService::with_client(
            store,
            default_config(),
            Arc::new(ScriptedClient::streaming(&["no notes here"])),
        )
        .unwrap();

        let events: Vec<StreamEvent> = service
            .ask_stream("python question", None, None)
            .map(|e| e.unwrap())
            .collect();
        let terminal = events.last().unwrap();
        assert!(terminal.done);
        assert_eq!(terminal.sources.as_ref().unwrap().len(), 0);
    }

    // ===== threading =====

    #[test]
    fn test_clone_for_thread_queries_same_database() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("notes.db")).unwrap();
        store.create_note("Python note", "Python tips").unwrap();
        let mut service = RagService::with_client(
            store,
            default_config(),
            Arc::new(ScriptedClient::streaming(&["ok"])),
        )
        .unwrap();
        service.build_index(None).unwrap();

        let clone = service.clone_for_thread().unwrap();
        let handle = std::thread::spawn(move || {
            let result = clone.ask("python question").unwrap();
            result.sources
        });
        let sources = handle.join().unwrap();
        assert_eq!(sources, vec!["Python note".to_string()]);
    }
}
