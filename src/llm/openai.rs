// OpenAI-Compatible Client Implementation
//
// Works with OpenAI itself, LM Studio, and any other server exposing the
// `/v1` chat-completions API. Streaming responses arrive as SSE `data:`
// lines terminated by a `[DONE]` sentinel.

use std::io::{BufRead, BufReader};

use serde::{Deserialize, Serialize};

use super::{
    build_http_client, finite_or_empty, LlmClient, LlmError, TokenStream, LIVENESS_TIMEOUT,
    MAX_OUTPUT_TOKENS, TEMPERATURE,
};

pub struct OpenAiCompatibleClient {
    base_url: String,
    embed_model: String,
    llm_model: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
}

impl OpenAiCompatibleClient {
    pub fn new(
        base_url: String,
        embed_model: String,
        llm_model: String,
        api_key: Option<String>,
    ) -> Result<Self, LlmError> {
        log::debug!("[llm::openai] Initializing client with base_url: {}", base_url);
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            embed_model,
            llm_model,
            api_key: api_key.filter(|k| !k.is_empty()),
            client: build_http_client()?,
        })
    }

    fn authorized(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn send_chat(
        &self,
        prompt: &str,
        system: Option<&str>,
        stream: bool,
    ) -> Result<reqwest::blocking::Response, LlmError> {
        let request = ChatRequest {
            model: &self.llm_model,
            messages: build_messages(prompt, system),
            stream,
            temperature: TEMPERATURE,
            max_tokens: MAX_OUTPUT_TOKENS,
        };
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .authorized(self.client.post(&url))
            .json(&request)
            .send()
            .map_err(|e| LlmError::Network(format!("Chat request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_else(|_| "unknown error".to_string());
            return Err(LlmError::Provider(format!(
                "Endpoint returned status {}: {}",
                status, body
            )));
        }
        Ok(response)
    }
}

impl LlmClient for OpenAiCompatibleClient {
    fn embed(&self, text: &str) -> Vec<f32> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let request = EmbeddingsRequest {
            model: &self.embed_model,
            input: text,
        };
        let response = match self.authorized(self.client.post(&url)).json(&request).send() {
            Ok(r) => r,
            Err(e) => {
                log::warn!("[llm::openai] Embedding request failed: {}", e);
                return Vec::new();
            }
        };
        if !response.status().is_success() {
            log::warn!(
                "[llm::openai] Embedding request returned status {}",
                response.status()
            );
            return Vec::new();
        }
        let parsed: EmbeddingsResponse = match response.json() {
            Ok(p) => p,
            Err(e) => {
                log::warn!("[llm::openai] Failed to parse embedding response: {}", e);
                return Vec::new();
            }
        };
        match parsed.data.into_iter().next() {
            Some(item) => finite_or_empty(item.embedding),
            None => {
                log::warn!("[llm::openai] Embedding response carried no data");
                Vec::new()
            }
        }
    }

    fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, LlmError> {
        log::debug!(
            "[llm::openai] Generating completion - model: {}, prompt: {} chars",
            self.llm_model,
            prompt.len()
        );
        let response = self.send_chat(prompt, system, false)?;
        let parsed: ChatResponse = response
            .json()
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("No choices in response".to_string()))
    }

    fn generate_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<TokenStream, LlmError> {
        log::debug!(
            "[llm::openai] Starting streamed completion - model: {}",
            self.llm_model
        );
        let response = self.send_chat(prompt, system, true)?;
        Ok(Box::new(SseDeltas::new(BufReader::new(response))))
    }

    fn check_connection(&self) -> (bool, String) {
        let url = format!("{}/v1/models", self.base_url);
        match self.authorized(self.client.get(&url)).timeout(LIVENESS_TIMEOUT).send() {
            Ok(response) if response.status().is_success() => {
                (true, "Connected successfully".to_string())
            }
            Ok(response) => (false, format!("HTTP error: {}", response.status())),
            Err(e) => (false, format!("Connection error: {}", e)),
        }
    }
}

fn build_messages(prompt: &str, system: Option<&str>) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: system.to_string(),
        });
    }
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: prompt.to_string(),
    });
    messages
}

/// Iterator over SSE `data: …` lines. Malformed payloads are skipped, the
/// `[DONE]` sentinel ends the stream.
pub(crate) struct SseDeltas<R: BufRead> {
    reader: R,
    finished: bool,
}

impl<R: BufRead> SseDeltas<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            finished: false,
        }
    }
}

impl<R: BufRead> Iterator for SseDeltas<R> {
    type Item = Result<String, LlmError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.finished = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    self.finished = true;
                    return Some(Err(LlmError::Network(format!("Stream read failed: {}", e))));
                }
            }
            let trimmed = line.trim();
            let payload = match trimmed.strip_prefix("data: ") {
                Some(p) => p,
                None => continue,
            };
            if payload == "[DONE]" {
                self.finished = true;
                return None;
            }
            let parsed: StreamChunk = match serde_json::from_str(payload) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let content = parsed
                .choices
                .into_iter()
                .next()
                .map(|c| c.delta.content)
                .unwrap_or_default();
            if !content.is_empty() {
                return Some(Ok(content));
            }
        }
    }
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    data: Vec<EmbeddingsItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsItem {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: String,
}
