// Ollama Client Implementation
//
// Speaks the native generate API of a local Ollama instance. Streaming
// responses arrive as newline-delimited JSON objects.

use std::io::{BufRead, BufReader};

use serde::{Deserialize, Serialize};

use super::{
    build_http_client, finite_or_empty, LlmClient, LlmError, TokenStream, LIVENESS_TIMEOUT,
    MAX_OUTPUT_TOKENS, TEMPERATURE,
};

pub struct OllamaClient {
    base_url: String,
    embed_model: String,
    llm_model: String,
    client: reqwest::blocking::Client,
}

impl OllamaClient {
    pub fn new(
        base_url: String,
        embed_model: String,
        llm_model: String,
    ) -> Result<Self, LlmError> {
        log::debug!("[llm::ollama] Initializing client with base_url: {}", base_url);
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            embed_model,
            llm_model,
            client: build_http_client()?,
        })
    }

    fn send_generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        stream: bool,
    ) -> Result<reqwest::blocking::Response, LlmError> {
        let request = GenerateRequest {
            model: &self.llm_model,
            prompt,
            system,
            stream,
            options: GenerateOptions {
                temperature: TEMPERATURE,
                num_predict: MAX_OUTPUT_TOKENS,
            },
        };
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .map_err(|e| LlmError::Network(format!("Ollama request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_else(|_| "unknown error".to_string());
            return Err(LlmError::Provider(format!(
                "Ollama returned status {}: {}",
                status, body
            )));
        }
        Ok(response)
    }
}

impl LlmClient for OllamaClient {
    fn embed(&self, text: &str) -> Vec<f32> {
        let url = format!("{}/api/embeddings", self.base_url);
        let request = EmbeddingsRequest {
            model: &self.embed_model,
            prompt: text,
        };
        let response = match self.client.post(&url).json(&request).send() {
            Ok(r) => r,
            Err(e) => {
                log::warn!("[llm::ollama] Embedding request failed: {}", e);
                return Vec::new();
            }
        };
        if !response.status().is_success() {
            log::warn!(
                "[llm::ollama] Embedding request returned status {}",
                response.status()
            );
            return Vec::new();
        }
        let parsed: EmbeddingsResponse = match response.json() {
            Ok(p) => p,
            Err(e) => {
                log::warn!("[llm::ollama] Failed to parse embedding response: {}", e);
                return Vec::new();
            }
        };
        finite_or_empty(parsed.embedding)
    }

    fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, LlmError> {
        log::debug!(
            "[llm::ollama] Generating completion - model: {}, prompt: {} chars",
            self.llm_model,
            prompt.len()
        );
        let response = self.send_generate(prompt, system, false)?;
        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response: {}", e)))?;
        if let Some(error) = parsed.error {
            return Err(LlmError::Provider(error));
        }
        Ok(parsed.response)
    }

    fn generate_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<TokenStream, LlmError> {
        log::debug!(
            "[llm::ollama] Starting streamed completion - model: {}",
            self.llm_model
        );
        let response = self.send_generate(prompt, system, true)?;
        Ok(Box::new(NdjsonDeltas::new(BufReader::new(response))))
    }

    fn check_connection(&self) -> (bool, String) {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(LIVENESS_TIMEOUT).send() {
            Ok(response) if response.status().is_success() => {
                (true, "Connected successfully".to_string())
            }
            Ok(response) => (false, format!("HTTP error: {}", response.status())),
            Err(e) => (false, format!("Connection error: {}", e)),
        }
    }
}

/// Iterator over newline-delimited `{response, done, error}` objects
pub(crate) struct NdjsonDeltas<R: BufRead> {
    reader: R,
    finished: bool,
}

impl<R: BufRead> NdjsonDeltas<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            finished: false,
        }
    }
}

impl<R: BufRead> Iterator for NdjsonDeltas<R> {
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
            let raw = line.trim();
            if raw.is_empty() {
                continue;
            }
            let parsed: StreamLine = match serde_json::from_str(raw) {
                Ok(p) => p,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(LlmError::InvalidResponse(format!(
                        "Malformed stream line: {}",
                        e
                    ))));
                }
            };
            if let Some(error) = parsed.error {
                self.finished = true;
                return Some(Err(LlmError::Provider(error)));
            }
            if parsed.done {
                self.finished = true;
                if parsed.response.is_empty() {
                    return None;
                }
                return Some(Ok(parsed.response));
            }
            if !parsed.response.is_empty() {
                return Some(Ok(parsed.response));
            }
        }
    }
}

// Ollama API types
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}
