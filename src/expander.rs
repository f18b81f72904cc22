// Query Expander
//
// Asks the LLM for intent-preserving rewrites of the question to widen
// retrieval recall. The original question always leads the result; on any
// failure the expansion silently degrades to the original alone.

use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;

use crate::llm::LlmClient;

/// Hard ceiling on the total query count after expansion
pub const MAX_TARGET_COUNT: usize = 8;

lazy_static! {
    static ref LEADING_BULLET_RE: Regex =
        Regex::new(r"^(?:\d+[\).:-]?|[-*•])\s*").expect("valid bullet regex");
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").expect("valid whitespace regex");
}

pub struct QueryExpander {
    client: Arc<dyn LlmClient>,
}

impl QueryExpander {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    /// Expand `question` into up to `target_count` retrieval queries. The
    /// first element is always the normalized original; a blank question
    /// yields an empty list; `target_count` is clamped to 1..=8 and 1 skips
    /// the LLM entirely.
    pub fn expand(&self, question: &str, target_count: usize) -> Vec<String> {
        let base_query = normalize_query(question);
        if base_query.is_empty() {
            return Vec::new();
        }

        let capped_count = target_count.clamp(1, MAX_TARGET_COUNT);
        if capped_count == 1 {
            return vec![base_query];
        }

        let prompt = format!(
            "Generate concise retrieval-friendly rewrites for this question.\n\
             Preserve the original meaning and user intent exactly; only rewrite wording \
             or keywords for search coverage.\n\
             Do not broaden, narrow, or change topic.\n\
             Question: {}\n\
             Return up to {} alternatives, one per line, no prose.",
            base_query,
            capped_count - 1
        );
        log::debug!(
            "[expander] Expanding query (target_count={}): '{}'",
            capped_count,
            base_query
        );

        let raw = match self.client.generate(&prompt, None) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!(
                    "[expander] Query expansion failed, falling back to original query: {}",
                    e
                );
                return vec![base_query];
            }
        };

        let mut candidates = vec![base_query.clone()];
        candidates.extend(parse_output(&raw));
        let mut deduped = dedupe_stable(candidates);
        if deduped.is_empty() {
            return vec![base_query];
        }
        deduped.truncate(capped_count);
        log::debug!("[expander] Expanded to {} queries", deduped.len());
        deduped
    }
}

fn normalize_query(value: &str) -> String {
    WHITESPACE_RE.replace_all(value, " ").trim().to_string()
}

/// One candidate per line, stripped of bullets/numbering and surrounding
/// quotes; when no line yields content, fall back to splitting on `;`.
fn parse_output(raw: &str) -> Vec<String> {
    let stripped = raw.trim();
    if stripped.is_empty() {
        return Vec::new();
    }

    let candidates: Vec<String> = stripped
        .lines()
        .map(|line| {
            let cleaned = LEADING_BULLET_RE.replace(line.trim(), "");
            normalize_query(cleaned.trim_matches('"').trim_matches('\''))
        })
        .filter(|line| !line.is_empty())
        .collect();

    if !candidates.is_empty() {
        return candidates;
    }

    stripped
        .split(';')
        .map(normalize_query)
        .filter(|part| !part.is_empty())
        .collect()
}

fn dedupe_stable(values: Vec<String>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    let mut result: Vec<String> = Vec::new();
    for value in values {
        let normalized = normalize_query(&value);
        if normalized.is_empty() {
            continue;
        }
        let key = normalized.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        result.push(normalized);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, TokenStream};
    use std::sync::Mutex;

    struct StubClient {
        response: String,
        fail: bool,
        prompts: Mutex<Vec<String>>,
    }

    impl StubClient {
        fn with_response(response: &str) -> Self {
            Self {
                response: response.to_string(),
                fail: false,
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                response: String::new(),
                fail: true,
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn last_prompt(&self) -> String {
            self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
        }

        fn call_count(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    impl LlmClient for StubClient {
        fn embed(&self, _text: &str) -> Vec<f32> {
            vec![1.0]
        }

        fn generate(&self, prompt: &str, _system: Option<&str>) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.fail {
                return Err(LlmError::Network("boom".to_string()));
            }
            Ok(self.response.clone())
        }

        fn generate_stream(
            &self,
            _prompt: &str,
            _system: Option<&str>,
        ) -> Result<TokenStream, LlmError> {
            Ok(Box::new(std::iter::empty()))
        }

        fn check_connection(&self) -> (bool, String) {
            (true, "ok".to_string())
        }
    }

    fn expander(client: StubClient) -> (Arc<StubClient>, QueryExpander) {
        let client = Arc::new(client);
        let expander = QueryExpander::new(Arc::clone(&client) as Arc<dyn LlmClient>);
        (client, expander)
    }

    #[test]
    fn test_parse_output_to_query_list() {
        let (_, expander) =
            expander(StubClient::with_response("1. Python sqlite\n- python vectors\n  foo bar  "));
        let expanded = expander.expand("Python search", 4);
        assert_eq!(
            expanded,
            vec![
                "Python search".to_string(),
                "Python sqlite".to_string(),
                "python vectors".to_string(),
                "foo bar".to_string(),
            ]
        );
    }

    #[test]
    fn test_stable_case_insensitive_dedupe() {
        let (_, expander) = expander(StubClient::with_response("Foo\nfoo\nFOO\nBar"));
        let expanded = expander.expand("foo", 5);
        assert_eq!(expanded, vec!["foo".to_string(), "Bar".to_string()]);
    }

    #[test]
    fn test_empty_response_falls_back_to_original() {
        let (_, expander) = expander(StubClient::with_response("   "));
        assert_eq!(expander.expand("hello world", 3), vec!["hello world".to_string()]);
    }

    #[test]
    fn test_error_falls_back_to_original() {
        let (_, expander) = expander(StubClient::failing());
        assert_eq!(expander.expand("hello world", 3), vec!["hello world".to_string()]);
    }

    #[test]
    fn test_target_count_one_skips_llm() {
        let (client, expander) = expander(StubClient::with_response("anything"));
        assert_eq!(expander.expand("  a   question ", 1), vec!["a question".to_string()]);
        assert_eq!(client.call_count(), 0);
    }

    #[test]
    fn test_blank_question_yields_empty() {
        let (client, expander) = expander(StubClient::with_response("anything"));
        assert!(expander.expand("   ", 4).is_empty());
        assert_eq!(client.call_count(), 0);
    }

    #[test]
    fn test_target_count_clamp_enforced() {
        let (_, expander) = expander(StubClient::with_response("a\nb\nc\nd\ne\nf\ng\nh\ni\nj"));
        let expanded = expander.expand("base", 99);
        assert_eq!(expanded.len(), MAX_TARGET_COUNT);
        assert_eq!(expanded[0], "base");
    }

    #[test]
    fn test_single_line_with_semicolons_kept_whole() {
        // Line parsing wins whenever any line yields content; the `;`
        // fallback only applies when no line survives cleaning.
        let (_, expander) = expander(StubClient::with_response("alpha query; beta query"));
        let expanded = expander.expand("base", 4);
        assert_eq!(
            expanded,
            vec![
                "base".to_string(),
                "alpha query; beta query".to_string(),
            ]
        );
    }

    #[test]
    fn test_prompt_requires_intent_preservation() {
        let (client, expander) = expander(StubClient::with_response("alt query"));
        expander.expand("original question", 2);
        let prompt = client.last_prompt();
        assert!(prompt.contains("Preserve the original meaning and user intent exactly"));
        assert!(prompt.contains("original question"));
    }

    #[test]
    fn test_quotes_stripped_from_lines() {
        let (_, expander) = expander(StubClient::with_response("\"quoted rewrite\"\n'single'"));
        let expanded = expander.expand("base", 4);
        assert_eq!(
            expanded,
            vec![
                "base".to_string(),
                "quoted rewrite".to_string(),
                "single".to_string(),
            ]
        );
    }
}
