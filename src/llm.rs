//! Remote-model clients: OpenAI-compatible chat and embeddings.
//!
//! Both clients speak to OpenAI-compatible endpoints (LM Studio, vLLM,
//! hosted providers) and share the same retry strategy:
//!
//! - HTTP 429 and 5xx → retry with exponential backoff plus jitter
//! - other 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped), plus up to 250ms jitter
//!
//! Chat responses that should be JSON go through [`extract_json`], which
//! tolerates code fences and prose padding; anything that still fails to
//! parse is a `MalformedUpstream` error and counts against the same retry
//! budget.

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::Config;
use crate::error::ServiceError;

/// Chat-completion backend used by the chunker and entity extractor.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Runs a system+user prompt and decodes the response as JSON.
    async fn complete_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<Value, ServiceError>;
}

/// Embedding backend. A batch of N texts must yield exactly N vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;
}

/// Delay before retry `attempt` (1-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1 << (attempt - 1).min(5));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    base + jitter
}

/// Best-effort JSON extraction from an LLM response.
///
/// Strips Markdown code fences, then falls back to the outermost
/// `{...}`/`[...]` span when the whole text does not parse.
pub fn extract_json(raw: &str) -> Result<Value, ServiceError> {
    let mut text = raw.trim();
    if text.is_empty() {
        return Err(ServiceError::MalformedUpstream("empty response".into()));
    }

    let stripped;
    if text.starts_with("```") {
        stripped = text
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
        text = &stripped;
    }

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }

    // Last resort: the widest brace- or bracket-delimited span.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                    return Ok(value);
                }
            }
        }
    }

    Err(ServiceError::MalformedUpstream(format!(
        "response is not JSON: {}",
        truncate(raw, 200)
    )))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ============ Chat client ============

/// OpenAI-compatible `/v1/chat/completions` client.
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl LlmClient {
    pub fn new(config: &Config) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.llm_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Internal(format!("http client: {}", e)))?;
        Ok(LlmClient {
            http,
            base_url: config.llm_base_url.clone(),
            model: config.llm_model.clone(),
            api_key: config.llm_api_key.clone(),
            max_retries: config.llm_max_retries,
        })
    }

    async fn chat_text(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<String, ServiceError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "max_tokens": max_tokens,
        });

        let value = post_with_retries(
            &self.http,
            "llm",
            &format!("{}/v1/chat/completions", self.base_url),
            self.api_key.as_deref(),
            &body,
            self.max_retries,
        )
        .await?;

        value["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ServiceError::MalformedUpstream("chat response has no message content".into())
            })
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<Value, ServiceError> {
        // Unparseable output is retried like a transient fault, within the
        // same bounded budget as network errors.
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            let raw = match self.chat_text(system_prompt, user_prompt, max_tokens).await {
                Ok(raw) => raw,
                Err(e) if e.is_transient() => {
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            match extract_json(&raw) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "llm returned unparseable json");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ServiceError::fatal("llm", "retry budget exhausted")))
    }
}

// ============ Embedding client ============

/// OpenAI-compatible `/v1/embeddings` client.
pub struct HttpEmbedder {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl HttpEmbedder {
    pub fn new(config: &Config) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ServiceError::Internal(format!("http client: {}", e)))?;
        Ok(HttpEmbedder {
            http,
            base_url: config.embeddings_base_url.clone(),
            model: config.embeddings_model.clone(),
            api_key: config.embeddings_api_key.clone(),
            max_retries: config.llm_max_retries,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // Whitespace runs carry no signal for the embedding model and can
        // blow the token budget on extracted PDFs.
        let normalized: Vec<String> = texts
            .iter()
            .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect();

        let body = json!({ "model": self.model, "input": normalized });

        let mut value = post_with_retries(
            &self.http,
            "embeddings",
            &format!("{}/v1/embeddings", self.base_url),
            self.api_key.as_deref(),
            &body,
            self.max_retries,
        )
        .await?;

        let data = match value.get_mut("data").map(Value::take) {
            Some(Value::Array(rows)) => rows,
            _ => {
                return Err(ServiceError::MalformedUpstream(
                    "embeddings response missing data array".into(),
                ))
            }
        };

        let mut vectors = Vec::with_capacity(data.len());
        for row in data {
            let embedding = row
                .get("embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    ServiceError::MalformedUpstream("embeddings row missing vector".into())
                })?;
            vectors.push(
                embedding
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect(),
            );
        }

        if vectors.len() != texts.len() {
            return Err(ServiceError::fatal(
                "embeddings",
                format!("asked for {} vectors, got {}", texts.len(), vectors.len()),
            ));
        }
        Ok(vectors)
    }
}

/// POST a JSON body with the shared retry policy, returning the decoded
/// response body.
pub async fn post_with_retries(
    http: &reqwest::Client,
    dependency: &'static str,
    url: &str,
    api_key: Option<&str>,
    body: &Value,
    max_retries: u32,
) -> Result<Value, ServiceError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(attempt)).await;
        }

        let mut req = http.post(url).json(body);
        if let Some(key) = api_key {
            req = req.bearer_auth(key);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.json::<Value>().await.map_err(|e| {
                        ServiceError::MalformedUpstream(format!("invalid response body: {}", e))
                    });
                }
                let text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(ServiceError::transient(
                        dependency,
                        format!("HTTP {}: {}", status, truncate(&text, 200)),
                    ));
                    continue;
                }
                return Err(ServiceError::fatal(
                    dependency,
                    format!("HTTP {}: {}", status, truncate(&text, 200)),
                ));
            }
            Err(e) => {
                last_err = Some(ServiceError::transient(dependency, e.to_string()));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| ServiceError::fatal(dependency, "retry budget exhausted")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_plain_object() {
        let v = extract_json(r#"{"entities": []}"#).unwrap();
        assert!(v["entities"].as_array().unwrap().is_empty());
    }

    #[test]
    fn extract_json_code_fence() {
        let v = extract_json("```json\n[{\"text\": \"hi\"}]\n```").unwrap();
        assert_eq!(v[0]["text"], "hi");
    }

    #[test]
    fn extract_json_prose_padding() {
        let v = extract_json("Here are the chunks:\n[{\"text\": \"hi\"}]\nHope that helps!").unwrap();
        assert_eq!(v[0]["text"], "hi");
    }

    #[test]
    fn extract_json_rejects_garbage() {
        assert!(matches!(
            extract_json("definitely not json"),
            Err(ServiceError::MalformedUpstream(_))
        ));
        assert!(matches!(
            extract_json(""),
            Err(ServiceError::MalformedUpstream(_))
        ));
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert!(backoff_delay(1) >= Duration::from_secs(1));
        assert!(backoff_delay(3) >= Duration::from_secs(4));
        // Capped at 32s base + 250ms jitter.
        assert!(backoff_delay(10) < Duration::from_secs(33));
    }
}
