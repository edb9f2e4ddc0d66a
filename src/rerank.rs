//! Cross-encoder reranking.
//!
//! The reranker itself is an external model server; this module only
//! defines the scorer interface and its HTTP implementation. Retrieval
//! treats rerank failure as a soft error: the candidate set keeps its
//! previous ordering.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::ServiceError;
use crate::llm::post_with_retries;

/// Scores `(query, text)` pairs jointly. Higher is more relevant.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, ServiceError>;
}

/// Builds the configured scorer, or `None` when reranking is disabled.
pub fn create_reranker(config: &Config) -> Result<Option<Arc<dyn Reranker>>, ServiceError> {
    if !config.reranker_enabled {
        return Ok(None);
    }
    Ok(Some(Arc::new(HttpReranker::new(config)?)))
}

/// Client for a TEI-style reranker service (`POST /rerank`).
pub struct HttpReranker {
    http: reqwest::Client,
    base_url: String,
}

impl HttpReranker {
    pub fn new(config: &Config) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ServiceError::Internal(format!("http client: {}", e)))?;
        Ok(HttpReranker {
            http,
            base_url: config.reranker_url.clone(),
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, ServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({ "query": query, "texts": texts, "raw_scores": true });
        let value = post_with_retries(
            &self.http,
            "reranker",
            &format!("{}/rerank", self.base_url),
            None,
            &body,
            1,
        )
        .await?;

        parse_rerank_response(&value, texts.len())
    }
}

/// Decodes `[{"index": n, "score": s}, ...]`, returned in any order, into
/// scores aligned with the input texts.
fn parse_rerank_response(value: &Value, expected: usize) -> Result<Vec<f32>, ServiceError> {
    let rows = value
        .as_array()
        .or_else(|| value.get("results").and_then(Value::as_array))
        .ok_or_else(|| ServiceError::MalformedUpstream("rerank response is not a list".into()))?;

    let mut scores = vec![0.0f32; expected];
    let mut seen = 0usize;
    for row in rows {
        let index = row.get("index").and_then(Value::as_u64).map(|i| i as usize);
        let score = row.get("score").and_then(Value::as_f64);
        if let (Some(index), Some(score)) = (index, score) {
            if index < expected {
                scores[index] = score as f32;
                seen += 1;
            }
        }
    }
    if seen != expected {
        return Err(ServiceError::MalformedUpstream(format!(
            "rerank returned {} scores for {} texts",
            seen, expected
        )));
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_out_of_order_indices() {
        let value = json!([
            {"index": 1, "score": 0.9},
            {"index": 0, "score": 0.1},
        ]);
        let scores = parse_rerank_response(&value, 2).unwrap();
        assert_eq!(scores, vec![0.1, 0.9]);
    }

    #[test]
    fn parses_wrapped_results() {
        let value = json!({"results": [{"index": 0, "score": 0.5}]});
        let scores = parse_rerank_response(&value, 1).unwrap();
        assert_eq!(scores, vec![0.5]);
    }

    #[test]
    fn rejects_missing_scores() {
        let value = json!([{"index": 0, "score": 0.5}]);
        assert!(parse_rerank_response(&value, 2).is_err());
    }

    #[test]
    fn disabled_config_yields_no_reranker() {
        let cfg = Config::from_lookup(|k| {
            (k == "RERANKER_ENABLED").then(|| "0".to_string())
        })
        .unwrap();
        assert!(create_reranker(&cfg).unwrap().is_none());
    }
}
