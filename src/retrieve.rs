//! Hybrid retrieval pipeline.
//!
//! ```text
//! embed query → hybrid search (over-fetched) → rerank
//!             → graph expansion over top seeds → merge → rerank → top-k
//! ```
//!
//! Failure policy: a hybrid-search failure fails the request; a reranker
//! failure keeps the previous ordering; a graph failure drops expansion and
//! reports itself in the response's `graph.error`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::graph::GraphStore;
use crate::llm::Embedder;
use crate::models::Chunk;
use crate::rerank::Reranker;
use crate::scope::{ScopeKey, Visibility};
use crate::vector::VectorStore;

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 50;
pub const DEFAULT_ALPHA: f64 = 0.5;

/// Over-fetch factor bounds for the first-pass hybrid search.
const MIN_CANDIDATES: usize = 20;
const MAX_CANDIDATES: usize = 100;
/// Seeds handed to graph expansion.
const MAX_SEEDS: usize = 10;
/// Entities considered per expansion.
const EXPANSION_ENTITY_LIMIT: usize = 25;

#[derive(Debug, Clone, Deserialize)]
pub struct RetrieveRequest {
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_alpha() -> f64 {
    DEFAULT_ALPHA
}

/// Where a result came from: the hybrid index or graph expansion only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Weaviate,
    Graph,
}

/// One retrieval hit as returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub source: ResultSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weaviate_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    pub chunk_id: Uuid,
    pub doc_id: Uuid,
    #[serde(flatten)]
    pub scope: ScopeKey,
    pub title: String,
    pub section: String,
    pub summary: String,
    pub pages: Vec<u32>,
    pub text: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub also_from_graph: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_shared_entities: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_entities: Option<Vec<String>>,
}

impl RetrievedChunk {
    fn from_chunk(chunk: Chunk, source: ResultSource) -> Self {
        RetrievedChunk {
            source,
            weaviate_uuid: None,
            score: None,
            rerank_score: None,
            chunk_id: chunk.chunk_id,
            doc_id: chunk.doc_id,
            scope: chunk.scope,
            title: chunk.title,
            section: chunk.section,
            summary: chunk.summary,
            pages: chunk.pages,
            text: chunk.text,
            also_from_graph: false,
            graph_shared_entities: None,
            graph_entities: None,
        }
    }
}

/// Expansion bookkeeping returned alongside the results.
#[derive(Debug, Clone, Serialize)]
pub struct GraphBlock {
    pub enabled: bool,
    pub seed_chunk_ids: Vec<Uuid>,
    pub expanded_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrieveResponse {
    pub query: String,
    pub count: usize,
    pub results: Vec<RetrievedChunk>,
    pub graph: GraphBlock,
}

/// The adapters retrieval reads from.
pub struct RetrievalDeps<'a> {
    pub embedder: &'a dyn Embedder,
    pub vector: &'a dyn VectorStore,
    pub graph: &'a dyn GraphStore,
    pub reranker: Option<&'a dyn Reranker>,
}

pub async fn retrieve(
    deps: &RetrievalDeps<'_>,
    vis: &Visibility,
    req: &RetrieveRequest,
) -> Result<RetrieveResponse, ServiceError> {
    let query = req.query.trim();
    if query.is_empty() {
        return Err(ServiceError::Validation("query must not be empty".into()));
    }
    if !(1..=MAX_LIMIT).contains(&req.limit) {
        return Err(ServiceError::Validation(format!(
            "limit must be in [1, {}]",
            MAX_LIMIT
        )));
    }
    if !(0.0..=1.0).contains(&req.alpha) {
        return Err(ServiceError::Validation("alpha must be in [0, 1]".into()));
    }

    // Sparse-only requests never touch the embedder.
    let query_vector = if req.alpha > 0.0 {
        let mut vectors = deps.embedder.embed(&[query.to_string()]).await?;
        vectors.pop()
    } else {
        None
    };

    let candidate_k = (req.limit * 4).clamp(MIN_CANDIDATES, MAX_CANDIDATES);
    let hits = deps
        .vector
        .hybrid_search(query, query_vector.as_deref(), req.alpha, candidate_k, vis)
        .await?;

    let mut results: Vec<RetrievedChunk> = hits
        .into_iter()
        .map(|hit| {
            let mut item = RetrievedChunk::from_chunk(hit.chunk, ResultSource::Weaviate);
            item.weaviate_uuid = Some(hit.weaviate_uuid);
            item.score = hit.score;
            item
        })
        .collect();

    // First rerank orders the seed pool for expansion.
    apply_rerank(deps.reranker, query, &mut results).await;

    let mut graph = GraphBlock {
        enabled: deps.graph.enabled(),
        seed_chunk_ids: Vec::new(),
        expanded_count: 0,
        error: None,
    };

    if graph.enabled && !results.is_empty() {
        let seeds: Vec<Uuid> = results
            .iter()
            .take(MAX_SEEDS.min(results.len()))
            .map(|r| r.chunk_id)
            .collect();
        graph.seed_chunk_ids = seeds.clone();

        let expansion_limit = (req.limit * 2).max(10);
        match deps
            .graph
            .expand_by_shared_entities(&seeds, vis, expansion_limit, EXPANSION_ENTITY_LIMIT)
            .await
        {
            Ok(expansions) => {
                graph.expanded_count = expansions.len();
                merge_expansions(&mut results, expansions);
            }
            Err(e) => {
                tracing::warn!(error = %e, "graph expansion failed, continuing without it");
                graph.error = Some(e.to_string());
            }
        }
    }

    // Second rerank over the merged set decides the final order.
    apply_rerank(deps.reranker, query, &mut results).await;
    results.truncate(req.limit);

    Ok(RetrieveResponse {
        query: query.to_string(),
        count: results.len(),
        results,
        graph,
    })
}

/// Cross-encodes and re-sorts in place. On failure the existing order is
/// kept and previous rerank scores are left untouched.
async fn apply_rerank(reranker: Option<&dyn Reranker>, query: &str, results: &mut [RetrievedChunk]) {
    let Some(reranker) = reranker else { return };
    if results.is_empty() {
        return;
    }

    let texts: Vec<String> = results.iter().map(|r| r.text.clone()).collect();
    match reranker.score(query, &texts).await {
        Ok(scores) => {
            for (result, score) in results.iter_mut().zip(scores) {
                result.rerank_score = Some(score);
            }
            results.sort_by(|a, b| {
                b.rerank_score
                    .partial_cmp(&a.rerank_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        Err(e) => {
            tracing::warn!(error = %e, "rerank failed, keeping previous ordering");
        }
    }
}

/// Folds expanded chunks into the candidate list. A chunk present in both
/// keeps its hybrid identity and gains the graph annotations.
fn merge_expansions(results: &mut Vec<RetrievedChunk>, expansions: Vec<crate::graph::GraphExpansion>) {
    let mut by_id: HashMap<Uuid, usize> = results
        .iter()
        .enumerate()
        .map(|(idx, r)| (r.chunk_id, idx))
        .collect();

    for expansion in expansions {
        match by_id.get(&expansion.chunk.chunk_id) {
            Some(&idx) => {
                let existing = &mut results[idx];
                existing.also_from_graph = true;
                existing.graph_shared_entities = Some(expansion.shared_entities);
                existing.graph_entities = Some(expansion.entity_names);
            }
            None => {
                let mut item =
                    RetrievedChunk::from_chunk(expansion.chunk, ResultSource::Graph);
                item.graph_shared_entities = Some(expansion.shared_entities);
                item.graph_entities = Some(expansion.entity_names);
                by_id.insert(item.chunk_id, results.len());
                results.push(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_k_bounds() {
        // limit 1 → floor of 20; limit 50 → ceiling of 100.
        assert_eq!((1usize * 4).clamp(MIN_CANDIDATES, MAX_CANDIDATES), 20);
        assert_eq!((10usize * 4).clamp(MIN_CANDIDATES, MAX_CANDIDATES), 40);
        assert_eq!((50usize * 4).clamp(MIN_CANDIDATES, MAX_CANDIDATES), 100);
    }

    #[test]
    fn request_defaults() {
        let req: RetrieveRequest = serde_json::from_str(r#"{"query": "q"}"#).unwrap();
        assert_eq!(req.limit, DEFAULT_LIMIT);
        assert_eq!(req.alpha, DEFAULT_ALPHA);
    }

    #[test]
    fn merged_duplicates_keep_hybrid_identity() {
        let chunk_id = Uuid::new_v4();
        let chunk = Chunk {
            chunk_id,
            doc_id: Uuid::new_v4(),
            scope: ScopeKey::tenant("acme"),
            start_char: 0,
            end_char: 5,
            pages: vec![1],
            title: "T".into(),
            section: "s".into(),
            summary: String::new(),
            why_this_chunk: String::new(),
            text: "hello".into(),
        };
        let mut results = vec![{
            let mut r = RetrievedChunk::from_chunk(chunk.clone(), ResultSource::Weaviate);
            r.weaviate_uuid = Some(chunk_id.to_string());
            r.score = Some(0.7);
            r
        }];

        merge_expansions(
            &mut results,
            vec![crate::graph::GraphExpansion {
                chunk,
                shared_entities: 3,
                entity_names: vec!["acme".into()],
            }],
        );

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, ResultSource::Weaviate);
        assert_eq!(results[0].score, Some(0.7));
        assert!(results[0].also_from_graph);
        assert_eq!(results[0].graph_shared_entities, Some(3));
    }

    #[test]
    fn graph_only_results_are_tagged() {
        let chunk = Chunk {
            chunk_id: Uuid::new_v4(),
            doc_id: Uuid::new_v4(),
            scope: ScopeKey::tenant("acme"),
            start_char: 0,
            end_char: 5,
            pages: vec![1],
            title: "T".into(),
            section: "s".into(),
            summary: String::new(),
            why_this_chunk: String::new(),
            text: "hello".into(),
        };
        let mut results = Vec::new();
        merge_expansions(
            &mut results,
            vec![crate::graph::GraphExpansion {
                chunk,
                shared_entities: 1,
                entity_names: vec![],
            }],
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, ResultSource::Graph);
        assert!(results[0].weaviate_uuid.is_none());
        assert!(!results[0].also_from_graph);
    }

    #[test]
    fn serialized_result_omits_empty_graph_fields() {
        let chunk = Chunk {
            chunk_id: Uuid::new_v4(),
            doc_id: Uuid::new_v4(),
            scope: ScopeKey::tenant("acme"),
            start_char: 0,
            end_char: 5,
            pages: vec![1],
            title: "T".into(),
            section: "s".into(),
            summary: String::new(),
            why_this_chunk: String::new(),
            text: "hello".into(),
        };
        let item = RetrievedChunk::from_chunk(chunk, ResultSource::Weaviate);
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["source"], "weaviate");
        assert!(json.get("also_from_graph").is_none());
        assert!(json.get("graph_shared_entities").is_none());
        assert_eq!(json["tenant_id"], "acme");
    }
}
