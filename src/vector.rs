//! Vector store adapter (Weaviate).
//!
//! Chunks are stored with externally supplied vectors (`vectorizer: none`)
//! plus their scope properties, so hybrid search can push the visibility
//! filter down into the store instead of post-filtering. Schema and object
//! writes go through the REST API; hybrid search goes through GraphQL.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::Chunk;
use crate::scope::{Scope, ScopeKey, Visibility};

/// One hybrid-search hit: the store's object id, the fused score, and the
/// chunk payload reconstructed from stored properties.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub weaviate_uuid: String,
    pub score: Option<f64>,
    pub chunk: Chunk,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotently creates the collection with external-vector mode.
    async fn ensure_collection(&self) -> Result<(), ServiceError>;

    async fn insert(&self, chunk: &Chunk, vector: &[f32]) -> Result<(), ServiceError>;

    /// BM25/dense hybrid search. `alpha` 0 is sparse-only (no vector
    /// needed), 1 is dense-only.
    async fn hybrid_search(
        &self,
        query: &str,
        vector: Option<&[f32]>,
        alpha: f64,
        limit: usize,
        vis: &Visibility,
    ) -> Result<Vec<ScoredChunk>, ServiceError>;

    async fn delete_by_doc(&self, doc_id: Uuid) -> Result<(), ServiceError>;

    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), ServiceError>;

    /// Drops and recreates the collection (admin reset).
    async fn delete_all(&self) -> Result<(), ServiceError>;

    /// Liveness probe for `/health`.
    async fn ping(&self) -> Result<(), ServiceError>;
}

// ============ Weaviate implementation ============

pub struct WeaviateStore {
    http: reqwest::Client,
    base_url: String,
    class: String,
}

fn http_err(e: reqwest::Error) -> ServiceError {
    ServiceError::transient("weaviate", e.to_string())
}

impl WeaviateStore {
    pub fn new(base_url: &str, class: &str) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ServiceError::Internal(format!("http client: {}", e)))?;
        Ok(WeaviateStore {
            http,
            base_url: base_url.to_string(),
            class: class.to_string(),
        })
    }

    fn class_schema(&self) -> Value {
        let text_prop = |name: &str| json!({"name": name, "dataType": ["text"]});
        let int_prop = |name: &str| json!({"name": name, "dataType": ["int"]});
        json!({
            "class": self.class,
            "description": "Document chunks with external vectors for hybrid retrieval",
            "vectorizer": "none",
            "properties": [
                text_prop("text"),
                text_prop("title"),
                text_prop("section"),
                text_prop("summary"),
                {"name": "pages", "dataType": ["int[]"]},
                text_prop("whyThisChunk"),
                text_prop("chunkId"),
                text_prop("parentDocId"),
                int_prop("startChar"),
                int_prop("endChar"),
                text_prop("tenantId"),
                text_prop("scope"),
                text_prop("workspaceId"),
                text_prop("principalId"),
            ]
        })
    }

    fn chunk_properties(chunk: &Chunk) -> Value {
        json!({
            "text": chunk.text,
            "title": chunk.title,
            "section": chunk.section,
            "summary": chunk.summary,
            "pages": chunk.pages,
            "whyThisChunk": chunk.why_this_chunk,
            "chunkId": chunk.chunk_id.to_string(),
            "parentDocId": chunk.doc_id.to_string(),
            "startChar": chunk.start_char,
            "endChar": chunk.end_char,
            "tenantId": chunk.scope.tenant_id,
            "scope": chunk.scope.scope.as_str(),
            "workspaceId": chunk.scope.workspace_id,
            "principalId": chunk.scope.principal_id,
        })
    }

    async fn batch_delete(&self, where_filter: Value) -> Result<(), ServiceError> {
        let body = json!({
            "match": { "class": self.class, "where": where_filter }
        });
        let response = self
            .http
            .delete(format!("{}/v1/batch/objects", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(http_err)?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ServiceError::fatal(
                "weaviate",
                format!("batch delete HTTP {}: {}", status, text),
            ));
        }
        Ok(())
    }
}

/// Renders the visibility set as a GraphQL `where` filter literal. Kept in
/// sync with the SQL and Cypher scope filters.
fn graphql_where(vis: &Visibility) -> String {
    let text = |s: &str| serde_json::to_string(s).unwrap_or_else(|_| "\"\"".into());

    let mut branches =
        vec!["{path: [\"scope\"], operator: Equal, valueText: \"tenant\"}".to_string()];
    if let Some(ws) = &vis.workspace_id {
        branches.push(format!(
            "{{operator: And, operands: [\
             {{path: [\"scope\"], operator: Equal, valueText: \"workspace\"}}, \
             {{path: [\"workspaceId\"], operator: Equal, valueText: {ws}}}]}}",
            ws = text(ws)
        ));
        if let Some(p) = &vis.principal_id {
            branches.push(format!(
                "{{operator: And, operands: [\
                 {{path: [\"scope\"], operator: Equal, valueText: \"user\"}}, \
                 {{path: [\"workspaceId\"], operator: Equal, valueText: {ws}}}, \
                 {{path: [\"principalId\"], operator: Equal, valueText: {p}}}]}}",
                ws = text(ws),
                p = text(p)
            ));
        }
    }

    format!(
        "{{operator: And, operands: [\
         {{path: [\"tenantId\"], operator: Equal, valueText: {tenant}}}, \
         {{operator: Or, operands: [{branches}]}}]}}",
        tenant = text(&vis.tenant_id),
        branches = branches.join(", ")
    )
}

fn render_vector(vector: &[f32]) -> String {
    let parts: Vec<String> = vector.iter().map(|v| format!("{}", v)).collect();
    format!("[{}]", parts.join(","))
}

fn props_to_chunk(props: &Value) -> Option<Chunk> {
    let get_str = |key: &str| props.get(key).and_then(Value::as_str).unwrap_or_default();
    let scope = Scope::parse(get_str("scope"))?;
    let opt = |key: &str| {
        props
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };

    Some(Chunk {
        chunk_id: Uuid::parse_str(get_str("chunkId")).ok()?,
        doc_id: Uuid::parse_str(get_str("parentDocId")).ok()?,
        scope: ScopeKey {
            tenant_id: get_str("tenantId").to_string(),
            scope,
            workspace_id: opt("workspaceId"),
            principal_id: opt("principalId"),
        },
        start_char: props.get("startChar").and_then(Value::as_u64).unwrap_or(0) as usize,
        end_char: props.get("endChar").and_then(Value::as_u64).unwrap_or(0) as usize,
        pages: props
            .get("pages")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_u64().map(|n| n as u32)).collect())
            .unwrap_or_default(),
        title: get_str("title").to_string(),
        section: get_str("section").to_string(),
        summary: get_str("summary").to_string(),
        why_this_chunk: get_str("whyThisChunk").to_string(),
        text: get_str("text").to_string(),
    })
}

#[async_trait]
impl VectorStore for WeaviateStore {
    async fn ensure_collection(&self) -> Result<(), ServiceError> {
        let response = self
            .http
            .get(format!("{}/v1/schema/{}", self.base_url, self.class))
            .send()
            .await
            .map_err(http_err)?;

        if response.status().is_success() {
            return Ok(());
        }
        if response.status().as_u16() != 404 {
            let status = response.status();
            return Err(ServiceError::transient(
                "weaviate",
                format!("schema lookup HTTP {}", status),
            ));
        }

        let response = self
            .http
            .post(format!("{}/v1/schema", self.base_url))
            .json(&self.class_schema())
            .send()
            .await
            .map_err(http_err)?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            // Lost the creation race with a concurrent worker: fine.
            if status.as_u16() == 422 && text.contains("already exists") {
                return Ok(());
            }
            return Err(ServiceError::fatal(
                "weaviate",
                format!("schema create HTTP {}: {}", status, text),
            ));
        }
        Ok(())
    }

    async fn insert(&self, chunk: &Chunk, vector: &[f32]) -> Result<(), ServiceError> {
        let body = json!({
            "class": self.class,
            "id": chunk.chunk_id.to_string(),
            "properties": Self::chunk_properties(chunk),
            "vector": vector,
        });
        let response = self
            .http
            .post(format!("{}/v1/objects", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(http_err)?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ServiceError::fatal(
                "weaviate",
                format!("insert HTTP {}: {}", status, text),
            ));
        }
        Ok(())
    }

    async fn hybrid_search(
        &self,
        query: &str,
        vector: Option<&[f32]>,
        alpha: f64,
        limit: usize,
        vis: &Visibility,
    ) -> Result<Vec<ScoredChunk>, ServiceError> {
        let query_literal = serde_json::to_string(query)
            .map_err(|e| ServiceError::Internal(format!("encode query: {}", e)))?;
        let vector_arg = vector
            .map(|v| format!(", vector: {}", render_vector(v)))
            .unwrap_or_default();

        let gql = format!(
            "{{ Get {{ {class}(limit: {limit}, \
             hybrid: {{query: {query}, alpha: {alpha}{vector_arg}}}, \
             where: {where_filter}) {{ \
             text title section summary pages whyThisChunk chunkId parentDocId \
             startChar endChar tenantId scope workspaceId principalId \
             _additional {{ id score }} }} }} }}",
            class = self.class,
            limit = limit,
            query = query_literal,
            alpha = alpha,
            vector_arg = vector_arg,
            where_filter = graphql_where(vis),
        );

        let response = self
            .http
            .post(format!("{}/v1/graphql", self.base_url))
            .json(&json!({ "query": gql }))
            .send()
            .await
            .map_err(http_err)?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(ServiceError::transient(
                "weaviate",
                format!("graphql HTTP {}", status),
            ));
        }

        let body: Value = response.json().await.map_err(http_err)?;
        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                return Err(ServiceError::fatal(
                    "weaviate",
                    format!("graphql errors: {}", Value::Array(errors.clone())),
                ));
            }
        }

        let hits = body["data"]["Get"][&self.class]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::with_capacity(hits.len());
        for hit in &hits {
            let Some(chunk) = props_to_chunk(hit) else {
                continue;
            };
            let additional = &hit["_additional"];
            let weaviate_uuid = additional["id"].as_str().unwrap_or_default().to_string();
            // Hybrid scores arrive as strings from the GraphQL API.
            let score = match &additional["score"] {
                Value::String(s) => s.parse::<f64>().ok(),
                Value::Number(n) => n.as_f64(),
                _ => None,
            };
            out.push(ScoredChunk {
                weaviate_uuid,
                score,
                chunk,
            });
        }
        Ok(out)
    }

    async fn delete_by_doc(&self, doc_id: Uuid) -> Result<(), ServiceError> {
        self.batch_delete(json!({
            "path": ["parentDocId"],
            "operator": "Equal",
            "valueText": doc_id.to_string(),
        }))
        .await
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), ServiceError> {
        self.batch_delete(json!({
            "path": ["tenantId"],
            "operator": "Equal",
            "valueText": tenant_id,
        }))
        .await
    }

    async fn delete_all(&self) -> Result<(), ServiceError> {
        let response = self
            .http
            .delete(format!("{}/v1/schema/{}", self.base_url, self.class))
            .send()
            .await
            .map_err(http_err)?;
        // 404 means the collection never existed; recreate either way.
        if !response.status().is_success() && response.status().as_u16() != 404 {
            let status = response.status();
            return Err(ServiceError::fatal(
                "weaviate",
                format!("schema delete HTTP {}", status),
            ));
        }
        self.ensure_collection().await
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        let response = self
            .http
            .get(format!("{}/v1/meta", self.base_url))
            .send()
            .await
            .map_err(http_err)?;
        if !response.status().is_success() {
            return Err(ServiceError::transient(
                "weaviate",
                format!("meta HTTP {}", response.status()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn where_filter_tenant_only() {
        let vis = Visibility::new("acme", None, None);
        let rendered = graphql_where(&vis);
        assert!(rendered.contains("\"tenantId\""));
        assert!(rendered.contains("valueText: \"acme\""));
        assert!(rendered.contains("valueText: \"tenant\""));
        assert!(!rendered.contains("workspaceId"));
        assert!(!rendered.contains("principalId"));
    }

    #[test]
    fn where_filter_full_visibility() {
        let vis = Visibility::new("acme", Some("ws-1".into()), Some("u-7".into()));
        let rendered = graphql_where(&vis);
        assert!(rendered.contains("valueText: \"workspace\""));
        assert!(rendered.contains("valueText: \"user\""));
        assert!(rendered.contains("valueText: \"ws-1\""));
        assert!(rendered.contains("valueText: \"u-7\""));
    }

    #[test]
    fn where_filter_escapes_quotes() {
        let vis = Visibility::new("acme\"}", None, None);
        let rendered = graphql_where(&vis);
        assert!(rendered.contains(r#"valueText: "acme\"}""#));
    }

    #[test]
    fn props_roundtrip_through_store_shape() {
        let chunk = Chunk {
            chunk_id: Uuid::new_v4(),
            doc_id: Uuid::new_v4(),
            scope: ScopeKey::workspace("acme", "ws-1"),
            start_char: 10,
            end_char: 90,
            pages: vec![1, 2],
            title: "T".into(),
            section: "s".into(),
            summary: "sum".into(),
            why_this_chunk: "why".into(),
            text: "body".into(),
        };
        let props = WeaviateStore::chunk_properties(&chunk);
        let restored = props_to_chunk(&props).unwrap();
        assert_eq!(restored, chunk);
    }

    #[test]
    fn vector_renders_compact() {
        assert_eq!(render_vector(&[1.0, -0.5]), "[1,-0.5]");
    }
}
