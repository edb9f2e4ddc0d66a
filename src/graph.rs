//! Entity graph adapter (Neo4j).
//!
//! The graph holds `(Chunk)-[:MENTIONS]->(Entity)` with all writes going
//! through `MERGE`, so re-linking the same chunk and entities is a no-op.
//! Cypher runs over the transactional HTTP endpoint. When the graph is
//! disabled by configuration, [`NullGraphStore`] stands in and every call
//! succeeds with an empty result; when the real store is unreachable, calls
//! return transient errors and each call site degrades (the worker skips
//! the stage, retrieval reports `graph.error`, browse endpoints go empty).

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::{Chunk, Entity};
use crate::scope::{Scope, ScopeKey, Visibility};

/// A chunk reached through shared entities during graph expansion.
#[derive(Debug, Clone)]
pub struct GraphExpansion {
    pub chunk: Chunk,
    /// How many distinct entities this chunk shares with the seed set.
    pub shared_entities: i64,
    /// A few of the shared entity names, for display.
    pub entity_names: Vec<String>,
}

/// An entity with its mention count, for the browse endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EntitySummary {
    pub entity_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub mentions: i64,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    fn enabled(&self) -> bool {
        true
    }

    /// Uniqueness constraints on chunk and entity ids. Idempotent.
    async fn ensure_constraints(&self) -> Result<(), ServiceError>;

    /// MERGEs the chunk node, every entity node, and the MENTIONS edges.
    async fn link_chunk_entities(
        &self,
        chunk: &Chunk,
        entities: &[Entity],
    ) -> Result<(), ServiceError>;

    /// Chunks sharing at least one entity with any seed, excluding the
    /// seeds themselves, scope-filtered, ordered by shared-entity count.
    async fn expand_by_shared_entities(
        &self,
        seed_chunk_ids: &[Uuid],
        vis: &Visibility,
        limit: usize,
        entity_limit: usize,
    ) -> Result<Vec<GraphExpansion>, ServiceError>;

    async fn top_entities(
        &self,
        vis: &Visibility,
        name_query: Option<&str>,
        entity_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EntitySummary>, ServiceError>;

    async fn chunks_for_entity(
        &self,
        entity_id: &str,
        vis: &Visibility,
        limit: usize,
    ) -> Result<Vec<Chunk>, ServiceError>;

    async fn entities_for_document(
        &self,
        doc_id: Uuid,
        vis: &Visibility,
        limit: usize,
    ) -> Result<Vec<EntitySummary>, ServiceError>;

    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), ServiceError>;

    async fn delete_all(&self) -> Result<(), ServiceError>;

    async fn ping(&self) -> Result<(), ServiceError>;
}

// ============ Disabled implementation ============

/// Stand-in when `GRAPH_ENABLED=0`: every call is an empty success.
pub struct NullGraphStore;

#[async_trait]
impl GraphStore for NullGraphStore {
    fn enabled(&self) -> bool {
        false
    }

    async fn ensure_constraints(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn link_chunk_entities(
        &self,
        _chunk: &Chunk,
        _entities: &[Entity],
    ) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn expand_by_shared_entities(
        &self,
        _seed_chunk_ids: &[Uuid],
        _vis: &Visibility,
        _limit: usize,
        _entity_limit: usize,
    ) -> Result<Vec<GraphExpansion>, ServiceError> {
        Ok(Vec::new())
    }

    async fn top_entities(
        &self,
        _vis: &Visibility,
        _name_query: Option<&str>,
        _entity_type: Option<&str>,
        _limit: usize,
    ) -> Result<Vec<EntitySummary>, ServiceError> {
        Ok(Vec::new())
    }

    async fn chunks_for_entity(
        &self,
        _entity_id: &str,
        _vis: &Visibility,
        _limit: usize,
    ) -> Result<Vec<Chunk>, ServiceError> {
        Ok(Vec::new())
    }

    async fn entities_for_document(
        &self,
        _doc_id: Uuid,
        _vis: &Visibility,
        _limit: usize,
    ) -> Result<Vec<EntitySummary>, ServiceError> {
        Ok(Vec::new())
    }

    async fn delete_tenant(&self, _tenant_id: &str) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

// ============ Neo4j implementation ============

pub struct Neo4jStore {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    database: String,
}

/// Scope predicate over a chunk variable; mirrors the SQL and Weaviate
/// filters. Parameters `$workspace_id` / `$principal_id` may be null.
fn scope_filter_cypher(var: &str) -> String {
    format!(
        "({v}.scope = 'tenant' \
         OR ($workspace_id IS NOT NULL AND {v}.scope = 'workspace' AND {v}.workspaceId = $workspace_id) \
         OR ($workspace_id IS NOT NULL AND $principal_id IS NOT NULL AND {v}.scope = 'user' \
             AND {v}.workspaceId = $workspace_id AND {v}.principalId = $principal_id))",
        v = var
    )
}

fn vis_params(vis: &Visibility) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("tenant_id".into(), json!(vis.tenant_id));
    params.insert("workspace_id".into(), json!(vis.workspace_id));
    params.insert("principal_id".into(), json!(vis.principal_id));
    params
}

fn row_to_chunk(row: &Map<String, Value>) -> Option<Chunk> {
    let get_str = |key: &str| row.get(key).and_then(Value::as_str).unwrap_or_default();
    let opt = |key: &str| {
        row.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };

    Some(Chunk {
        chunk_id: Uuid::parse_str(get_str("chunk_id")).ok()?,
        doc_id: Uuid::parse_str(get_str("doc_id")).ok()?,
        scope: ScopeKey {
            tenant_id: get_str("tenant_id").to_string(),
            scope: Scope::parse(get_str("scope"))?,
            workspace_id: opt("workspace_id"),
            principal_id: opt("principal_id"),
        },
        start_char: row.get("start_char").and_then(Value::as_u64).unwrap_or(0) as usize,
        end_char: row.get("end_char").and_then(Value::as_u64).unwrap_or(0) as usize,
        pages: row
            .get("pages")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_u64().map(|n| n as u32)).collect())
            .unwrap_or_default(),
        title: get_str("title").to_string(),
        section: get_str("section").to_string(),
        summary: get_str("summary").to_string(),
        why_this_chunk: String::new(),
        text: get_str("text").to_string(),
    })
}

const CHUNK_RETURN: &str = "c.chunkId AS chunk_id, c.parentDocId AS doc_id, \
     c.tenantId AS tenant_id, c.scope AS scope, c.workspaceId AS workspace_id, \
     c.principalId AS principal_id, c.title AS title, c.section AS section, \
     c.summary AS summary, c.pages AS pages, c.startChar AS start_char, \
     c.endChar AS end_char, c.text AS text";

impl Neo4jStore {
    pub fn new(
        base_url: &str,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ServiceError::Internal(format!("http client: {}", e)))?;
        Ok(Neo4jStore {
            http,
            base_url: base_url.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            database: database.to_string(),
        })
    }

    /// Runs one Cypher statement through `tx/commit` and returns the rows
    /// as column-name → value maps.
    async fn run(
        &self,
        statement: &str,
        parameters: Map<String, Value>,
    ) -> Result<Vec<Map<String, Value>>, ServiceError> {
        let body = json!({
            "statements": [{ "statement": statement, "parameters": parameters }]
        });
        let response = self
            .http
            .post(format!(
                "{}/db/{}/tx/commit",
                self.base_url, self.database
            ))
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::transient("neo4j", e.to_string()))?;

        if !response.status().is_success() {
            return Err(ServiceError::transient(
                "neo4j",
                format!("HTTP {}", response.status()),
            ));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::transient("neo4j", e.to_string()))?;

        if let Some(errors) = payload.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                return Err(ServiceError::fatal(
                    "neo4j",
                    format!("cypher errors: {}", Value::Array(errors.clone())),
                ));
            }
        }

        let result = &payload["results"][0];
        let columns: Vec<String> = result["columns"]
            .as_array()
            .map(|cols| {
                cols.iter()
                    .filter_map(|c| c.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let mut rows = Vec::new();
        for item in result["data"].as_array().unwrap_or(&Vec::new()) {
            let Some(values) = item.get("row").and_then(Value::as_array) else {
                continue;
            };
            let mut row = Map::new();
            for (col, value) in columns.iter().zip(values.iter()) {
                row.insert(col.clone(), value.clone());
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn ensure_constraints(&self) -> Result<(), ServiceError> {
        for stmt in [
            "CREATE CONSTRAINT chunk_chunk_id IF NOT EXISTS FOR (c:Chunk) REQUIRE c.chunkId IS UNIQUE",
            "CREATE CONSTRAINT entity_entity_id IF NOT EXISTS FOR (e:Entity) REQUIRE e.entityId IS UNIQUE",
        ] {
            self.run(stmt, Map::new()).await?;
        }
        Ok(())
    }

    async fn link_chunk_entities(
        &self,
        chunk: &Chunk,
        entities: &[Entity],
    ) -> Result<(), ServiceError> {
        let entity_rows: Vec<Value> = entities
            .iter()
            .map(|e| {
                json!({
                    "entity_id": e.entity_id(),
                    "type": e.entity_type,
                    "name": e.name,
                })
            })
            .collect();

        let mut params = Map::new();
        params.insert("chunk_id".into(), json!(chunk.chunk_id.to_string()));
        params.insert("doc_id".into(), json!(chunk.doc_id.to_string()));
        params.insert("tenant_id".into(), json!(chunk.scope.tenant_id));
        params.insert("scope".into(), json!(chunk.scope.scope.as_str()));
        params.insert("workspace_id".into(), json!(chunk.scope.workspace_id));
        params.insert("principal_id".into(), json!(chunk.scope.principal_id));
        params.insert("title".into(), json!(chunk.title));
        params.insert("section".into(), json!(chunk.section));
        params.insert("summary".into(), json!(chunk.summary));
        params.insert("pages".into(), json!(chunk.pages));
        params.insert("start_char".into(), json!(chunk.start_char));
        params.insert("end_char".into(), json!(chunk.end_char));
        params.insert("text".into(), json!(chunk.text));
        params.insert("entities".into(), Value::Array(entity_rows));

        let statement = "\
MERGE (c:Chunk {chunkId: $chunk_id})
SET c.parentDocId = $doc_id,
    c.tenantId = $tenant_id,
    c.scope = $scope,
    c.workspaceId = $workspace_id,
    c.principalId = $principal_id,
    c.title = $title,
    c.section = $section,
    c.summary = $summary,
    c.pages = $pages,
    c.startChar = $start_char,
    c.endChar = $end_char,
    c.text = $text,
    c.updatedAt = datetime()
WITH c
UNWIND $entities AS ent
MERGE (e:Entity {entityId: ent.entity_id})
SET e.tenantId = $tenant_id,
    e.type = ent.type,
    e.name = ent.name,
    e.updatedAt = datetime()
MERGE (c)-[:MENTIONS]->(e)";

        self.run(statement, params).await?;
        Ok(())
    }

    async fn expand_by_shared_entities(
        &self,
        seed_chunk_ids: &[Uuid],
        vis: &Visibility,
        limit: usize,
        entity_limit: usize,
    ) -> Result<Vec<GraphExpansion>, ServiceError> {
        if seed_chunk_ids.is_empty() {
            return Ok(Vec::new());
        }

        let statement = format!(
            "MATCH (seed:Chunk)
WHERE seed.tenantId = $tenant_id AND seed.chunkId IN $seed_chunk_ids AND {seed_filter}
MATCH (seed)-[:MENTIONS]->(e:Entity)
WHERE e.tenantId = $tenant_id
WITH e, count(*) AS freq
ORDER BY freq DESC
LIMIT $entity_limit
MATCH (e)<-[:MENTIONS]-(c:Chunk)
WHERE c.tenantId = $tenant_id AND NOT (c.chunkId IN $seed_chunk_ids) AND {chunk_filter}
WITH c, collect(DISTINCT e.name) AS via_entities, count(DISTINCT e) AS shared_count
RETURN {chunk_return},
  shared_count AS graph_shared_entities,
  via_entities[0..5] AS graph_entities
ORDER BY graph_shared_entities DESC
LIMIT $limit",
            seed_filter = scope_filter_cypher("seed"),
            chunk_filter = scope_filter_cypher("c"),
            chunk_return = CHUNK_RETURN,
        );

        let mut params = vis_params(vis);
        params.insert(
            "seed_chunk_ids".into(),
            json!(seed_chunk_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()),
        );
        params.insert("limit".into(), json!(limit));
        params.insert("entity_limit".into(), json!(entity_limit));

        let rows = self.run(&statement, params).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let chunk = row_to_chunk(row)?;
                Some(GraphExpansion {
                    chunk,
                    shared_entities: row
                        .get("graph_shared_entities")
                        .and_then(Value::as_i64)
                        .unwrap_or(0),
                    entity_names: row
                        .get("graph_entities")
                        .and_then(Value::as_array)
                        .map(|a| {
                            a.iter()
                                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                                .collect()
                        })
                        .unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn top_entities(
        &self,
        vis: &Visibility,
        name_query: Option<&str>,
        entity_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EntitySummary>, ServiceError> {
        let mut conditions = String::new();
        if name_query.is_some() {
            conditions.push_str(" AND toLower(e.name) CONTAINS toLower($name_query)");
        }
        if entity_type.is_some() {
            conditions.push_str(" AND e.type = $entity_type");
        }

        let statement = format!(
            "MATCH (e:Entity)<-[:MENTIONS]-(c:Chunk)
WHERE e.tenantId = $tenant_id AND c.tenantId = $tenant_id AND {chunk_filter}{conditions}
WITH e, count(c) AS mentions
RETURN e.entityId AS entity_id, e.name AS name, e.type AS type, mentions
ORDER BY mentions DESC, name ASC
LIMIT $limit",
            chunk_filter = scope_filter_cypher("c"),
            conditions = conditions,
        );

        let mut params = vis_params(vis);
        params.insert("name_query".into(), json!(name_query));
        params.insert("entity_type".into(), json!(entity_type));
        params.insert("limit".into(), json!(limit));

        let rows = self.run(&statement, params).await?;
        Ok(rows.iter().filter_map(row_to_entity_summary).collect())
    }

    async fn chunks_for_entity(
        &self,
        entity_id: &str,
        vis: &Visibility,
        limit: usize,
    ) -> Result<Vec<Chunk>, ServiceError> {
        let statement = format!(
            "MATCH (e:Entity {{entityId: $entity_id}})<-[:MENTIONS]-(c:Chunk)
WHERE e.tenantId = $tenant_id AND c.tenantId = $tenant_id AND {chunk_filter}
RETURN {chunk_return}
ORDER BY c.updatedAt DESC
LIMIT $limit",
            chunk_filter = scope_filter_cypher("c"),
            chunk_return = CHUNK_RETURN,
        );

        let mut params = vis_params(vis);
        params.insert("entity_id".into(), json!(entity_id));
        params.insert("limit".into(), json!(limit));

        let rows = self.run(&statement, params).await?;
        Ok(rows.iter().filter_map(row_to_chunk).collect())
    }

    async fn entities_for_document(
        &self,
        doc_id: Uuid,
        vis: &Visibility,
        limit: usize,
    ) -> Result<Vec<EntitySummary>, ServiceError> {
        let statement = format!(
            "MATCH (c:Chunk {{parentDocId: $doc_id}})-[:MENTIONS]->(e:Entity)
WHERE c.tenantId = $tenant_id AND {chunk_filter}
WITH e, count(c) AS mentions
RETURN e.entityId AS entity_id, e.name AS name, e.type AS type, mentions
ORDER BY mentions DESC, name ASC
LIMIT $limit",
            chunk_filter = scope_filter_cypher("c"),
        );

        let mut params = vis_params(vis);
        params.insert("doc_id".into(), json!(doc_id.to_string()));
        params.insert("limit".into(), json!(limit));

        let rows = self.run(&statement, params).await?;
        Ok(rows.iter().filter_map(row_to_entity_summary).collect())
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), ServiceError> {
        let mut params = Map::new();
        params.insert("tenant_id".into(), json!(tenant_id));
        self.run(
            "MATCH (c:Chunk {tenantId: $tenant_id}) DETACH DELETE c",
            params.clone(),
        )
        .await?;
        self.run(
            "MATCH (e:Entity {tenantId: $tenant_id}) DETACH DELETE e",
            params,
        )
        .await?;
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), ServiceError> {
        self.run("MATCH (c:Chunk) DETACH DELETE c", Map::new()).await?;
        self.run("MATCH (e:Entity) DETACH DELETE e", Map::new()).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        self.run("RETURN 1", Map::new()).await?;
        Ok(())
    }
}

fn row_to_entity_summary(row: &Map<String, Value>) -> Option<EntitySummary> {
    Some(EntitySummary {
        entity_id: row.get("entity_id")?.as_str()?.to_string(),
        name: row.get("name")?.as_str()?.to_string(),
        entity_type: row
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        mentions: row.get("mentions").and_then(Value::as_i64).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_filter_covers_all_three_levels() {
        let cypher = scope_filter_cypher("c");
        assert!(cypher.contains("c.scope = 'tenant'"));
        assert!(cypher.contains("c.scope = 'workspace'"));
        assert!(cypher.contains("c.scope = 'user'"));
        assert!(cypher.contains("$workspace_id IS NOT NULL"));
        assert!(cypher.contains("$principal_id IS NOT NULL"));
    }

    #[test]
    fn null_store_is_disabled_and_silent() {
        let store = NullGraphStore;
        assert!(!store.enabled());
        let vis = Visibility::new("acme", None, None);
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let out = rt
            .block_on(store.expand_by_shared_entities(&[Uuid::new_v4()], &vis, 10, 25))
            .unwrap();
        assert!(out.is_empty());
        let entities = rt.block_on(store.top_entities(&vis, None, None, 50)).unwrap();
        assert!(entities.is_empty());
    }

    #[test]
    fn chunk_row_parses() {
        let mut row = Map::new();
        let chunk_id = Uuid::new_v4();
        let doc_id = Uuid::new_v4();
        row.insert("chunk_id".into(), json!(chunk_id.to_string()));
        row.insert("doc_id".into(), json!(doc_id.to_string()));
        row.insert("tenant_id".into(), json!("acme"));
        row.insert("scope".into(), json!("tenant"));
        row.insert("workspace_id".into(), Value::Null);
        row.insert("principal_id".into(), Value::Null);
        row.insert("title".into(), json!("T"));
        row.insert("section".into(), json!("s"));
        row.insert("summary".into(), json!("sum"));
        row.insert("pages".into(), json!([1, 2]));
        row.insert("start_char".into(), json!(3));
        row.insert("end_char".into(), json!(9));
        row.insert("text".into(), json!("body"));

        let chunk = row_to_chunk(&row).unwrap();
        assert_eq!(chunk.chunk_id, chunk_id);
        assert_eq!(chunk.doc_id, doc_id);
        assert_eq!(chunk.pages, vec![1, 2]);
        assert_eq!(chunk.scope, ScopeKey::tenant("acme"));
    }

    #[test]
    fn malformed_chunk_row_is_skipped() {
        let mut row = Map::new();
        row.insert("chunk_id".into(), json!("not-a-uuid"));
        assert!(row_to_chunk(&row).is_none());
    }
}
