//! HTTP API surface.
//!
//! All `/v1` endpoints require `Authorization: Bearer <api_key>`; the token
//! resolves to a tenant through the static `RAG_TENANTS_JSON` map, and the
//! optional `X-Workspace-Id` / `X-Principal-Id` headers narrow the caller's
//! [`Visibility`]. The admin surface is gated separately by `ADMIN_API_KEY`.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/v1/whoami` | Echo the resolved request scope |
//! | `POST` | `/v1/ingest/document` | Upload a file, enqueue ingestion |
//! | `GET`  | `/v1/documents` | Visibility-filtered document listing |
//! | `GET`  | `/v1/documents/counts` | Per-status counts |
//! | `GET`  | `/v1/documents/{doc_id}` | One document row |
//! | `GET`  | `/v1/ingestions/active` | Latest snapshot per active document |
//! | `GET`  | `/v1/ingestions/stream` | SSE progress stream |
//! | `POST` | `/v1/retrieve` | Hybrid retrieval with graph expansion |
//! | `GET`  | `/v1/graph/entities` | Top entities by mentions |
//! | `GET`  | `/v1/graph/entities/{id}/chunks` | Chunks mentioning an entity |
//! | `GET`  | `/v1/graph/documents/{doc_id}/entities` | Entities per document |
//! | `GET`  | `/health` | Per-dependency probes |
//!
//! Error responses follow `{"error": {"code", "message"}}`.

use axum::extract::{Multipart, Path as AxumPath, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{async_trait, extract::FromRequestParts, Json, Router};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::Config;
use crate::error::ServiceError;
use crate::graph::GraphStore;
use crate::llm::Embedder;
use crate::meta::{DocumentFilter, MetaStore, SortField, SortOrder};
use crate::models::{Document, DocumentStatus, Job, ProgressEvent, Stage};
use crate::progress::ProgressBus;
use crate::queue::{publish_progress, Broker};
use crate::rerank::Reranker;
use crate::retrieve::{self, RetrievalDeps, RetrieveRequest};
use crate::scope::{Scope, ScopeKey, Visibility};
use crate::vector::VectorStore;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub meta: Arc<dyn MetaStore>,
    pub broker: Arc<dyn Broker>,
    pub vector: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub embedder: Arc<dyn Embedder>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub progress: Arc<ProgressBus>,
}

// ============ Error mapping ============

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ServiceError::Auth(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ServiceError::Validation(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ServiceError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ServiceError::DependencyTransient { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
            ServiceError::DependencyFatal { .. }
            | ServiceError::MalformedUpstream(_)
            | ServiceError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        let body = json!({ "error": { "code": code, "message": self.to_string() } });
        (status, Json(body)).into_response()
    }
}

// ============ Request context ============

/// Caller identity resolved once per request from the bearer token and
/// scope headers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant_id: String,
    pub workspace_id: Option<String>,
    pub principal_id: Option<String>,
}

impl RequestContext {
    pub fn visibility(&self) -> Visibility {
        Visibility::new(
            self.tenant_id.clone(),
            self.workspace_id.clone(),
            self.principal_id.clone(),
        )
    }
}

fn header_value(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for RequestContext {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let authorization = header_value(parts, "authorization")
            .ok_or_else(|| ServiceError::Auth("missing bearer token".into()))?;
        let token = authorization
            .strip_prefix("Bearer ")
            .or_else(|| authorization.strip_prefix("bearer "))
            .ok_or_else(|| ServiceError::Auth("missing bearer token".into()))?;

        let tenant_id = state
            .config
            .tenant_id_for_api_key(token)
            .ok_or_else(|| ServiceError::Auth("invalid tenant API key".into()))?
            .to_string();

        Ok(RequestContext {
            tenant_id,
            workspace_id: header_value(parts, "x-workspace-id"),
            principal_id: header_value(parts, "x-principal-id"),
        })
    }
}

// ============ Router ============

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/whoami", get(handle_whoami))
        .route("/v1/ingest/document", post(handle_ingest))
        .route("/v1/documents", get(handle_list_documents))
        .route("/v1/documents/counts", get(handle_counts))
        .route("/v1/documents/:doc_id", get(handle_get_document))
        .route("/v1/ingestions/active", get(handle_active))
        .route("/v1/ingestions/stream", get(handle_stream))
        .route("/v1/retrieve", post(handle_retrieve))
        .route("/v1/graph/entities", get(handle_top_entities))
        .route("/v1/graph/entities/:entity_id/chunks", get(handle_entity_chunks))
        .route(
            "/v1/graph/documents/:doc_id/entities",
            get(handle_document_entities),
        )
        .route("/health", get(handle_health))
        .route("/admin/status", get(handle_admin_status))
        .route("/admin/workers/start", post(handle_workers_start))
        .route("/admin/workers/stop", post(handle_workers_stop))
        .route("/admin/workers/concurrency", post(handle_set_concurrency))
        .route("/admin/reset/tenant", post(handle_reset_tenant))
        .route("/admin/reset/all", post(handle_reset_all))
        .layer(cors)
        .with_state(state)
}

/// Binds and serves until SIGINT/SIGTERM.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let addr = state.config.api_addr.clone();
    let app = build_router(state);

    tracing::info!(%addr, "api listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = term.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

// ============ GET /v1/whoami ============

async fn handle_whoami(ctx: RequestContext) -> Json<Value> {
    Json(json!({
        "tenant_id": ctx.tenant_id,
        "workspace_id": ctx.workspace_id,
        "principal_id": ctx.principal_id,
    }))
}

// ============ POST /v1/ingest/document ============

#[derive(Serialize)]
struct IngestResponse {
    doc_id: Uuid,
    status: &'static str,
}

/// Keeps the upload's display name readable while dropping anything that
/// could traverse outside the upload directory.
pub fn sanitize_display_filename(raw: &str, fallback: &str) -> String {
    let name = raw.replace('\0', "");
    let name = name.trim().replace('\\', "/");
    let name = name.trim_start_matches('/');

    let parts: Vec<&str> = name
        .split('/')
        .map(str::trim)
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect();

    let joined = parts.join("/");
    let display = if joined.is_empty() { fallback } else { &joined };
    display.chars().take(512).collect()
}

fn resolve_upload_scope(ctx: &RequestContext, scope: Scope) -> Result<ScopeKey, ServiceError> {
    match scope {
        Scope::Tenant => Ok(ScopeKey::tenant(&ctx.tenant_id)),
        Scope::Workspace => {
            let workspace = ctx.workspace_id.clone().ok_or_else(|| {
                ServiceError::Validation(
                    "missing X-Workspace-Id header for workspace scoped document".into(),
                )
            })?;
            Ok(ScopeKey::workspace(&ctx.tenant_id, workspace))
        }
        Scope::User => {
            let workspace = ctx.workspace_id.clone().ok_or_else(|| {
                ServiceError::Validation(
                    "missing X-Workspace-Id header for user scoped document".into(),
                )
            })?;
            let principal = ctx.principal_id.clone().ok_or_else(|| {
                ServiceError::Validation(
                    "missing X-Principal-Id header for user scoped document".into(),
                )
            })?;
            Ok(ScopeKey::user(&ctx.tenant_id, workspace, principal))
        }
    }
}

async fn handle_ingest(
    ctx: RequestContext,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<IngestResponse>, ServiceError> {
    let mut scope_field: Option<String> = None;
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut file_name: Option<String> = None;
    let mut file_content_type: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::Validation(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("scope") => {
                scope_field = Some(field.text().await.map_err(|e| {
                    ServiceError::Validation(format!("invalid scope field: {}", e))
                })?);
            }
            Some("file") => {
                file_name = field.file_name().map(|s| s.to_string());
                file_content_type = field.content_type().map(|s| s.to_string());
                file_bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| {
                            ServiceError::Validation(format!("invalid file field: {}", e))
                        })?
                        .to_vec(),
                );
            }
            _ => {}
        }
    }

    let scope_raw = scope_field.unwrap_or_else(|| "tenant".to_string());
    let scope = Scope::parse(scope_raw.trim())
        .ok_or_else(|| ServiceError::Validation(format!("invalid scope: {}", scope_raw)))?;
    let scope_key = resolve_upload_scope(&ctx, scope)?;

    let content = file_bytes
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| ServiceError::Validation("empty upload".into()))?;

    let doc_id = Uuid::new_v4();
    let display_filename =
        sanitize_display_filename(file_name.as_deref().unwrap_or(""), &doc_id.to_string());
    let storage_basename = display_filename
        .rsplit('/')
        .next()
        .unwrap_or(&display_filename)
        .to_string();

    // Persist to the shared volume so any worker process can read it.
    let uploads_dir = state
        .config
        .data_dir
        .join("uploads")
        .join(&ctx.tenant_id)
        .join(doc_id.to_string());
    tokio::fs::create_dir_all(&uploads_dir)
        .await
        .map_err(|e| ServiceError::Internal(format!("create upload dir: {}", e)))?;
    let storage_path = uploads_dir.join(&storage_basename);
    tokio::fs::write(&storage_path, &content)
        .await
        .map_err(|e| ServiceError::Internal(format!("write upload: {}", e)))?;

    let content_type = file_content_type.unwrap_or_else(|| "application/octet-stream".to_string());
    let doc = Document::queued(
        doc_id,
        scope_key,
        display_filename,
        content_type,
        storage_path.to_string_lossy().into_owned(),
    );

    state.meta.insert_document(&doc).await?;
    state.broker.push(&Job { doc_id }).await?;
    publish_progress(
        state.broker.as_ref(),
        &ProgressEvent::for_stage(&doc, Stage::Queued, "Queued for ingestion"),
    )
    .await?;

    Ok(Json(IngestResponse {
        doc_id,
        status: "queued",
    }))
}

// ============ GET /v1/documents ============

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    sort: Option<String>,
    order: Option<String>,
}

fn parse_limit(raw: Option<i64>, default: i64, max: i64) -> Result<i64, ServiceError> {
    let limit = raw.unwrap_or(default);
    if !(1..=max).contains(&limit) {
        return Err(ServiceError::Validation(format!(
            "limit must be in [1, {}]",
            max
        )));
    }
    Ok(limit)
}

async fn handle_list_documents(
    ctx: RequestContext,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Document>>, ServiceError> {
    let statuses = match &query.status {
        None => Vec::new(),
        Some(raw) => vec![DocumentStatus::parse(raw)
            .ok_or_else(|| ServiceError::Validation(format!("invalid status: {}", raw)))?],
    };

    let limit = parse_limit(query.limit, 100, 500)?;
    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err(ServiceError::Validation("offset must be >= 0".into()));
    }

    let sort_raw = query.sort.as_deref().unwrap_or("created_at");
    let sort = SortField::parse(sort_raw)
        .ok_or_else(|| ServiceError::Validation(format!("invalid sort: {}", sort_raw)))?;
    let order_raw = query.order.as_deref().unwrap_or("desc");
    let order = SortOrder::parse(order_raw)
        .ok_or_else(|| ServiceError::Validation(format!("invalid order: {}", order_raw)))?;

    let docs = state
        .meta
        .list_documents(
            &ctx.visibility(),
            &DocumentFilter {
                statuses,
                limit,
                offset,
                sort,
                order,
            },
        )
        .await?;
    Ok(Json(docs))
}

// ============ GET /v1/documents/counts ============

async fn handle_counts(
    ctx: RequestContext,
    State(state): State<AppState>,
) -> Result<Json<crate::meta::StatusCounts>, ServiceError> {
    let counts = state.meta.counts_by_status(&ctx.visibility()).await?;
    Ok(Json(counts))
}

// ============ GET /v1/documents/{doc_id} ============

async fn handle_get_document(
    ctx: RequestContext,
    State(state): State<AppState>,
    AxumPath(doc_id): AxumPath<Uuid>,
) -> Result<Json<Document>, ServiceError> {
    let doc = state
        .meta
        .get_document(doc_id, &ctx.visibility())
        .await?
        .ok_or_else(|| ServiceError::NotFound("document not found".into()))?;
    Ok(Json(doc))
}

// ============ GET /v1/ingestions/active ============

async fn handle_active(
    ctx: RequestContext,
    State(state): State<AppState>,
) -> Result<Json<Value>, ServiceError> {
    let docs = state
        .meta
        .list_documents(
            &ctx.visibility(),
            &DocumentFilter {
                statuses: vec![DocumentStatus::Queued, DocumentStatus::Processing],
                limit: 500,
                offset: 0,
                sort: SortField::CreatedAt,
                order: SortOrder::Desc,
            },
        )
        .await?;

    let mut active = Vec::with_capacity(docs.len());
    for doc in &docs {
        let snapshot = state.broker.get_progress(doc.doc_id).await.ok().flatten();
        match snapshot {
            Some(event) => active.push(serde_json::to_value(&event).unwrap_or(Value::Null)),
            // No snapshot yet (or expired): synthesize one from the row.
            None => active.push(
                serde_json::to_value(ProgressEvent {
                    doc_id: doc.doc_id,
                    scope: doc.scope.clone(),
                    filename: Some(doc.filename.clone()),
                    stage: doc.stage,
                    progress: doc.progress.clamp(0, 100) as u8,
                    message: Some("In progress".into()),
                    timestamp: doc.updated_at,
                })
                .unwrap_or(Value::Null),
            ),
        }
    }
    Ok(Json(json!({ "active": active })))
}

// ============ GET /v1/ingestions/stream (SSE) ============

async fn handle_stream(
    ctx: RequestContext,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let vis = ctx.visibility();
    let rx = state.progress.subscribe();

    let connected = futures::stream::once(async {
        Ok(Event::default().data(json!({"type": "connected"}).to_string()))
    });

    // A lagged receiver yields an error; ending the stream there drops the
    // slow client rather than replaying.
    let events = BroadcastStream::new(rx)
        .take_while(|result| futures::future::ready(result.is_ok()))
        .filter_map(move |result| {
            let allowed = match &result {
                Ok(event) => vis.allows(&event.scope),
                Err(_) => false,
            };
            futures::future::ready(match result {
                Ok(event) if allowed => serde_json::to_string(&event)
                    .ok()
                    .map(|data| Ok(Event::default().data(data))),
                _ => None,
            })
        });

    Sse::new(connected.chain(events)).keep_alive(KeepAlive::default())
}

// ============ POST /v1/retrieve ============

async fn handle_retrieve(
    ctx: RequestContext,
    State(state): State<AppState>,
    Json(req): Json<RetrieveRequest>,
) -> Result<Json<retrieve::RetrieveResponse>, ServiceError> {
    let deps = RetrievalDeps {
        embedder: state.embedder.as_ref(),
        vector: state.vector.as_ref(),
        graph: state.graph.as_ref(),
        reranker: state.reranker.as_deref(),
    };
    let response = retrieve::retrieve(&deps, &ctx.visibility(), &req).await?;
    Ok(Json(response))
}

// ============ GET /v1/graph/* ============

#[derive(Deserialize)]
struct EntityListQuery {
    q: Option<String>,
    entity_type: Option<String>,
    limit: Option<i64>,
}

async fn handle_top_entities(
    ctx: RequestContext,
    State(state): State<AppState>,
    Query(query): Query<EntityListQuery>,
) -> Result<Json<Value>, ServiceError> {
    let limit = parse_limit(query.limit, 50, 500)?;
    let entities = state
        .graph
        .top_entities(
            &ctx.visibility(),
            query.q.as_deref(),
            query.entity_type.as_deref(),
            limit as usize,
        )
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "graph entity listing failed");
            Vec::new()
        });
    Ok(Json(json!({ "count": entities.len(), "entities": entities })))
}

#[derive(Deserialize)]
struct ChunkListQuery {
    limit: Option<i64>,
}

async fn handle_entity_chunks(
    ctx: RequestContext,
    State(state): State<AppState>,
    AxumPath(entity_id): AxumPath<String>,
    Query(query): Query<ChunkListQuery>,
) -> Result<Json<Value>, ServiceError> {
    let limit = parse_limit(query.limit, 25, 200)?;
    let chunks = state
        .graph
        .chunks_for_entity(&entity_id, &ctx.visibility(), limit as usize)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "graph chunk listing failed");
            Vec::new()
        });
    Ok(Json(json!({
        "entity_id": entity_id,
        "count": chunks.len(),
        "chunks": chunks,
    })))
}

async fn handle_document_entities(
    ctx: RequestContext,
    State(state): State<AppState>,
    AxumPath(doc_id): AxumPath<Uuid>,
    Query(query): Query<ChunkListQuery>,
) -> Result<Json<Value>, ServiceError> {
    let limit = parse_limit(query.limit, 50, 500)?;
    let entities = state
        .graph
        .entities_for_document(doc_id, &ctx.visibility(), limit as usize)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "graph document entities failed");
            Vec::new()
        });
    Ok(Json(json!({
        "doc_id": doc_id,
        "count": entities.len(),
        "entities": entities,
    })))
}

// ============ GET /health ============

async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    let started = Instant::now();
    let mut checks = serde_json::Map::new();

    let probe = |result: Result<(), ServiceError>| match result {
        Ok(()) => json!({ "ok": true }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    };

    checks.insert("postgres".into(), probe(state.meta.ping().await));
    checks.insert("redis".into(), probe(state.broker.ping().await));
    checks.insert("weaviate".into(), probe(state.vector.ping().await));
    checks.insert("neo4j".into(), probe(state.graph.ping().await));

    let embeddings = match state.embedder.embed(&["test".to_string()]).await {
        Ok(vectors) => json!({
            "ok": true,
            "dim": vectors.first().map(|v| v.len()).unwrap_or(0),
            "model": state.config.embeddings_model,
        }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    };
    checks.insert("embeddings".into(), embeddings);

    let ok = checks
        .values()
        .all(|check| check["ok"].as_bool().unwrap_or(false));

    Json(json!({
        "ok": ok,
        "checks": checks,
        "latency_ms": started.elapsed().as_millis() as u64,
    }))
}

// ============ Admin surface ============

fn require_admin(state: &AppState, parts_key: Option<String>) -> Result<(), ServiceError> {
    let configured = state
        .config
        .admin_api_key
        .as_deref()
        .ok_or_else(|| ServiceError::Auth("admin surface disabled".into()))?;
    match parts_key.as_deref() {
        Some(provided) if provided == configured => Ok(()),
        _ => Err(ServiceError::Auth("invalid admin key".into())),
    }
}

/// Admin credential extractor: `X-Admin-Key` header.
struct AdminKey(Option<String>);

#[async_trait]
impl FromRequestParts<AppState> for AdminKey {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(AdminKey(header_value(parts, "x-admin-key")))
    }
}

async fn handle_workers_start(
    AdminKey(key): AdminKey,
    State(state): State<AppState>,
) -> Result<Json<Value>, ServiceError> {
    require_admin(&state, key)?;
    state.broker.set_paused(false).await?;
    Ok(Json(json!({ "running": true })))
}

async fn handle_workers_stop(
    AdminKey(key): AdminKey,
    State(state): State<AppState>,
) -> Result<Json<Value>, ServiceError> {
    require_admin(&state, key)?;
    state.broker.set_paused(true).await?;
    Ok(Json(json!({ "running": false })))
}

#[derive(Deserialize)]
struct ConcurrencyRequest {
    concurrency: u32,
}

async fn handle_set_concurrency(
    AdminKey(key): AdminKey,
    State(state): State<AppState>,
    Json(req): Json<ConcurrencyRequest>,
) -> Result<Json<Value>, ServiceError> {
    require_admin(&state, key)?;
    if !(1..=32).contains(&req.concurrency) {
        return Err(ServiceError::Validation(
            "concurrency must be in [1, 32]".into(),
        ));
    }
    state.broker.set_concurrency(req.concurrency).await?;
    Ok(Json(json!({ "concurrency": req.concurrency })))
}

#[derive(Deserialize)]
struct ResetTenantRequest {
    tenant_id: String,
    confirm: String,
}

async fn handle_reset_tenant(
    AdminKey(key): AdminKey,
    State(state): State<AppState>,
    Json(req): Json<ResetTenantRequest>,
) -> Result<Json<Value>, ServiceError> {
    require_admin(&state, key)?;
    if req.confirm != "RESET" {
        return Err(ServiceError::Validation(
            "confirmation must be the string RESET".into(),
        ));
    }
    let documents = state.meta.delete_tenant(&req.tenant_id).await?;
    state.vector.delete_tenant(&req.tenant_id).await?;
    state.graph.delete_tenant(&req.tenant_id).await?;
    Ok(Json(json!({
        "tenant_id": req.tenant_id,
        "documents_deleted": documents,
    })))
}

#[derive(Deserialize)]
struct ResetAllRequest {
    confirm: String,
}

async fn handle_reset_all(
    AdminKey(key): AdminKey,
    State(state): State<AppState>,
    Json(req): Json<ResetAllRequest>,
) -> Result<Json<Value>, ServiceError> {
    require_admin(&state, key)?;
    if req.confirm != "RESET ALL" {
        return Err(ServiceError::Validation(
            "confirmation must be the string RESET ALL".into(),
        ));
    }
    let documents = state.meta.delete_all().await?;
    state.vector.delete_all().await?;
    state.graph.delete_all().await?;
    state.broker.purge_queue().await?;
    Ok(Json(json!({ "documents_deleted": documents })))
}

async fn handle_admin_status(
    AdminKey(key): AdminKey,
    State(state): State<AppState>,
) -> Result<Html<String>, ServiceError> {
    require_admin(&state, key)?;
    let control = state.broker.control().await.unwrap_or_default();
    let html = format!(
        "<!doctype html>\n<html><head><title>ragd status</title></head><body>\
         <h1>ragd</h1>\
         <p>version: {}</p>\
         <p>workers paused: {}</p>\
         <p>concurrency override: {}</p>\
         <p>generated: {}</p>\
         </body></html>",
        env!("CARGO_PKG_VERSION"),
        control.paused,
        control
            .concurrency
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".into()),
        Utc::now().to_rfc3339(),
    );
    Ok(Html(html))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_drops_traversal() {
        assert_eq!(
            sanitize_display_filename("../../etc/passwd", "doc"),
            "etc/passwd"
        );
        assert_eq!(
            sanitize_display_filename("..\\..\\secret.pdf", "doc"),
            "secret.pdf"
        );
        assert_eq!(sanitize_display_filename("/abs/path.md", "doc"), "abs/path.md");
    }

    #[test]
    fn sanitize_keeps_friendly_names() {
        assert_eq!(
            sanitize_display_filename("reports/q3 summary.pdf", "doc"),
            "reports/q3 summary.pdf"
        );
    }

    #[test]
    fn sanitize_falls_back_when_empty() {
        assert_eq!(sanitize_display_filename("", "doc-123"), "doc-123");
        assert_eq!(sanitize_display_filename("../..", "doc-123"), "doc-123");
        assert_eq!(sanitize_display_filename("\0\0", "doc-123"), "doc-123");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "a".repeat(2000);
        assert_eq!(sanitize_display_filename(&long, "doc").chars().count(), 512);
    }

    #[test]
    fn limits_validate() {
        assert_eq!(parse_limit(None, 100, 500).unwrap(), 100);
        assert_eq!(parse_limit(Some(1), 100, 500).unwrap(), 1);
        assert_eq!(parse_limit(Some(500), 100, 500).unwrap(), 500);
        assert!(parse_limit(Some(0), 100, 500).is_err());
        assert!(parse_limit(Some(501), 100, 500).is_err());
    }
}
