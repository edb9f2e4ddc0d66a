//! Document metadata store.
//!
//! [`MetaStore`] is the canonical record of every document's lifecycle. The
//! production implementation is Postgres via `sqlx`; tests substitute an
//! in-memory implementation. All reads that serve user requests take a
//! [`Visibility`] and filter rows to the caller's scope set.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::{Document, DocumentStatus, Stage};
use crate::scope::{Scope, ScopeKey, Visibility};

/// Partial update applied atomically to one document row.
#[derive(Debug, Default, Clone)]
pub struct DocumentPatch {
    pub status: Option<DocumentStatus>,
    pub stage: Option<Stage>,
    pub progress: Option<i32>,
    pub error_message: Option<String>,
    pub chunk_count: Option<i32>,
    pub entity_count: Option<i32>,
}

/// Whitelisted sort columns for document listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    UpdatedAt,
    Filename,
    Status,
    Stage,
    Progress,
    ChunkCount,
    EntityCount,
}

impl SortField {
    pub fn parse(s: &str) -> Option<SortField> {
        match s {
            "created_at" => Some(SortField::CreatedAt),
            "updated_at" => Some(SortField::UpdatedAt),
            "filename" => Some(SortField::Filename),
            "status" => Some(SortField::Status),
            "stage" => Some(SortField::Stage),
            "progress" => Some(SortField::Progress),
            "chunk_count" => Some(SortField::ChunkCount),
            "entity_count" => Some(SortField::EntityCount),
            _ => None,
        }
    }

    fn as_sql(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::Filename => "filename",
            SortField::Status => "status",
            SortField::Stage => "stage",
            SortField::Progress => "progress",
            SortField::ChunkCount => "chunk_count",
            SortField::EntityCount => "entity_count",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<SortOrder> {
        match s {
            "asc" => Some(SortOrder::Asc),
            "desc" => Some(SortOrder::Desc),
            _ => None,
        }
    }

    fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Listing parameters, validated at the HTTP boundary.
#[derive(Debug, Clone)]
pub struct DocumentFilter {
    /// Empty means all statuses.
    pub statuses: Vec<DocumentStatus>,
    pub limit: i64,
    pub offset: i64,
    pub sort: SortField,
    pub order: SortOrder,
}

impl Default for DocumentFilter {
    fn default() -> Self {
        DocumentFilter {
            statuses: Vec::new(),
            limit: 100,
            offset: 0,
            sort: SortField::CreatedAt,
            order: SortOrder::Desc,
        }
    }
}

/// Per-status document counts within a visibility set.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub total: i64,
    pub queued: i64,
    pub processing: i64,
    pub indexed: i64,
    pub failed: i64,
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<(), ServiceError>;

    async fn insert_document(&self, doc: &Document) -> Result<(), ServiceError>;

    /// Scope-filtered read used by the API.
    async fn get_document(
        &self,
        doc_id: Uuid,
        vis: &Visibility,
    ) -> Result<Option<Document>, ServiceError>;

    /// Unfiltered read used by the worker, which owns the row.
    async fn get_document_any(&self, doc_id: Uuid) -> Result<Option<Document>, ServiceError>;

    async fn list_documents(
        &self,
        vis: &Visibility,
        filter: &DocumentFilter,
    ) -> Result<Vec<Document>, ServiceError>;

    async fn counts_by_status(&self, vis: &Visibility) -> Result<StatusCounts, ServiceError>;

    async fn update_document(
        &self,
        doc_id: Uuid,
        patch: &DocumentPatch,
    ) -> Result<(), ServiceError>;

    async fn delete_tenant(&self, tenant_id: &str) -> Result<u64, ServiceError>;

    async fn delete_all(&self) -> Result<u64, ServiceError>;

    /// Liveness probe for `/health`.
    async fn ping(&self) -> Result<(), ServiceError>;
}

// ============ Postgres implementation ============

pub struct PgMetaStore {
    pool: PgPool,
}

const DOCUMENT_COLUMNS: &str = "doc_id, tenant_id, scope, workspace_id, principal_id, filename, \
     content_type, storage_path, status, stage, progress, error_message, chunk_count, \
     entity_count, created_at, updated_at";

impl PgMetaStore {
    pub async fn connect(database_url: &str) -> Result<Self, ServiceError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(|e| ServiceError::transient("postgres", e.to_string()))?;
        Ok(PgMetaStore { pool })
    }
}

fn db_err(e: sqlx::Error) -> ServiceError {
    match &e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            ServiceError::transient("postgres", e.to_string())
        }
        _ => ServiceError::fatal("postgres", e.to_string()),
    }
}

/// Renders the caller's visibility set as a SQL predicate. Kept in sync
/// with the Weaviate and Cypher scope filters.
fn push_visibility(qb: &mut QueryBuilder<'_, Postgres>, vis: &Visibility) {
    qb.push("(tenant_id = ")
        .push_bind(vis.tenant_id.clone())
        .push(" AND (scope = 'tenant'");

    if let Some(ws) = &vis.workspace_id {
        qb.push(" OR (scope = 'workspace' AND workspace_id = ")
            .push_bind(ws.clone())
            .push(")");
        if let Some(p) = &vis.principal_id {
            qb.push(" OR (scope = 'user' AND workspace_id = ")
                .push_bind(ws.clone())
                .push(" AND principal_id = ")
                .push_bind(p.clone())
                .push(")");
        }
    }

    qb.push("))");
}

fn row_to_document(row: &sqlx::postgres::PgRow) -> Result<Document, ServiceError> {
    let scope_str: String = row.try_get("scope").map_err(db_err)?;
    let scope = Scope::parse(&scope_str)
        .ok_or_else(|| ServiceError::Internal(format!("unknown scope in row: {}", scope_str)))?;
    let status_str: String = row.try_get("status").map_err(db_err)?;
    let status = DocumentStatus::parse(&status_str)
        .ok_or_else(|| ServiceError::Internal(format!("unknown status in row: {}", status_str)))?;
    let stage_str: String = row.try_get("stage").map_err(db_err)?;
    let stage = Stage::parse(&stage_str)
        .ok_or_else(|| ServiceError::Internal(format!("unknown stage in row: {}", stage_str)))?;

    Ok(Document {
        doc_id: row.try_get("doc_id").map_err(db_err)?,
        scope: ScopeKey {
            tenant_id: row.try_get("tenant_id").map_err(db_err)?,
            scope,
            workspace_id: row.try_get("workspace_id").map_err(db_err)?,
            principal_id: row.try_get("principal_id").map_err(db_err)?,
        },
        filename: row.try_get("filename").map_err(db_err)?,
        content_type: row.try_get("content_type").map_err(db_err)?,
        storage_path: row.try_get("storage_path").map_err(db_err)?,
        status,
        stage,
        progress: row.try_get("progress").map_err(db_err)?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        chunk_count: row.try_get("chunk_count").map_err(db_err)?,
        entity_count: row.try_get("entity_count").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

#[async_trait]
impl MetaStore for PgMetaStore {
    async fn ensure_schema(&self) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                doc_id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                workspace_id TEXT,
                principal_id TEXT,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                storage_path TEXT NOT NULL,
                status TEXT NOT NULL,
                stage TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                entity_count INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_documents_tenant ON documents (tenant_id)",
            "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents (status)",
            "CREATE INDEX IF NOT EXISTS idx_documents_workspace ON documents (workspace_id)",
        ] {
            sqlx::query(stmt).execute(&self.pool).await.map_err(db_err)?;
        }
        Ok(())
    }

    async fn insert_document(&self, doc: &Document) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO documents
                (doc_id, tenant_id, scope, workspace_id, principal_id, filename, content_type,
                 storage_path, status, stage, progress, error_message, chunk_count, entity_count,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(doc.doc_id)
        .bind(&doc.scope.tenant_id)
        .bind(doc.scope.scope.as_str())
        .bind(&doc.scope.workspace_id)
        .bind(&doc.scope.principal_id)
        .bind(&doc.filename)
        .bind(&doc.content_type)
        .bind(&doc.storage_path)
        .bind(doc.status.as_str())
        .bind(doc.stage.as_str())
        .bind(doc.progress)
        .bind(&doc.error_message)
        .bind(doc.chunk_count)
        .bind(doc.entity_count)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_document(
        &self,
        doc_id: Uuid,
        vis: &Visibility,
    ) -> Result<Option<Document>, ServiceError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM documents WHERE doc_id = ",
            DOCUMENT_COLUMNS
        ));
        qb.push_bind(doc_id).push(" AND ");
        push_visibility(&mut qb, vis);

        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn get_document_any(&self, doc_id: Uuid) -> Result<Option<Document>, ServiceError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE doc_id = $1",
            DOCUMENT_COLUMNS
        ))
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(
        &self,
        vis: &Visibility,
        filter: &DocumentFilter,
    ) -> Result<Vec<Document>, ServiceError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM documents WHERE ",
            DOCUMENT_COLUMNS
        ));
        push_visibility(&mut qb, vis);

        if !filter.statuses.is_empty() {
            qb.push(" AND status IN (");
            let mut sep = qb.separated(", ");
            for status in &filter.statuses {
                sep.push_bind(status.as_str());
            }
            qb.push(")");
        }

        qb.push(format!(
            " ORDER BY {} {}, doc_id ASC LIMIT ",
            filter.sort.as_sql(),
            filter.order.as_sql()
        ));
        qb.push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_document).collect()
    }

    async fn counts_by_status(&self, vis: &Visibility) -> Result<StatusCounts, ServiceError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT status, COUNT(*) AS n FROM documents WHERE ",
        );
        push_visibility(&mut qb, vis);
        qb.push(" GROUP BY status");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(db_err)?;
            let n: i64 = row.try_get("n").map_err(db_err)?;
            match DocumentStatus::parse(&status) {
                Some(DocumentStatus::Queued) => counts.queued = n,
                Some(DocumentStatus::Processing) => counts.processing = n,
                Some(DocumentStatus::Indexed) => counts.indexed = n,
                Some(DocumentStatus::Failed) => counts.failed = n,
                None => continue,
            }
            counts.total += n;
        }
        Ok(counts)
    }

    async fn update_document(
        &self,
        doc_id: Uuid,
        patch: &DocumentPatch,
    ) -> Result<(), ServiceError> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE documents SET updated_at = now()");
        if let Some(status) = patch.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(stage) = patch.stage {
            qb.push(", stage = ").push_bind(stage.as_str());
        }
        if let Some(progress) = patch.progress {
            qb.push(", progress = ").push_bind(progress);
        }
        if let Some(message) = &patch.error_message {
            qb.push(", error_message = ").push_bind(message.clone());
        }
        if let Some(chunk_count) = patch.chunk_count {
            qb.push(", chunk_count = ").push_bind(chunk_count);
        }
        if let Some(entity_count) = patch.entity_count {
            qb.push(", entity_count = ").push_bind(entity_count);
        }
        qb.push(" WHERE doc_id = ").push_bind(doc_id);

        qb.build().execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<u64, ServiceError> {
        let result = sqlx::query("DELETE FROM documents WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_all(&self) -> Result<u64, ServiceError> {
        let result = sqlx::query("DELETE FROM documents")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| ServiceError::transient("postgres", e.to_string()))?;
        Ok(())
    }
}
