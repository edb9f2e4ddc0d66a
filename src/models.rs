//! Core data types that flow through ingestion and retrieval.
//!
//! The data lifecycle is:
//!
//! ```text
//! upload → Document(queued) → Job → worker state machine
//!                                      │ chunking → Chunk
//!                                      │ entities → Entity / MENTIONS
//!                                      └ ProgressEvent per stage
//! ```
//!
//! - A **[`Document`]** is the canonical metadata row, created by the API
//!   on upload and mutated only by the worker.
//! - A **[`Chunk`]** is an LLM-proposed span of the document text, written
//!   once to the vector and graph stores, never updated.
//! - An **[`Entity`]** is a normalized `(name, type)` pair; its id is a
//!   stable hash so repeated extraction merges into the same graph node.
//! - A **[`ProgressEvent`]** is the wire shape published to the broadcast
//!   channel and cached per document while ingestion runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::scope::ScopeKey;

/// Coarse document status persisted in the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Queued,
    Processing,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Queued => "queued",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<DocumentStatus> {
        match s {
            "queued" => Some(DocumentStatus::Queued),
            "processing" => Some(DocumentStatus::Processing),
            "indexed" => Some(DocumentStatus::Indexed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Indexed | DocumentStatus::Failed)
    }

    pub const ALL: [DocumentStatus; 4] = [
        DocumentStatus::Queued,
        DocumentStatus::Processing,
        DocumentStatus::Indexed,
        DocumentStatus::Failed,
    ];
}

/// Fine-grained ingestion stage, published in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Queued,
    Processing,
    Reading,
    Chunking,
    Embedding,
    Entities,
    Neo4j,
    Indexed,
    Failed,
}

impl Stage {
    /// The progress value reached when this stage begins. `Failed` has no
    /// value of its own; a failed document keeps the last progress reached.
    pub fn percent(&self) -> Option<u8> {
        match self {
            Stage::Queued => Some(0),
            Stage::Processing => Some(5),
            Stage::Reading => Some(10),
            Stage::Chunking => Some(35),
            Stage::Embedding => Some(55),
            Stage::Entities => Some(85),
            Stage::Neo4j => Some(95),
            Stage::Indexed => Some(100),
            Stage::Failed => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Processing => "processing",
            Stage::Reading => "reading",
            Stage::Chunking => "chunking",
            Stage::Embedding => "embedding",
            Stage::Entities => "entities",
            Stage::Neo4j => "neo4j",
            Stage::Indexed => "indexed",
            Stage::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "queued" => Some(Stage::Queued),
            "processing" => Some(Stage::Processing),
            "reading" => Some(Stage::Reading),
            "chunking" => Some(Stage::Chunking),
            "embedding" => Some(Stage::Embedding),
            "entities" => Some(Stage::Entities),
            "neo4j" => Some(Stage::Neo4j),
            "indexed" => Some(Stage::Indexed),
            "failed" => Some(Stage::Failed),
            _ => None,
        }
    }
}

/// Canonical document metadata row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: Uuid,
    #[serde(flatten)]
    pub scope: ScopeKey,
    /// Display filename (sanitized, may keep subdirectory components).
    pub filename: String,
    pub content_type: String,
    #[serde(skip_serializing)]
    pub storage_path: String,
    pub status: DocumentStatus,
    pub stage: Stage,
    pub progress: i32,
    pub error_message: Option<String>,
    pub chunk_count: i32,
    pub entity_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A freshly uploaded document, not yet picked up by a worker.
    pub fn queued(
        doc_id: Uuid,
        scope: ScopeKey,
        filename: String,
        content_type: String,
        storage_path: String,
    ) -> Self {
        let now = Utc::now();
        Document {
            doc_id,
            scope,
            filename,
            content_type,
            storage_path,
            status: DocumentStatus::Queued,
            stage: Stage::Queued,
            progress: 0,
            error_message: None,
            chunk_count: 0,
            entity_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An immutable span of document text proposed by the LLM chunker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: Uuid,
    pub doc_id: Uuid,
    #[serde(flatten)]
    pub scope: ScopeKey,
    pub start_char: usize,
    pub end_char: usize,
    pub pages: Vec<u32>,
    pub title: String,
    pub section: String,
    pub summary: String,
    pub why_this_chunk: String,
    pub text: String,
}

/// A normalized named entity extracted from a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
}

impl Entity {
    /// Stable id: the same name (modulo case and whitespace) and type always
    /// hash to the same graph node.
    pub fn entity_id(&self) -> String {
        let normalized = normalize_entity_name(&self.name).to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.entity_type.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Collapses internal whitespace runs and trims the ends.
pub fn normalize_entity_name(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Snapshot of a document's ingestion state. Published on the broadcast
/// channel and cached under `progress:<doc_id>` with a one-hour TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub doc_id: Uuid,
    #[serde(flatten)]
    pub scope: ScopeKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub stage: Stage,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// The event emitted when `doc` enters `stage`. For `Failed` the
    /// document's last progress value is kept, per the monotonicity rule.
    pub fn for_stage(doc: &Document, stage: Stage, message: impl Into<String>) -> Self {
        ProgressEvent {
            doc_id: doc.doc_id,
            scope: doc.scope.clone(),
            filename: Some(doc.filename.clone()),
            stage,
            progress: stage.percent().unwrap_or(doc.progress.clamp(0, 100) as u8),
            message: Some(message.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Queue payload. Everything else is looked up from the metadata store so a
/// re-delivered job always sees current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub doc_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeKey;

    #[test]
    fn stage_percentages_are_monotonic() {
        let stages = [
            Stage::Queued,
            Stage::Processing,
            Stage::Reading,
            Stage::Chunking,
            Stage::Embedding,
            Stage::Entities,
            Stage::Neo4j,
            Stage::Indexed,
        ];
        let percents: Vec<u8> = stages.iter().map(|s| s.percent().unwrap()).collect();
        assert_eq!(percents, vec![0, 5, 10, 35, 55, 85, 95, 100]);
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn failed_event_keeps_last_progress() {
        let mut doc = Document::queued(
            Uuid::new_v4(),
            ScopeKey::tenant("acme"),
            "a.md".into(),
            "text/markdown".into(),
            "/tmp/a.md".into(),
        );
        doc.progress = 55;
        let ev = ProgressEvent::for_stage(&doc, Stage::Failed, "chunker returned nothing");
        assert_eq!(ev.progress, 55);
        assert_eq!(ev.stage, Stage::Failed);
    }

    #[test]
    fn entity_id_is_stable_under_case_and_whitespace() {
        let a = Entity {
            name: "Acme   Corp".into(),
            entity_type: "company".into(),
        };
        let b = Entity {
            name: "acme corp".into(),
            entity_type: "company".into(),
        };
        assert_eq!(a.entity_id(), b.entity_id());

        let c = Entity {
            name: "acme corp".into(),
            entity_type: "product".into(),
        };
        assert_ne!(a.entity_id(), c.entity_id());
    }

    #[test]
    fn progress_event_serializes_flat_scope() {
        let doc = Document::queued(
            Uuid::new_v4(),
            ScopeKey::workspace("acme", "ws-1"),
            "a.md".into(),
            "text/markdown".into(),
            "/tmp/a.md".into(),
        );
        let ev = ProgressEvent::for_stage(&doc, Stage::Queued, "Queued for ingestion");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["tenant_id"], "acme");
        assert_eq!(json["scope"], "workspace");
        assert_eq!(json["workspace_id"], "ws-1");
        assert_eq!(json["stage"], "queued");
        assert_eq!(json["progress"], 0);
    }

    #[test]
    fn status_parse_roundtrip() {
        for s in DocumentStatus::ALL {
            assert_eq!(DocumentStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(DocumentStatus::parse("done"), None);
    }
}
