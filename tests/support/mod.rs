//! In-memory fakes for the external collaborators, shared by the
//! integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use ragd::error::ServiceError;
use ragd::graph::{EntitySummary, GraphExpansion, GraphStore};
use ragd::llm::{ChatModel, Embedder};
use ragd::meta::{DocumentFilter, DocumentPatch, MetaStore, SortField, SortOrder, StatusCounts};
use ragd::models::{Chunk, Document, DocumentStatus, Entity, Job, ProgressEvent};
use ragd::queue::{Broker, WorkerControl};
use ragd::rerank::Reranker;
use ragd::scope::Visibility;
use ragd::vector::{ScoredChunk, VectorStore};

// ============ MetaStore ============

#[derive(Default)]
pub struct MemoryMeta {
    pub docs: Mutex<HashMap<Uuid, Document>>,
}

impl MemoryMeta {
    pub fn insert(&self, doc: Document) {
        self.docs.lock().unwrap().insert(doc.doc_id, doc);
    }

    pub fn get(&self, doc_id: Uuid) -> Option<Document> {
        self.docs.lock().unwrap().get(&doc_id).cloned()
    }
}

#[async_trait]
impl MetaStore for MemoryMeta {
    async fn ensure_schema(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn insert_document(&self, doc: &Document) -> Result<(), ServiceError> {
        self.insert(doc.clone());
        Ok(())
    }

    async fn get_document(
        &self,
        doc_id: Uuid,
        vis: &Visibility,
    ) -> Result<Option<Document>, ServiceError> {
        Ok(self
            .get(doc_id)
            .filter(|doc| vis.allows(&doc.scope)))
    }

    async fn get_document_any(&self, doc_id: Uuid) -> Result<Option<Document>, ServiceError> {
        Ok(self.get(doc_id))
    }

    async fn list_documents(
        &self,
        vis: &Visibility,
        filter: &DocumentFilter,
    ) -> Result<Vec<Document>, ServiceError> {
        let mut docs: Vec<Document> = self
            .docs
            .lock()
            .unwrap()
            .values()
            .filter(|doc| vis.allows(&doc.scope))
            .filter(|doc| filter.statuses.is_empty() || filter.statuses.contains(&doc.status))
            .cloned()
            .collect();

        docs.sort_by(|a, b| {
            let ordering = match filter.sort {
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
                SortField::Filename => a.filename.cmp(&b.filename),
                SortField::Status => a.status.as_str().cmp(b.status.as_str()),
                SortField::Stage => a.stage.as_str().cmp(b.stage.as_str()),
                SortField::Progress => a.progress.cmp(&b.progress),
                SortField::ChunkCount => a.chunk_count.cmp(&b.chunk_count),
                SortField::EntityCount => a.entity_count.cmp(&b.entity_count),
            };
            let ordering = match filter.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            };
            ordering.then(a.doc_id.cmp(&b.doc_id))
        });

        Ok(docs
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn counts_by_status(&self, vis: &Visibility) -> Result<StatusCounts, ServiceError> {
        let mut counts = StatusCounts::default();
        for doc in self.docs.lock().unwrap().values() {
            if !vis.allows(&doc.scope) {
                continue;
            }
            counts.total += 1;
            match doc.status {
                DocumentStatus::Queued => counts.queued += 1,
                DocumentStatus::Processing => counts.processing += 1,
                DocumentStatus::Indexed => counts.indexed += 1,
                DocumentStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn update_document(
        &self,
        doc_id: Uuid,
        patch: &DocumentPatch,
    ) -> Result<(), ServiceError> {
        let mut docs = self.docs.lock().unwrap();
        let Some(doc) = docs.get_mut(&doc_id) else {
            return Ok(());
        };
        if let Some(status) = patch.status {
            doc.status = status;
        }
        if let Some(stage) = patch.stage {
            doc.stage = stage;
        }
        if let Some(progress) = patch.progress {
            doc.progress = progress;
        }
        if let Some(message) = &patch.error_message {
            doc.error_message = Some(message.clone());
        }
        if let Some(chunk_count) = patch.chunk_count {
            doc.chunk_count = chunk_count;
        }
        if let Some(entity_count) = patch.entity_count {
            doc.entity_count = entity_count;
        }
        doc.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<u64, ServiceError> {
        let mut docs = self.docs.lock().unwrap();
        let before = docs.len();
        docs.retain(|_, doc| doc.scope.tenant_id != tenant_id);
        Ok((before - docs.len()) as u64)
    }

    async fn delete_all(&self) -> Result<u64, ServiceError> {
        let mut docs = self.docs.lock().unwrap();
        let n = docs.len() as u64;
        docs.clear();
        Ok(n)
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

// ============ Broker ============

pub struct MemoryBroker {
    pub queue: Mutex<VecDeque<Job>>,
    pub snapshots: Mutex<HashMap<Uuid, ProgressEvent>>,
    pub published: Mutex<Vec<ProgressEvent>>,
    pub control: Mutex<WorkerControl>,
    tx: broadcast::Sender<ProgressEvent>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(1024);
        MemoryBroker {
            queue: Mutex::new(VecDeque::new()),
            snapshots: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            control: Mutex::new(WorkerControl::default()),
            tx,
        }
    }
}

impl MemoryBroker {
    /// Progress events published so far for one document, in order.
    pub fn events_for(&self, doc_id: Uuid) -> Vec<ProgressEvent> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|ev| ev.doc_id == doc_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, job: &Job) -> Result<(), ServiceError> {
        self.queue.lock().unwrap().push_back(*job);
        Ok(())
    }

    async fn blocking_pop(&self, timeout: Duration) -> Result<Option<Job>, ServiceError> {
        if let Some(job) = self.queue.lock().unwrap().pop_front() {
            return Ok(Some(job));
        }
        tokio::time::sleep(timeout.min(Duration::from_millis(10))).await;
        Ok(self.queue.lock().unwrap().pop_front())
    }

    async fn set_progress(&self, event: &ProgressEvent) -> Result<(), ServiceError> {
        self.snapshots
            .lock()
            .unwrap()
            .insert(event.doc_id, event.clone());
        Ok(())
    }

    async fn get_progress(&self, doc_id: Uuid) -> Result<Option<ProgressEvent>, ServiceError> {
        Ok(self.snapshots.lock().unwrap().get(&doc_id).cloned())
    }

    async fn publish(&self, event: &ProgressEvent) -> Result<(), ServiceError> {
        self.published.lock().unwrap().push(event.clone());
        let _ = self.tx.send(event.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, ProgressEvent>, ServiceError> {
        let rx = self.tx.subscribe();
        Ok(tokio_stream::wrappers::BroadcastStream::new(rx)
            .filter_map(|item| async move { item.ok() })
            .boxed())
    }

    async fn control(&self) -> Result<WorkerControl, ServiceError> {
        Ok(*self.control.lock().unwrap())
    }

    async fn set_paused(&self, paused: bool) -> Result<(), ServiceError> {
        self.control.lock().unwrap().paused = paused;
        Ok(())
    }

    async fn set_concurrency(&self, concurrency: u32) -> Result<(), ServiceError> {
        self.control.lock().unwrap().concurrency = Some(concurrency);
        Ok(())
    }

    async fn purge_queue(&self) -> Result<(), ServiceError> {
        self.queue.lock().unwrap().clear();
        Ok(())
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

// ============ VectorStore ============

/// Stores chunks in memory and scores hybrid queries with naive term
/// overlap (sparse) and cosine similarity (dense).
#[derive(Default)]
pub struct MemoryVector {
    pub rows: Mutex<Vec<(Chunk, Vec<f32>)>>,
    pub ensure_calls: AtomicUsize,
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na * nb < f32::EPSILON {
        return 0.0;
    }
    (dot / (na * nb)) as f64
}

fn term_overlap(query: &str, text: &str) -> f64 {
    let text_lower = text.to_lowercase();
    let terms: Vec<&str> = query.split_whitespace().collect();
    if terms.is_empty() {
        return 0.0;
    }
    let hits = terms
        .iter()
        .filter(|t| text_lower.contains(&t.to_lowercase()))
        .count();
    hits as f64 / terms.len() as f64
}

#[async_trait]
impl VectorStore for MemoryVector {
    async fn ensure_collection(&self) -> Result<(), ServiceError> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn insert(&self, chunk: &Chunk, vector: &[f32]) -> Result<(), ServiceError> {
        self.rows
            .lock()
            .unwrap()
            .push((chunk.clone(), vector.to_vec()));
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
        let mut scored: Vec<ScoredChunk> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(chunk, _)| vis.allows(&chunk.scope))
            .map(|(chunk, stored)| {
                let sparse = term_overlap(query, &chunk.text);
                let dense = vector.map(|v| cosine(v, stored)).unwrap_or(0.0);
                ScoredChunk {
                    weaviate_uuid: chunk.chunk_id.to_string(),
                    score: Some((1.0 - alpha) * sparse + alpha * dense),
                    chunk: chunk.clone(),
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        scored.truncate(limit);
        Ok(scored)
    }

    async fn delete_by_doc(&self, doc_id: Uuid) -> Result<(), ServiceError> {
        self.rows.lock().unwrap().retain(|(c, _)| c.doc_id != doc_id);
        Ok(())
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), ServiceError> {
        self.rows
            .lock()
            .unwrap()
            .retain(|(c, _)| c.scope.tenant_id != tenant_id);
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), ServiceError> {
        self.rows.lock().unwrap().clear();
        Ok(())
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

// ============ GraphStore ============

#[derive(Default)]
pub struct FakeGraph {
    pub disabled: bool,
    /// Returned by `expand_by_shared_entities`.
    pub expansions: Mutex<Vec<GraphExpansion>>,
    /// Chunk/entity pairs linked during ingestion.
    pub linked: Mutex<Vec<(Chunk, Vec<Entity>)>>,
    /// When set, every call errors (simulates an unreachable store).
    pub unreachable: bool,
}

#[async_trait]
impl GraphStore for FakeGraph {
    fn enabled(&self) -> bool {
        !self.disabled
    }

    async fn ensure_constraints(&self) -> Result<(), ServiceError> {
        if self.unreachable {
            return Err(ServiceError::transient("neo4j", "connection refused"));
        }
        Ok(())
    }

    async fn link_chunk_entities(
        &self,
        chunk: &Chunk,
        entities: &[Entity],
    ) -> Result<(), ServiceError> {
        if self.unreachable {
            return Err(ServiceError::transient("neo4j", "connection refused"));
        }
        self.linked
            .lock()
            .unwrap()
            .push((chunk.clone(), entities.to_vec()));
        Ok(())
    }

    async fn expand_by_shared_entities(
        &self,
        seed_chunk_ids: &[Uuid],
        vis: &Visibility,
        limit: usize,
        _entity_limit: usize,
    ) -> Result<Vec<GraphExpansion>, ServiceError> {
        if self.unreachable {
            return Err(ServiceError::transient("neo4j", "connection refused"));
        }
        Ok(self
            .expansions
            .lock()
            .unwrap()
            .iter()
            .filter(|exp| vis.allows(&exp.chunk.scope))
            .filter(|exp| !seed_chunk_ids.contains(&exp.chunk.chunk_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn top_entities(
        &self,
        _vis: &Visibility,
        _name_query: Option<&str>,
        _entity_type: Option<&str>,
        _limit: usize,
    ) -> Result<Vec<EntitySummary>, ServiceError> {
        if self.unreachable {
            return Err(ServiceError::transient("neo4j", "connection refused"));
        }
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
        if self.unreachable {
            return Err(ServiceError::transient("neo4j", "connection refused"));
        }
        Ok(())
    }
}

// ============ Chat model ============

type ChatFn = dyn Fn(&str, &str) -> Result<Value, ServiceError> + Send + Sync;

/// Dispatches on the prompts, so one fake serves both the chunker and the
/// entity extractor. Tracks peak concurrency for the worker tests.
pub struct FakeChat {
    handler: Box<ChatFn>,
    pub delay: Duration,
    current: AtomicUsize,
    pub peak: AtomicUsize,
}

impl FakeChat {
    pub fn new(
        handler: impl Fn(&str, &str) -> Result<Value, ServiceError> + Send + Sync + 'static,
    ) -> Self {
        FakeChat {
            handler: Box::new(handler),
            delay: Duration::ZERO,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ChatModel for FakeChat {
    async fn complete_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        _max_tokens: u32,
    ) -> Result<Value, ServiceError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = (self.handler)(system_prompt, user_prompt);
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// A chat handler that chunks everything after the window marker into one
/// chunk and returns a fixed entity list.
pub fn simple_chat_handler(entities: Value) -> impl Fn(&str, &str) -> Result<Value, ServiceError> {
    move |system: &str, user: &str| {
        if system.contains("named entities") {
            return Ok(entities.clone());
        }
        let new_text = user
            .rsplit("=== NEW WINDOW START ===")
            .next()
            .unwrap_or("")
            .trim();
        Ok(serde_json::json!([{
            "section": "body",
            "title": "Whole window",
            "text": new_text,
            "summary": "Everything in the window.",
            "why_this_chunk": "Single-window document."
        }]))
    }
}

// ============ Embedder ============

/// Deterministic 4-dim embedding derived from character statistics.
#[derive(Default)]
pub struct FakeEmbedder {
    pub calls: AtomicUsize,
    /// Drops one vector per batch to exercise the N-in/N-out contract.
    pub short_by_one: bool,
}

pub fn fake_vector(text: &str) -> Vec<f32> {
    let len = text.len() as f32;
    let vowels = text.chars().filter(|c| "aeiou".contains(*c)).count() as f32;
    let digits = text.chars().filter(|c| c.is_ascii_digit()).count() as f32;
    let words = text.split_whitespace().count() as f32;
    vec![len.ln_1p(), vowels + 1.0, digits + 1.0, words + 1.0]
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut vectors: Vec<Vec<f32>> = texts.iter().map(|t| fake_vector(t)).collect();
        if self.short_by_one {
            vectors.pop();
        }
        Ok(vectors)
    }
}

/// An embedder that always fails, for failure-path tests.
pub struct BrokenEmbedder;

#[async_trait]
impl Embedder for BrokenEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        Err(ServiceError::fatal("embeddings", "boom"))
    }
}

// ============ Reranker ============

/// Scores by term overlap with the query; deterministic and monotone in
/// relevance for the test corpora.
pub struct FakeReranker {
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl Default for FakeReranker {
    fn default() -> Self {
        FakeReranker {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Reranker for FakeReranker {
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ServiceError::transient("reranker", "model load failed"));
        }
        Ok(texts
            .iter()
            .map(|t| term_overlap(query, t) as f32)
            .collect())
    }
}
