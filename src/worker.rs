//! Queue-driven ingestion worker.
//!
//! Each document moves through a strictly sequential state machine:
//!
//! ```text
//! queued → processing(5) → reading(10) → chunking(35) → embedding(55)
//!        → entities(85) → neo4j(95) → indexed(100)
//!                                 \→ failed (from any non-terminal state)
//! ```
//!
//! Every transition publishes a [`ProgressEvent`] (snapshot + broadcast).
//! The persisted row is coarser: it records `processing` when work starts,
//! the chunk count once chunking lands, and the terminal `indexed`/`failed`
//! state with counts and error message.
//!
//! One worker process runs up to `concurrency` documents at a time; the
//! limit (and a paused flag) is re-read from the broker between dequeues so
//! the admin surface can adjust it without touching in-flight work. On
//! shutdown the worker stops dequeuing, gives in-flight documents a drain
//! deadline, and marks whatever is still running as failed.
//!
//! Failure policy: no compensating deletion of vector/graph writes already
//! made; the document is marked failed and its artifacts stay put.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::chunker::{self, ChunkerParams};
use crate::config::Config;
use crate::entities::EntityExtractor;
use crate::error::ServiceError;
use crate::extract;
use crate::graph::{GraphStore, NullGraphStore};
use crate::llm::{backoff_delay, ChatModel, Embedder};
use crate::meta::{DocumentPatch, MetaStore};
use crate::models::{Chunk, Document, DocumentStatus, Entity, ProgressEvent, Stage};
use crate::queue::{publish_progress, Broker};
use crate::vector::VectorStore;

const POP_TIMEOUT: Duration = Duration::from_secs(1);
const PAUSED_SLEEP: Duration = Duration::from_millis(500);
const IDLE_SLEEP: Duration = Duration::from_millis(200);
const REAP_WAIT: Duration = Duration::from_millis(500);
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Everything a worker needs; all handles are cheaply cloneable.
#[derive(Clone)]
pub struct WorkerDeps {
    pub config: Arc<Config>,
    pub meta: Arc<dyn MetaStore>,
    pub broker: Arc<dyn Broker>,
    pub vector: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub embedder: Arc<dyn Embedder>,
    pub chat: Arc<dyn ChatModel>,
}

/// Runs the dequeue loop until `shutdown` flips to true, then drains.
pub async fn run_worker(mut deps: WorkerDeps, shutdown: watch::Receiver<bool>) {
    // Graph bootstrap: an unreachable graph downgrades the worker to
    // graph-disabled mode instead of wedging ingestion.
    if deps.graph.enabled() {
        if let Err(e) = deps.graph.ensure_constraints().await {
            tracing::warn!(error = %e, "graph unavailable, continuing without it");
            deps.graph = Arc::new(NullGraphStore);
        }
    }

    let pool_size = deps.config.worker_pool_size as u32;
    tracing::info!(
        queue = %deps.config.redis_queue,
        pool_size,
        "worker started"
    );

    let mut tasks: JoinSet<()> = JoinSet::new();
    let in_flight: Arc<Mutex<HashSet<Uuid>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut broker_failures: u32 = 0;

    while !*shutdown.borrow() {
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                tracing::error!(error = %e, "ingestion task panicked");
            }
        }

        let control = match deps.broker.control().await {
            Ok(control) => {
                broker_failures = 0;
                control
            }
            Err(e) => {
                broker_failures = (broker_failures + 1).min(6);
                tracing::warn!(error = %e, "broker unavailable, backing off");
                tokio::time::sleep(backoff_delay(broker_failures)).await;
                continue;
            }
        };

        if control.paused {
            tokio::time::sleep(PAUSED_SLEEP).await;
            continue;
        }

        let desired = control
            .concurrency
            .unwrap_or(deps.config.worker_concurrency as u32)
            .clamp(1, pool_size) as usize;

        // Fill free slots. A pop timeout just re-enters the outer loop so
        // shutdown and control changes are observed within a second.
        while tasks.len() < desired && !*shutdown.borrow() {
            match deps.broker.blocking_pop(POP_TIMEOUT).await {
                Ok(Some(job)) => {
                    let deps = deps.clone();
                    let in_flight = in_flight.clone();
                    in_flight.lock().expect("in_flight lock").insert(job.doc_id);
                    tasks.spawn(async move {
                        process_document(&deps, job.doc_id).await;
                        in_flight.lock().expect("in_flight lock").remove(&job.doc_id);
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "queue pop failed");
                    tokio::time::sleep(backoff_delay(1)).await;
                    break;
                }
            }
        }

        if tasks.is_empty() {
            tokio::time::sleep(IDLE_SLEEP).await;
        } else {
            // Block briefly so a finishing document frees its slot promptly.
            let _ = tokio::time::timeout(REAP_WAIT, tasks.join_next()).await;
        }
    }

    tracing::info!(in_flight = tasks.len(), "worker draining");
    let deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;
    while !tasks.is_empty() && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }

    if !tasks.is_empty() {
        tasks.abort_all();
        let abandoned: Vec<Uuid> = in_flight.lock().expect("in_flight lock").iter().copied().collect();
        for doc_id in abandoned {
            mark_abandoned(&deps, doc_id).await;
        }
    }
    tracing::info!("worker stopped");
}

/// Drives one document through the state machine, converting any failure
/// into a terminal `failed` row plus progress event.
pub async fn process_document(deps: &WorkerDeps, doc_id: Uuid) {
    let mut doc = match deps.meta.get_document_any(doc_id).await {
        Ok(Some(doc)) => doc,
        Ok(None) => {
            tracing::warn!(%doc_id, "document not found, dropping job");
            return;
        }
        Err(e) => {
            tracing::error!(%doc_id, error = %e, "failed to load document, dropping job");
            return;
        }
    };

    if doc.status.is_terminal() {
        tracing::info!(%doc_id, status = doc.status.as_str(), "document already terminal, dropping job");
        return;
    }

    if let Err(e) = run_stages(deps, &mut doc).await {
        tracing::error!(%doc_id, error = %e, "ingestion failed");
        mark_failed(deps, &mut doc, &e).await;
    }
}

async fn run_stages(deps: &WorkerDeps, doc: &mut Document) -> Result<(), ServiceError> {
    // processing: claim the row.
    doc.status = DocumentStatus::Processing;
    emit(deps, doc, Stage::Processing, "Starting ingestion").await?;
    deps.meta
        .update_document(
            doc.doc_id,
            &DocumentPatch {
                status: Some(DocumentStatus::Processing),
                stage: Some(Stage::Processing),
                progress: Some(doc.progress),
                ..Default::default()
            },
        )
        .await?;

    // reading: extract page text.
    emit(deps, doc, Stage::Reading, "Reading file").await?;
    let path = Path::new(&doc.storage_path);
    if !path.exists() {
        return Err(ServiceError::Validation(format!(
            "missing file: {}",
            doc.storage_path
        )));
    }
    let pages = extract::extract_pages(path, &doc.content_type)?;

    // chunking: LLM-driven; zero chunks fails the document.
    emit(deps, doc, Stage::Chunking, "Chunking").await?;
    let params = ChunkerParams::from_config(&deps.config);
    let chunks =
        chunker::chunk_document(deps.chat.as_ref(), &params, doc.doc_id, &doc.scope, &pages)
            .await?;
    doc.chunk_count = chunks.len() as i32;
    deps.meta
        .update_document(
            doc.doc_id,
            &DocumentPatch {
                chunk_count: Some(doc.chunk_count),
                ..Default::default()
            },
        )
        .await?;

    // embedding: batch vectors, insert tagged with the document's scope.
    emit(deps, doc, Stage::Embedding, "Embedding and indexing").await?;
    deps.vector.ensure_collection().await?;
    for batch in chunks.chunks(deps.config.embed_batch_size) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = deps.embedder.embed(&texts).await?;
        if vectors.len() != batch.len() {
            return Err(ServiceError::fatal(
                "embeddings",
                format!("batch of {} chunks produced {} vectors", batch.len(), vectors.len()),
            ));
        }
        for (chunk, vector) in batch.iter().zip(vectors.iter()) {
            deps.vector.insert(chunk, vector).await?;
        }
    }

    // entities: best-effort per chunk.
    emit(deps, doc, Stage::Entities, "Extracting entities").await?;
    let extractor = EntityExtractor::new(deps.chat.clone(), deps.config.entity_max_entities);
    let mut chunk_entities: Vec<(&Chunk, Vec<Entity>)> = Vec::with_capacity(chunks.len());
    let mut unique: HashSet<(String, String)> = HashSet::new();
    for chunk in &chunks {
        let entities = match extractor.extract(&chunk.text).await {
            Ok(entities) => entities,
            Err(e) => {
                tracing::warn!(
                    doc_id = %doc.doc_id,
                    chunk_id = %chunk.chunk_id,
                    error = %e,
                    "entity extraction failed for chunk"
                );
                Vec::new()
            }
        };
        for entity in &entities {
            unique.insert((entity.entity_type.clone(), entity.name.to_lowercase()));
        }
        chunk_entities.push((chunk, entities));
    }
    doc.entity_count = unique.len() as i32;

    // neo4j: link mentions; an unreachable graph is skipped, not fatal.
    emit(deps, doc, Stage::Neo4j, "Writing graph").await?;
    if deps.graph.enabled() {
        for (chunk, entities) in &chunk_entities {
            if let Err(e) = deps.graph.link_chunk_entities(chunk, entities).await {
                tracing::warn!(
                    doc_id = %doc.doc_id,
                    error = %e,
                    "graph write failed, skipping remaining links"
                );
                break;
            }
        }
    }

    // indexed: finalize counts and progress.
    doc.status = DocumentStatus::Indexed;
    doc.stage = Stage::Indexed;
    doc.progress = 100;
    deps.meta
        .update_document(
            doc.doc_id,
            &DocumentPatch {
                status: Some(DocumentStatus::Indexed),
                stage: Some(Stage::Indexed),
                progress: Some(100),
                chunk_count: Some(doc.chunk_count),
                entity_count: Some(doc.entity_count),
                ..Default::default()
            },
        )
        .await?;
    publish_progress(
        deps.broker.as_ref(),
        &ProgressEvent::for_stage(doc, Stage::Indexed, format!("Indexed {} chunks", doc.chunk_count)),
    )
    .await?;

    Ok(())
}

/// Publishes a stage transition (snapshot + broadcast) and tracks progress
/// on the in-memory document.
async fn emit(
    deps: &WorkerDeps,
    doc: &mut Document,
    stage: Stage,
    message: &str,
) -> Result<(), ServiceError> {
    doc.stage = stage;
    if let Some(percent) = stage.percent() {
        doc.progress = percent as i32;
    }
    publish_progress(
        deps.broker.as_ref(),
        &ProgressEvent::for_stage(doc, stage, message),
    )
    .await
}

async fn mark_failed(deps: &WorkerDeps, doc: &mut Document, err: &ServiceError) {
    doc.status = DocumentStatus::Failed;
    doc.stage = Stage::Failed;
    let message = err.to_string();
    doc.error_message = Some(message.clone());

    if let Err(e) = deps
        .meta
        .update_document(
            doc.doc_id,
            &DocumentPatch {
                status: Some(DocumentStatus::Failed),
                stage: Some(Stage::Failed),
                progress: Some(doc.progress),
                error_message: Some(message.clone()),
                chunk_count: Some(doc.chunk_count),
                entity_count: Some(doc.entity_count),
            },
        )
        .await
    {
        tracing::error!(doc_id = %doc.doc_id, error = %e, "failed to persist failed state");
    }

    if let Err(e) = publish_progress(
        deps.broker.as_ref(),
        &ProgressEvent::for_stage(doc, Stage::Failed, message),
    )
    .await
    {
        tracing::error!(doc_id = %doc.doc_id, error = %e, "failed to publish failed event");
    }
}

/// A document whose task was aborted at the drain deadline.
async fn mark_abandoned(deps: &WorkerDeps, doc_id: Uuid) {
    match deps.meta.get_document_any(doc_id).await {
        Ok(Some(mut doc)) if !doc.status.is_terminal() => {
            mark_failed(
                deps,
                &mut doc,
                &ServiceError::Internal("worker shut down before ingestion completed".into()),
            )
            .await;
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!(%doc_id, error = %e, "could not mark abandoned document");
        }
    }
}
