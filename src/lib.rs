//! # ragd
//!
//! **A self-hosted Retrieval-Augmented Generation service.**
//!
//! `ragd` ingests documents (PDF, Markdown, plain text), segments them into
//! semantically meaningful chunks with a remote chat model, embeds the
//! chunks into a vector store, extracts named entities into a graph store,
//! and answers retrieval queries with hybrid search, cross-encoder
//! reranking, and graph expansion over co-mentioned entities.
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────┐  job   ┌──────────┐
//!  upload ──▶│   API    │──────▶│  Worker   │── chunk / embed / entities
//!            │  (axum)  │ redis │ (queue)   │
//!            └────┬─────┘◀──────└────┬──────┘
//!                 │    progress      │
//!        ┌────────┼───────────┬──────┴─────┬───────────┐
//!        ▼        ▼           ▼            ▼           ▼
//!    Postgres   Redis      Weaviate      Neo4j     LLM / Embedder
//!    (metadata) (queue+    (hybrid       (entity   (OpenAI-compatible)
//!               pub/sub)   search)       graph)
//! ```
//!
//! Two long-running processes share the stores: `ragd serve` is the HTTP
//! API, `ragd work` is the queue-driven ingestion worker. Every stored
//! artifact carries a [`scope::ScopeKey`] and every read goes through a
//! [`scope::Visibility`], so tenant/workspace/user isolation is enforced at
//! each store boundary rather than in handlers.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-driven configuration |
//! | [`scope`] | Tenant/workspace/user scoping primitives |
//! | [`error`] | Service error taxonomy |
//! | [`models`] | Documents, chunks, entities, progress events |
//! | [`meta`] | Document metadata store (Postgres) |
//! | [`queue`] | Job queue, progress cache, pub/sub (Redis) |
//! | [`vector`] | Vector store adapter (Weaviate hybrid search) |
//! | [`graph`] | Entity graph adapter (Neo4j) |
//! | [`llm`] | OpenAI-compatible chat + embedding clients |
//! | [`rerank`] | Cross-encoder scorer interface |
//! | [`extract`] | Text extraction with page boundaries |
//! | [`chunker`] | LLM-driven semantic chunking |
//! | [`entities`] | LLM-driven entity extraction |
//! | [`progress`] | Progress fan-out for SSE |
//! | [`worker`] | Ingestion state machine + concurrency supervisor |
//! | [`retrieve`] | Hybrid → rerank → expand → rerank pipeline |
//! | [`server`] | HTTP surface |

pub mod chunker;
pub mod config;
pub mod entities;
pub mod error;
pub mod extract;
pub mod graph;
pub mod llm;
pub mod meta;
pub mod models;
pub mod progress;
pub mod queue;
pub mod rerank;
pub mod retrieve;
pub mod scope;
pub mod server;
pub mod vector;
pub mod worker;
