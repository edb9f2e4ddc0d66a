//! # ragd binary
//!
//! One binary, two processes:
//!
//! ```bash
//! ragd serve   # HTTP API
//! ragd work    # ingestion worker
//! ```
//!
//! Both read the same environment configuration (see `config`) and share
//! the four external stores, so any number of workers can run next to the
//! API as long as they point at the same Redis/Postgres/Weaviate/Neo4j.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use ragd::config::Config;
use ragd::graph::{GraphStore, Neo4jStore, NullGraphStore};
use ragd::llm::{HttpEmbedder, LlmClient};
use ragd::meta::{MetaStore, PgMetaStore};
use ragd::progress::ProgressBus;
use ragd::queue::{Broker, RedisBroker};
use ragd::rerank::create_reranker;
use ragd::server::{run_server, AppState};
use ragd::vector::{VectorStore, WeaviateStore};
use ragd::worker::{run_worker, WorkerDeps};

#[derive(Parser)]
#[command(
    name = "ragd",
    about = "Self-hosted RAG service: queue-driven ingestion, hybrid retrieval, entity graph",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API process.
    Serve,
    /// Start the ingestion worker process.
    Work,
}

struct Adapters {
    config: Arc<Config>,
    meta: Arc<dyn MetaStore>,
    broker: Arc<dyn Broker>,
    vector: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
}

async fn connect_adapters(config: Arc<Config>) -> anyhow::Result<Adapters> {
    let meta: Arc<dyn MetaStore> = Arc::new(PgMetaStore::connect(&config.database_url).await?);
    meta.ensure_schema().await?;

    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::connect(
            &config.redis_url,
            &config.redis_queue,
            &config.redis_progress_channel,
        )
        .await?,
    );

    let vector: Arc<dyn VectorStore> = Arc::new(WeaviateStore::new(
        &config.weaviate_url,
        &config.weaviate_collection,
    )?);

    let graph: Arc<dyn GraphStore> = if config.graph_enabled {
        Arc::new(Neo4jStore::new(
            &config.neo4j_http_url,
            &config.neo4j_user,
            &config.neo4j_password,
            &config.neo4j_database,
        )?)
    } else {
        Arc::new(NullGraphStore)
    };

    Ok(Adapters {
        config,
        meta,
        broker,
        vector,
        graph,
    })
}

async fn serve(adapters: Adapters) -> anyhow::Result<()> {
    let config = adapters.config.clone();

    // Collection bootstrap is best-effort here; the worker ensures it again
    // before the first insert.
    if let Err(e) = adapters.vector.ensure_collection().await {
        tracing::warn!(error = %e, "vector collection bootstrap failed");
    }

    let progress = Arc::new(ProgressBus::new());
    tokio::spawn(progress.clone().pump(adapters.broker.clone()));

    let state = AppState {
        config: config.clone(),
        meta: adapters.meta,
        broker: adapters.broker,
        vector: adapters.vector,
        graph: adapters.graph,
        embedder: Arc::new(HttpEmbedder::new(&config)?),
        reranker: create_reranker(&config)?,
        progress,
    };

    run_server(state).await
}

async fn work(adapters: Adapters) -> anyhow::Result<()> {
    let config = adapters.config.clone();
    let deps = WorkerDeps {
        config: config.clone(),
        meta: adapters.meta,
        broker: adapters.broker,
        vector: adapters.vector,
        graph: adapters.graph,
        embedder: Arc::new(HttpEmbedder::new(&config)?),
        chat: Arc::new(LlmClient::new(&config)?),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    run_worker(deps, shutdown_rx).await;
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("ragd=info".parse().expect("valid directive literal")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(Config::from_env()?);
    let adapters = connect_adapters(config).await?;

    match cli.command {
        Commands::Serve => serve(adapters).await,
        Commands::Work => work(adapters).await,
    }
}
