use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use quorum_rag::cache::ResponseCache;
use quorum_rag::config::ServerConfig;
use quorum_rag::embedding::{Embedder, HttpEmbedder};
use quorum_rag::generator::{Generator, OllamaGenerator};
use quorum_rag::index::{LexicalConfig, LexicalIndex};
use quorum_rag::ingest::{IngestCoordinator, IngestPipeline};
use quorum_rag::orchestrator::Orchestrator;
use quorum_rag::planner::QueryPlanner;
use quorum_rag::profile::ProfileStore;
use quorum_rag::rerank::{CrossEncoderReranker, Reranker};
use quorum_rag::retrieval::{CorpusRetriever, NotesRetriever, SourceRetriever, WebSearcher};
use quorum_rag::server::{build_router, AppState};
use quorum_rag::storage::{ChunkStore, LanceStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,quorum_rag=debug")),
        )
        .with_target(true)
        .init();

    let config = Arc::new(ServerConfig::from_env());
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
    info!(bind = %config.bind_addr, "starting quorum-rag");

    // Shared singletons, wired once at startup.
    let store: Arc<dyn ChunkStore> = Arc::new(
        LanceStore::connect(&config.chunk_store_url, config.embedding_dimension)
            .await
            .context("chunk store initialization failed")?,
    );
    info!(url = %config.chunk_store_url, "chunk store ready");

    let index = Arc::new(LexicalIndex::new(LexicalConfig::default()));
    match index.rebuild_from(store.as_ref()).await {
        Ok(count) => info!(chunks = count, "lexical index built"),
        Err(e) => tracing::warn!(error = %e, "initial lexical build failed, starting empty"),
    }

    let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(
        &config.llm_base_url,
        &config.embedding_model,
        config.embedding_dimension,
    )?);

    let reranker: Option<Arc<dyn Reranker>> = match &config.reranker_model_dir {
        Some(dir) => match CrossEncoderReranker::new(dir) {
            Ok(model) => {
                info!(dir = %dir.display(), "cross-encoder loaded");
                Some(Arc::new(model))
            }
            Err(e) => {
                tracing::warn!(error = %e, "cross-encoder unavailable, retrieval will use weighted fusion");
                None
            }
        },
        None => {
            info!("no RERANKER_MODEL_DIR set, retrieval will use weighted fusion");
            None
        }
    };

    let generator: Arc<dyn Generator> = Arc::new(OllamaGenerator::new(
        &config.llm_base_url,
        config.generator_max_concurrency,
    )?);

    let mut sources: Vec<Arc<dyn SourceRetriever>> = vec![Arc::new(CorpusRetriever::new(
        Arc::clone(&store),
        Arc::clone(&index),
        Arc::clone(&embedder),
        reranker,
    ))];

    // The notes backend is optional: if it does not answer the startup
    // probe, the branch stays out of the mode selector entirely.
    if let Some(notes_url) = &config.notes_api_url {
        let notes = NotesRetriever::new(notes_url, config.notes_api_key.clone())?;
        if notes.probe().await {
            info!(url = %notes_url, "notes backend available");
            sources.push(Arc::new(notes));
        } else {
            tracing::warn!(url = %notes_url, "notes backend not responding, notes modes disabled");
        }
    }

    if let Some(metasearch_url) = &config.metasearch_url {
        info!(url = %metasearch_url, "web search enabled");
        sources.push(Arc::new(WebSearcher::new(metasearch_url)?));
    }

    let cache = Arc::new(ResponseCache::new());
    let profiles = Arc::new(ProfileStore::new(config.profile_dir.clone()));
    let planner = QueryPlanner::new(Arc::clone(&generator), config.planner_expand_below_tokens);

    let orchestrator = Arc::new(Orchestrator::new(
        config.default_settings(),
        planner,
        Arc::clone(&cache),
        Arc::clone(&generator),
        Arc::clone(&store),
        Arc::clone(&profiles),
        sources,
    ));

    let coordinator = Arc::new(IngestCoordinator::new(Arc::clone(&store), Arc::clone(&index)));
    let pipeline = Arc::new(IngestPipeline::new(
        Arc::clone(&coordinator),
        Arc::clone(&embedder),
        config.upload_dir.clone(),
    ));

    let state = AppState {
        config: Arc::clone(&config),
        orchestrator,
        coordinator,
        pipeline,
        store,
        generator,
        cache,
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received, draining");
        })
        .await?;

    Ok(())
}
