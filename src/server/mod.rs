//! HTTP surface.
//!
//! Thin axum handlers over the orchestrator; every endpoint except /health
//! requires a bearer token. Auth proper lives in a collaborator in front of
//! this service; here the token is only checked against `API_TOKEN` when
//! one is configured.

pub mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    http::header::AUTHORIZATION,
    middleware,
    routing::{delete, get, post},
    Extension, Router,
};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::config::ServerConfig;
use crate::error::RagError;
use crate::generator::Generator;
use crate::ingest::{IngestCoordinator, IngestPipeline};
use crate::cache::ResponseCache;
use crate::orchestrator::Orchestrator;
use crate::storage::ChunkStore;

/// Max accepted upload size.
const MAX_UPLOAD_BYTES: usize = 400 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub orchestrator: Arc<Orchestrator>,
    pub coordinator: Arc<IngestCoordinator>,
    pub pipeline: Arc<IngestPipeline>,
    pub store: Arc<dyn ChunkStore>,
    pub generator: Arc<dyn Generator>,
    pub cache: Arc<ResponseCache>,
}

async fn auth_middleware(
    Extension(config): Extension<Arc<ServerConfig>>,
    req: axum::extract::Request,
    next: middleware::Next,
) -> Result<axum::response::Response, RagError> {
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim())
        .filter(|t| !t.is_empty());

    match (&config.api_token, token) {
        (_, None) => Err(RagError::AuthRequired("missing bearer token".into())),
        (Some(expected), Some(got)) if got != expected.as_str() => {
            Err(RagError::AuthRequired("invalid bearer token".into()))
        }
        _ => Ok(next.run(req).await),
    }
}

pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(handlers::health));

    let protected_routes = Router::new()
        .route("/ask", post(handlers::ask_corpus))
        .route("/ask-enhanced", post(handlers::ask_web))
        .route("/ask-research", post(handlers::ask_combined))
        .route("/ask-notes", post(handlers::ask_notes))
        .route("/plan-queries", post(handlers::plan_queries))
        .route("/ingest", post(handlers::ingest))
        .route("/documents", get(handlers::list_documents))
        .route("/documents/{id}", delete(handlers::delete_document))
        .route("/upload", post(handlers::upload))
        .route("/models", get(handlers::list_models))
        .layer(middleware::from_fn(auth_middleware));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(Extension(state.config.clone()))
        .layer(Extension(state))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}
