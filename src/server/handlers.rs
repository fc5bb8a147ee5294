use axum::{
    extract::{Multipart, Path},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::error::RagError;
use crate::orchestrator::AskRequest;
use crate::types::{AskResponse, Mode};

pub async fn ask_corpus(
    Extension(state): Extension<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, RagError> {
    Ok(Json(state.orchestrator.ask(req, Mode::CorpusOnly).await?))
}

pub async fn ask_web(
    Extension(state): Extension<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, RagError> {
    Ok(Json(state.orchestrator.ask(req, Mode::WebOnly).await?))
}

pub async fn ask_combined(
    Extension(state): Extension<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, RagError> {
    Ok(Json(state.orchestrator.ask(req, Mode::Combined).await?))
}

pub async fn ask_notes(
    Extension(state): Extension<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, RagError> {
    Ok(Json(state.orchestrator.ask(req, Mode::NotesOnly).await?))
}

#[derive(Deserialize)]
pub struct PlanRequest {
    pub query: String,
    #[serde(default)]
    pub mode: Option<Mode>,
}

pub async fn plan_queries(
    Extension(state): Extension<AppState>,
    Json(req): Json<PlanRequest>,
) -> Result<Json<serde_json::Value>, RagError> {
    let plan = state.orchestrator.plan_only(&req.query, req.mode).await?;
    Ok(Json(json!({
        "generated_queries": plan.queries,
        "entities": plan.entities,
    })))
}

#[derive(Deserialize, Default)]
pub struct IngestRequest {
    #[serde(default)]
    pub force_reindex: bool,
}

pub async fn ingest(
    Extension(state): Extension<AppState>,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, RagError> {
    // The body is optional; an empty POST means a plain incremental run.
    let force = if body.is_empty() {
        false
    } else {
        serde_json::from_slice::<IngestRequest>(&body)
            .map_err(|e| RagError::InvalidRequest(format!("malformed ingest body: {}", e)))?
            .force_reindex
    };

    let version_before = state.store.version();
    let report = state.pipeline.run(force).await;
    let version_after = state.store.version();

    // Old answers are unreachable by key once the version moved; sweeping
    // just reclaims the memory early.
    if version_after > version_before {
        state.cache.invalidate_by_version(version_after - 1);
    }

    Ok(Json(json!({
        "processed": report.processed,
        "chunks": report.chunks,
        "failed": report.failed,
    })))
}

pub async fn list_documents(
    Extension(state): Extension<AppState>,
) -> Result<Json<serde_json::Value>, RagError> {
    let documents = state
        .store
        .list_documents()
        .await
        .map_err(|e| RagError::StoreUnavailable(e.to_string()))?;
    Ok(Json(json!({ "documents": documents })))
}

pub async fn delete_document(
    Extension(state): Extension<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<serde_json::Value>, RagError> {
    let version_before = state.store.version();
    let removed = state
        .coordinator
        .remove_document(&doc_id)
        .await
        .map_err(|e| RagError::StoreUnavailable(format!("{:#}", e)))?;

    let version_after = state.store.version();
    if version_after > version_before {
        state.cache.invalidate_by_version(version_after - 1);
    }

    Ok(Json(json!({ "removed_chunks": removed })))
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub filename: String,
    pub size: usize,
}

pub async fn upload(
    Extension(state): Extension<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, RagError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RagError::InvalidRequest(format!("malformed multipart body: {}", e)))?
    {
        let Some(filename) = field.file_name().map(|f| f.to_string()) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| RagError::InvalidRequest(format!("failed to read upload: {}", e)))?;

        let saved = state
            .pipeline
            .save_upload(&filename, &bytes)
            .await
            .map_err(|e| RagError::Internal(format!("{:#}", e)))?;

        tracing::info!(file = %saved.display(), bytes = bytes.len(), "upload stored");
        return Ok(Json(UploadResponse {
            filename,
            size: bytes.len(),
        }));
    }

    Err(RagError::InvalidRequest("no file field in upload".into()))
}

pub async fn list_models(
    Extension(state): Extension<AppState>,
) -> Result<Json<serde_json::Value>, RagError> {
    let models = state
        .generator
        .list_models()
        .await
        .map_err(|e| RagError::GeneratorFailed(format!("{:#}", e)))?;
    Ok(Json(json!({ "models": models })))
}

pub async fn health(Extension(state): Extension<AppState>) -> Json<serde_json::Value> {
    let generator_up = state.generator.ping().await;
    let chunk_count = state.store.count().await.ok();
    Json(json!({
        "status": if generator_up { "ok" } else { "degraded" },
        "generator": generator_up,
        "chunks": chunk_count,
        "corpus_version": state.store.version(),
        "cache_entries": state.cache.len(),
    }))
}
