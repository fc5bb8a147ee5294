//! Personal-notes retrieval over the notes backend's HTTP API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;

use super::{BranchError, SourceHits, SourceRetriever};
use crate::types::{Locator, Origin, RetrievalHit, SearchQuery, Settings};

/// Excerpts shorter than this are replaced with the full note body so the
/// generator sees enough context to answer from.
const EXCERPT_FETCH_THRESHOLD: usize = 240;

#[derive(Deserialize)]
struct NoteSearchResponse {
    results: Vec<NoteSearchHit>,
}

#[derive(Deserialize)]
struct NoteSearchHit {
    path: String,
    #[serde(default)]
    heading: Option<String>,
    #[serde(default)]
    excerpt: String,
    #[serde(default)]
    score: Option<f32>,
}

#[derive(Deserialize)]
struct NoteBody {
    #[serde(default)]
    content: String,
}

/// Bridge to the notes backend (`GET /search`, `GET /notes/{path}`).
///
/// The backend is optional: when unconfigured or unreachable at startup the
/// notes branch is left out of the mode selector entirely.
pub struct NotesRetriever {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl NotesRetriever {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build notes HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Startup availability probe. A `false` here disables the notes branch
    /// for the lifetime of the process.
    pub async fn probe(&self) -> bool {
        let url = format!("{}/notes", self.base_url);
        match self.authorized(self.client.get(&url)).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "notes backend probe rejected");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "notes backend unreachable");
                false
            }
        }
    }

    async fn fetch_body(&self, path: &str) -> Option<String> {
        let url = format!("{}/notes/{}", self.base_url, path.trim_start_matches('/'));
        let response = self.authorized(self.client.get(&url)).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        // The backend returns either a JSON body or raw markdown.
        let text = response.text().await.ok()?;
        match serde_json::from_str::<NoteBody>(&text) {
            Ok(body) if !body.content.is_empty() => Some(body.content),
            _ => Some(text),
        }
    }
}

#[async_trait]
impl SourceRetriever for NotesRetriever {
    fn origin(&self) -> Origin {
        Origin::Note
    }

    async fn search(
        &self,
        query: &SearchQuery,
        settings: &Settings,
        _deadline: Instant,
    ) -> Result<SourceHits, BranchError> {
        let k = settings.rerank_top_k.max(1);
        let url = format!("{}/search", self.base_url);

        let response = self
            .authorized(self.client.get(&url).query(&[
                ("q", query.text.as_str()),
                ("limit", &k.to_string()),
            ]))
            .send()
            .await
            .map_err(|e| BranchError::Backend(format!("notes search failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(BranchError::Backend(format!(
                "notes search returned HTTP {}",
                response.status()
            )));
        }

        let parsed: NoteSearchResponse = response
            .json()
            .await
            .map_err(|e| BranchError::Backend(format!("notes search response malformed: {}", e)))?;

        let mut hits = Vec::with_capacity(parsed.results.len());
        for note in parsed.results.into_iter().take(k) {
            let text = if note.excerpt.len() < EXCERPT_FETCH_THRESHOLD {
                self.fetch_body(&note.path)
                    .await
                    .unwrap_or_else(|| note.excerpt.clone())
            } else {
                note.excerpt.clone()
            };

            if text.trim().is_empty() {
                continue;
            }

            hits.push(RetrievalHit {
                id: note.path.clone(),
                text,
                origin: Origin::Note,
                locator: Locator::NoteFile {
                    note_path: note.path,
                    heading: note.heading,
                },
                lexical: None,
                semantic: note.score,
                rerank: None,
            });
        }

        tracing::debug!(query = %query.text, hits = hits.len(), "notes retrieval complete");
        Ok(SourceHits { hits, rerank: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_response_parses_with_optional_fields() {
        let raw = r#"{"results": [
            {"path": "trading/journal.md", "heading": "Monday", "excerpt": "Shorted the open.", "score": 0.82},
            {"path": "inbox.md"}
        ]}"#;
        let parsed: NoteSearchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.results.len(), 2);
        assert_eq!(parsed.results[0].path, "trading/journal.md");
        assert_eq!(parsed.results[0].score, Some(0.82));
        assert_eq!(parsed.results[1].heading, None);
        assert!(parsed.results[1].excerpt.is_empty());
    }

    #[test]
    fn note_body_parses_json_or_falls_through() {
        let json: NoteBody = serde_json::from_str(r#"{"content": "# Title\nbody"}"#).unwrap();
        assert_eq!(json.content, "# Title\nbody");
        assert!(serde_json::from_str::<NoteBody>("plain markdown, not json").is_err());
    }
}
