//! Live-web retrieval: metasearch for URLs, then bounded-concurrency page
//! fetches with main-text extraction. Snippet-only results never reach the
//! generator; a hit must be materialized to count.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::time::Instant;

use super::{BranchError, SourceHits, SourceRetriever};
use crate::types::{Locator, Origin, RetrievalHit, SearchQuery, Settings};

/// Concurrent page fetches per request.
const FETCH_CONCURRENCY: usize = 4;
/// Per-URL fetch timeout.
const PAGE_TIMEOUT_SECS: u64 = 6;
/// Cap on downloaded page bytes.
const MAX_PAGE_BYTES: usize = 2 * 1024 * 1024;
/// Cap on extracted text per page, keeps one page from eating the prompt.
const MAX_PAGE_CHARS: usize = 20_000;

#[derive(Deserialize)]
struct MetasearchResponse {
    #[serde(default)]
    results: Vec<MetasearchHit>,
}

#[derive(Deserialize)]
struct MetasearchHit {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone)]
pub struct WebResult {
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub rank: usize,
}

/// Client for a local metasearch engine plus a page materializer.
pub struct WebSearcher {
    client: reqwest::Client,
    base_url: String,
}

impl WebSearcher {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(PAGE_TIMEOUT_SECS))
            .build()
            .context("Failed to build web HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Query the metasearch engine. The forwarded-client-address headers are
    /// required: without them the engine's anti-abuse layer answers 403.
    pub async fn search_raw(&self, query: &str, k: usize) -> Result<Vec<WebResult>, BranchError> {
        let url = format!("{}/search", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("q", query), ("format", "json"), ("pageno", "1")])
            .header("X-Forwarded-For", "127.0.0.1")
            .header("X-Real-IP", "127.0.0.1")
            .send()
            .await
            .map_err(|e| BranchError::Backend(format!("metasearch request failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(BranchError::Backend(
                "metasearch rejected the request (HTTP 403)".to_string(),
            ));
        }
        if !response.status().is_success() {
            return Err(BranchError::Backend(format!(
                "metasearch returned HTTP {}",
                response.status()
            )));
        }

        let parsed: MetasearchResponse = response
            .json()
            .await
            .map_err(|e| BranchError::Backend(format!("metasearch response malformed: {}", e)))?;

        Ok(parsed
            .results
            .into_iter()
            .take(k)
            .enumerate()
            .map(|(rank, hit)| WebResult {
                url: hit.url,
                title: hit.title,
                snippet: hit.content,
                rank,
            })
            .collect())
    }

    /// Fetch one page and extract its main text. Size-capped and bounded by
    /// the client timeout; any failure drops the page.
    pub async fn parse(&self, url: &str) -> Option<String> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", "quorum-rag/0.1")
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            return None;
        }

        if let Some(len) = response.content_length() {
            if len as usize > MAX_PAGE_BYTES {
                tracing::debug!(url = %url, bytes = len, "page over size cap, skipping");
                return None;
            }
        }

        let html = response.text().await.ok()?;
        if html.len() > MAX_PAGE_BYTES {
            return None;
        }

        let text = extract_main_text(&html);
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Pull readable text out of an HTML document: headings, paragraphs and list
/// items, in document order.
fn extract_main_text(html: &str) -> String {
    let document = scraper::Html::parse_document(html);
    let selector = match scraper::Selector::parse("h1, h2, h3, p, li, td") {
        Ok(s) => s,
        Err(_) => return String::new(),
    };

    let mut out = String::new();
    for element in document.select(&selector) {
        let text: String = element.text().collect::<Vec<_>>().join(" ");
        let trimmed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if trimmed.len() < 3 {
            continue;
        }
        out.push_str(&trimmed);
        out.push('\n');
        if out.len() >= MAX_PAGE_CHARS {
            out.truncate(MAX_PAGE_CHARS);
            break;
        }
    }
    out
}

#[async_trait]
impl SourceRetriever for WebSearcher {
    fn origin(&self) -> Origin {
        Origin::Web
    }

    async fn search(
        &self,
        query: &SearchQuery,
        settings: &Settings,
        _deadline: Instant,
    ) -> Result<SourceHits, BranchError> {
        let results = self.search_raw(&query.text, settings.web_results).await?;
        if results.is_empty() {
            return Ok(SourceHits::default());
        }

        let to_parse: Vec<WebResult> = results
            .into_iter()
            .take(settings.web_pages_parsed)
            .collect();

        // Partial success is fine: pages that fail to fetch or extract are
        // dropped, and whatever materialized becomes the branch result.
        let materialized: Vec<RetrievalHit> = stream::iter(to_parse)
            .map(|result| async move {
                let text = self.parse(&result.url).await?;
                Some(RetrievalHit {
                    id: result.url.clone(),
                    text,
                    origin: Origin::Web,
                    locator: Locator::Page {
                        url: result.url,
                        title: result.title,
                    },
                    lexical: None,
                    semantic: None,
                    rerank: None,
                })
            })
            .buffered(FETCH_CONCURRENCY)
            .filter_map(|hit| async move { hit })
            .collect()
            .await;

        tracing::debug!(
            query = %query.text,
            materialized = materialized.len(),
            "web retrieval complete"
        );

        Ok(SourceHits {
            hits: materialized,
            rerank: None,
        })
    }
}
