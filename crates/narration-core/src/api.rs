//! Catalog client for the books/chapters backend.

use crate::error::{Error, Result};
use crate::remote::RemoteTransport;
use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSummary {
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterSummary {
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub chapter_number: Option<u32>,
    #[serde(default)]
    pub audio_available: bool,
    #[serde(default)]
    pub subtitles_available: bool,
}

/// Chapter metadata; resource references are absolute after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterDetail {
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub chapter_number: Option<u32>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub subtitles_url: Option<String>,
}

/// Backend calls needed by the session and library layers.
pub trait Catalog: Send + Sync {
    fn list_books(&self) -> Result<Vec<BookSummary>>;
    fn list_chapters(&self, book_id: &str) -> Result<Vec<ChapterSummary>>;
    fn chapter_detail(&self, book_id: &str, chapter_id: &str) -> Result<ChapterDetail>;
}

pub struct BackendClient {
    base_url: String,
    transport: Arc<dyn RemoteTransport>,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, transport: Arc<dyn RemoteTransport>) -> Self {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        Self {
            base_url,
            transport,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.transport.get(url)?;
        if !response.is_success() {
            return Err(Error::RemoteUnavailable {
                url: url.to_string(),
                status: Some(response.status),
            });
        }
        serde_json::from_slice(&response.body).map_err(|err| Error::InvalidPayload {
            url: url.to_string(),
            message: err.to_string(),
        })
    }

    /// Absolute references pass through; relative ones are joined onto the
    /// base URL. Blank references count as absent.
    fn resolve_reference(&self, reference: Option<String>) -> Option<String> {
        let reference = reference?.trim().to_string();
        if reference.is_empty() {
            return None;
        }
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return Some(reference);
        }
        let base = format!("{}/", self.base_url);
        match Url::parse(&base).and_then(|base| base.join(&reference)) {
            Ok(url) => Some(url.to_string()),
            Err(err) => {
                debug!(%reference, "Could not resolve relative reference: {err}");
                Some(reference)
            }
        }
    }
}

impl Catalog for BackendClient {
    fn list_books(&self) -> Result<Vec<BookSummary>> {
        let url = self.endpoint("/books");
        let books: Vec<BookSummary> = self.get_json(&url)?;
        info!(count = books.len(), "Fetched book list");
        Ok(books)
    }

    fn list_chapters(&self, book_id: &str) -> Result<Vec<ChapterSummary>> {
        let url = self.endpoint(&format!("/books/{book_id}/chapters"));
        let chapters: Vec<ChapterSummary> = self.get_json(&url)?;
        info!(book_id, count = chapters.len(), "Fetched chapter list");
        Ok(chapters)
    }

    fn chapter_detail(&self, book_id: &str, chapter_id: &str) -> Result<ChapterDetail> {
        let url = self.endpoint(&format!("/books/{book_id}/chapters/{chapter_id}"));
        let mut detail: ChapterDetail = self.get_json(&url)?;
        detail.audio_url = self.resolve_reference(detail.audio_url.take());
        detail.subtitles_url = self.resolve_reference(detail.subtitles_url.take());
        debug!(
            book_id,
            chapter_id,
            audio = ?detail.audio_url,
            subtitles = ?detail.subtitles_url,
            "Fetched chapter detail"
        );
        Ok(detail)
    }
}

/// Accept ids as JSON numbers or strings.
fn flexible_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s.trim().to_string()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}
