//! Book and chapter listings with last-known-good fallback.

use crate::api::{BookSummary, Catalog, ChapterSummary};
use crate::error::{Error, Result};
use crate::store::{CachedChapterListBundle, ChapterStateStore, now_unix_secs};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Live,
    /// Served from the durable store; carries the original resolve time.
    Cached { resolved_at: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterListing {
    pub book_id: String,
    pub chapters: Vec<ChapterSummary>,
    pub provenance: Provenance,
}

pub struct ChapterLibrary {
    catalog: Arc<dyn Catalog>,
    store: Arc<ChapterStateStore>,
}

impl ChapterLibrary {
    pub fn new(catalog: Arc<dyn Catalog>, store: Arc<ChapterStateStore>) -> Self {
        Self { catalog, store }
    }

    pub fn books(&self) -> Result<Vec<BookSummary>> {
        self.catalog.list_books()
    }

    /// Live chapter list, or the last stored one when the backend fails.
    ///
    /// Only network failures fall back. A 404/410 means the book is gone, so
    /// its stored list is dropped and the error returned.
    pub fn chapters(&self, book_id: &str) -> Result<ChapterListing> {
        match self.catalog.list_chapters(book_id) {
            Ok(chapters) => {
                self.store.put_chapter_list(CachedChapterListBundle {
                    book_id: book_id.to_string(),
                    chapters: chapters.clone(),
                    resolved_at: now_unix_secs(),
                });
                Ok(ChapterListing {
                    book_id: book_id.to_string(),
                    chapters,
                    provenance: Provenance::Live,
                })
            }
            Err(err) if is_gone(&err) => {
                if self.store.remove_chapter_list(book_id).is_some() {
                    info!(book_id, "Book is gone upstream; dropped cached chapter list");
                }
                Err(err)
            }
            Err(err) if err.is_remote() => match self.store.chapter_list(book_id) {
                Some(cached) => {
                    warn!(book_id, "Chapter list fetch failed, using cached list: {err}");
                    info!(
                        book_id,
                        count = cached.chapters.len(),
                        resolved_at = cached.resolved_at,
                        "Serving cached chapter list"
                    );
                    Ok(ChapterListing {
                        book_id: cached.book_id,
                        chapters: cached.chapters,
                        provenance: Provenance::Cached {
                            resolved_at: cached.resolved_at,
                        },
                    })
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }
}

fn is_gone(err: &Error) -> bool {
    matches!(
        err,
        Error::RemoteUnavailable {
            status: Some(404 | 410),
            ..
        }
    )
}
