//! Chapter resolution and the per-chapter session lifecycle.
//!
//! `Idle -> Loading -> {Ready | NoAudio | Error}`. Resolution runs on a
//! worker thread; each load carries a request id, and completions whose id
//! or chapter no longer match the session are dropped.

use crate::api::Catalog;
use crate::cache::{ResourceCache, read_text};
use crate::caption::parse_caption_text;
use crate::error::{Error, Result};
use crate::library::Provenance;
use crate::store::{CachedChapterBundle, ChapterStateStore, now_unix_secs};
use crate::timeline::ChapterCaptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChapterRef {
    pub book_id: String,
    pub chapter_id: String,
}

impl ChapterRef {
    pub fn new(book_id: impl Into<String>, chapter_id: impl Into<String>) -> Self {
        Self {
            book_id: book_id.into(),
            chapter_id: chapter_id.into(),
        }
    }
}

impl std::fmt::Display for ChapterRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.book_id, self.chapter_id)
    }
}

/// Everything playback needs for one chapter.
#[derive(Debug, Clone)]
pub struct ReadyChapter {
    pub chapter: ChapterRef,
    pub title: String,
    pub chapter_number: Option<u32>,
    pub audio_path: PathBuf,
    pub subtitle_text: Option<String>,
    pub captions: ChapterCaptions,
    pub provenance: Provenance,
}

#[derive(Debug, Clone)]
pub enum ChapterOutcome {
    Ready(Box<ReadyChapter>),
    NoAudio,
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub enum ChapterState {
    #[default]
    Idle,
    Loading {
        request_id: u64,
    },
    Ready(Box<ReadyChapter>),
    NoAudio,
    Error(String),
}

impl ChapterState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChapterState::Ready(_) | ChapterState::NoAudio | ChapterState::Error(_)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChapterState::Idle => "idle",
            ChapterState::Loading { .. } => "loading",
            ChapterState::Ready(_) => "ready",
            ChapterState::NoAudio => "no-audio",
            ChapterState::Error(_) => "error",
        }
    }
}

/// Runs the live path and the cached fallback for one chapter.
pub struct ChapterResolver {
    catalog: Arc<dyn Catalog>,
    cache: Arc<ResourceCache>,
    store: Arc<ChapterStateStore>,
    anticipation: f64,
}

impl ChapterResolver {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        cache: Arc<ResourceCache>,
        store: Arc<ChapterStateStore>,
        anticipation: f64,
    ) -> Self {
        Self {
            catalog,
            cache,
            store,
            anticipation,
        }
    }

    pub fn resolve(&self, chapter: &ChapterRef) -> ChapterOutcome {
        match self.resolve_live(chapter) {
            Ok(Some(ready)) => ChapterOutcome::Ready(Box::new(ready)),
            Ok(None) => {
                info!(%chapter, "Chapter has no audio reference");
                if self
                    .store
                    .remove_bundle(&chapter.book_id, &chapter.chapter_id)
                    .is_some()
                {
                    debug!(%chapter, "Evicted stale cached bundle");
                }
                ChapterOutcome::NoAudio
            }
            Err(err) => {
                warn!(%chapter, "Live chapter resolve failed: {err}");
                self.fallback(chapter, &err)
            }
        }
    }

    fn resolve_live(&self, chapter: &ChapterRef) -> Result<Option<ReadyChapter>> {
        let detail = self
            .catalog
            .chapter_detail(&chapter.book_id, &chapter.chapter_id)?;
        let Some(audio_url) = detail.audio_url.clone() else {
            return Ok(None);
        };

        let audio = self.cache.resolve(&audio_url)?;
        let subtitles = detail.subtitles_url.as_deref().and_then(|url| {
            match self.cache.resolve_text(url) {
                Ok((resolved, text)) => Some((resolved.entry.local_path, text)),
                Err(err) => {
                    warn!(%chapter, %url, "Continuing without subtitles: {err}");
                    None
                }
            }
        });
        let (local_subtitle_path, subtitle_text) = match subtitles {
            Some((path, text)) => (Some(path), Some(text)),
            None => (None, None),
        };

        self.store.put_bundle(CachedChapterBundle {
            book_id: chapter.book_id.clone(),
            chapter_id: chapter.chapter_id.clone(),
            title: detail.title.clone(),
            chapter_number: detail.chapter_number,
            remote_audio_ref: audio_url,
            remote_subtitle_ref: detail.subtitles_url.clone(),
            local_audio_path: audio.entry.local_path.clone(),
            local_subtitle_path,
            subtitle_text: subtitle_text.clone(),
            resolved_at: now_unix_secs(),
        });

        info!(
            %chapter,
            audio = %audio.entry.local_path.display(),
            outcome = ?audio.outcome,
            subtitles = subtitle_text.is_some(),
            "Resolved chapter from backend"
        );
        Ok(Some(ReadyChapter {
            chapter: chapter.clone(),
            title: detail.title,
            chapter_number: detail.chapter_number,
            audio_path: audio.entry.local_path,
            captions: self.build_captions(subtitle_text.as_deref()),
            subtitle_text,
            provenance: Provenance::Live,
        }))
    }

    fn fallback(&self, chapter: &ChapterRef, cause: &Error) -> ChapterOutcome {
        let Some(bundle) = self.store.bundle(&chapter.book_id, &chapter.chapter_id) else {
            return ChapterOutcome::Failed(format!("Could not load chapter: {cause}"));
        };
        if !bundle.local_audio_path.is_file() {
            warn!(
                %chapter,
                path = %bundle.local_audio_path.display(),
                "Cached bundle points at missing audio"
            );
            return ChapterOutcome::Failed(format!(
                "Could not load chapter: {cause} (cached audio is no longer on disk)"
            ));
        }

        let subtitle_text = bundle.subtitle_text.clone().or_else(|| {
            bundle
                .local_subtitle_path
                .as_deref()
                .and_then(|path| match read_text(path) {
                    Ok(text) => Some(text),
                    Err(err) => {
                        debug!(%chapter, "Cached subtitle file unreadable: {err}");
                        None
                    }
                })
        });

        info!(
            %chapter,
            resolved_at = bundle.resolved_at,
            "Falling back to cached chapter bundle"
        );
        ChapterOutcome::Ready(Box::new(ReadyChapter {
            chapter: chapter.clone(),
            title: bundle.title,
            chapter_number: bundle.chapter_number,
            audio_path: bundle.local_audio_path,
            captions: self.build_captions(subtitle_text.as_deref()),
            subtitle_text,
            provenance: Provenance::Cached {
                resolved_at: bundle.resolved_at,
            },
        }))
    }

    fn build_captions(&self, subtitle_text: Option<&str>) -> ChapterCaptions {
        subtitle_text
            .map(|text| ChapterCaptions::build(parse_caption_text(text), self.anticipation))
            .unwrap_or_default()
    }
}

struct Completion {
    request_id: u64,
    chapter: ChapterRef,
    outcome: ChapterOutcome,
}

/// Owns the state of the chapter currently being shown.
pub struct ChapterSession {
    resolver: Arc<ChapterResolver>,
    state: ChapterState,
    current: Option<ChapterRef>,
    request_id: u64,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
}

impl ChapterSession {
    pub fn new(resolver: Arc<ChapterResolver>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            resolver,
            state: ChapterState::Idle,
            current: None,
            request_id: 0,
            tx,
            rx,
        }
    }

    pub fn state(&self) -> &ChapterState {
        &self.state
    }

    pub fn current(&self) -> Option<&ChapterRef> {
        self.current.as_ref()
    }

    /// Start loading `chapter`. An in-flight load for another chapter keeps
    /// running but its result will be discarded.
    pub fn open(&mut self, chapter: ChapterRef) -> u64 {
        self.request_id = self.request_id.wrapping_add(1);
        let request_id = self.request_id;
        self.current = Some(chapter.clone());
        self.state = ChapterState::Loading { request_id };
        info!(%chapter, request_id, "Loading chapter");

        let resolver = Arc::clone(&self.resolver);
        let tx = self.tx.clone();
        thread::spawn(move || {
            let outcome = resolver.resolve(&chapter);
            let _ = tx.send(Completion {
                request_id,
                chapter,
                outcome,
            });
        });
        request_id
    }

    /// Restart the current chapter from `Idle` after a terminal state.
    pub fn retry(&mut self) -> Option<u64> {
        if !self.state.is_terminal() {
            return None;
        }
        let chapter = self.current.clone()?;
        self.state = ChapterState::Idle;
        Some(self.open(chapter))
    }

    /// Apply any finished loads. Returns true when the state changed.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(completion) = self.rx.try_recv() {
            changed |= self.apply(completion);
        }
        changed
    }

    /// Block until the current load reaches a terminal state or `timeout`.
    pub fn wait(&mut self, timeout: Duration) -> &ChapterState {
        let deadline = Instant::now() + timeout;
        while matches!(self.state, ChapterState::Loading { .. }) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(completion) => {
                    self.apply(completion);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        &self.state
    }

    fn apply(&mut self, completion: Completion) -> bool {
        let matches_current = self.current.as_ref() == Some(&completion.chapter);
        if completion.request_id != self.request_id || !matches_current {
            debug!(
                chapter = %completion.chapter,
                request_id = completion.request_id,
                current_request_id = self.request_id,
                "Discarding stale chapter result"
            );
            return false;
        }
        self.state = match completion.outcome {
            ChapterOutcome::Ready(ready) => ChapterState::Ready(ready),
            ChapterOutcome::NoAudio => ChapterState::NoAudio,
            ChapterOutcome::Failed(message) => ChapterState::Error(message),
        };
        info!(
            chapter = %completion.chapter,
            state = self.state.label(),
            "Chapter load finished"
        );
        true
    }
}
