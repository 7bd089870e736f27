//! Durable last-known-good state used when the backend cannot be reached.
//!
//! Two independent namespaces are kept: resolved chapter playback bundles
//! keyed by `"{book}#{chapter}"`, and chapter lists keyed by book id. Every
//! mutation rewrites the whole namespace through the injected
//! [`StorageBackend`] before returning. A failed write is logged and the
//! in-memory map stays authoritative for the rest of the process.

use crate::api::ChapterSummary;
use crate::cache::write_atomic;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const CHAPTER_BUNDLES: &str = "chapter-bundles";
pub const CHAPTER_LISTS: &str = "chapter-lists";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedChapterBundle {
    pub book_id: String,
    pub chapter_id: String,
    pub title: String,
    #[serde(default)]
    pub chapter_number: Option<u32>,
    pub remote_audio_ref: String,
    #[serde(default)]
    pub remote_subtitle_ref: Option<String>,
    pub local_audio_path: PathBuf,
    #[serde(default)]
    pub local_subtitle_path: Option<PathBuf>,
    #[serde(default)]
    pub subtitle_text: Option<String>,
    pub resolved_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedChapterListBundle {
    pub book_id: String,
    pub chapters: Vec<ChapterSummary>,
    pub resolved_at: u64,
}

/// Raw persistence for one serialized namespace.
pub trait StorageBackend: Send + Sync {
    fn load(&self, namespace: &str) -> Result<Option<String>>;
    fn save(&self, namespace: &str, contents: &str) -> Result<()>;
}

/// One JSON file per namespace under a directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.json"))
    }
}

impl StorageBackend for FileBackend {
    fn load(&self, namespace: &str) -> Result<Option<String>> {
        let path = self.path_for(namespace);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::LocalRead { path, source: err }),
        }
    }

    fn save(&self, namespace: &str, contents: &str) -> Result<()> {
        let path = self.path_for(namespace);
        write_atomic(&path, contents.as_bytes()).map_err(|err| Error::persist(path, err))
    }
}

/// Process-local backend for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<HashMap<String, String>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail, to exercise persist-failure paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::Release);
    }

    pub fn raw(&self, namespace: &str) -> Option<String> {
        lock(&self.data).get(namespace).cloned()
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&self, namespace: &str) -> Result<Option<String>> {
        Ok(lock(&self.data).get(namespace).cloned())
    }

    fn save(&self, namespace: &str, contents: &str) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::Acquire) {
            return Err(Error::persist(
                Path::new(namespace),
                io::Error::other("memory backend configured to fail"),
            ));
        }
        lock(&self.data).insert(namespace.to_string(), contents.to_string());
        Ok(())
    }
}

/// Write-through map for one namespace; the mutex is its serialization point.
pub struct DurableMap<V> {
    namespace: &'static str,
    backend: Arc<dyn StorageBackend>,
    entries: Mutex<BTreeMap<String, V>>,
}

impl<V> DurableMap<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    /// Load the namespace; unreadable or corrupt data starts the map empty.
    pub fn open(namespace: &'static str, backend: Arc<dyn StorageBackend>) -> Self {
        let entries = match backend.load(namespace) {
            Ok(Some(contents)) => match serde_json::from_str::<BTreeMap<String, V>>(&contents) {
                Ok(entries) => {
                    debug!(namespace, count = entries.len(), "Loaded durable state");
                    entries
                }
                Err(err) => {
                    warn!(namespace, "Discarding corrupt durable state: {err}");
                    BTreeMap::new()
                }
            },
            Ok(None) => BTreeMap::new(),
            Err(err) => {
                warn!(namespace, "Failed to load durable state: {err}");
                BTreeMap::new()
            }
        };
        Self {
            namespace,
            backend,
            entries: Mutex::new(entries),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        lock(&self.entries).get(key).cloned()
    }

    pub fn put(&self, key: &str, value: V) {
        let mut entries = lock(&self.entries);
        entries.insert(key.to_string(), value);
        self.persist(&entries);
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut entries = lock(&self.entries);
        let removed = entries.remove(key);
        if removed.is_some() {
            self.persist(&entries);
        }
        removed
    }

    pub fn clear_all(&self) {
        let mut entries = lock(&self.entries);
        entries.clear();
        self.persist(&entries);
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.entries).keys().cloned().collect()
    }

    fn persist(&self, entries: &BTreeMap<String, V>) {
        let serialized = match serde_json::to_string_pretty(entries) {
            Ok(serialized) => serialized,
            Err(err) => {
                warn!(namespace = self.namespace, "Failed to serialize durable state: {err}");
                return;
            }
        };
        if let Err(err) = self.backend.save(self.namespace, &serialized) {
            warn!(
                namespace = self.namespace,
                "Failed to persist durable state; keeping in-memory copy: {err}"
            );
        }
    }
}

/// Last successfully resolved chapter bundles and chapter lists.
pub struct ChapterStateStore {
    bundles: DurableMap<CachedChapterBundle>,
    lists: DurableMap<CachedChapterListBundle>,
}

impl ChapterStateStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        let store = Self {
            bundles: DurableMap::open(CHAPTER_BUNDLES, Arc::clone(&backend)),
            lists: DurableMap::open(CHAPTER_LISTS, backend),
        };
        info!(
            bundles = store.bundles.len(),
            lists = store.lists.len(),
            "Opened chapter state store"
        );
        store
    }

    pub fn open_dir(dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileBackend::new(dir)))
    }

    pub fn bundle(&self, book_id: &str, chapter_id: &str) -> Option<CachedChapterBundle> {
        self.bundles.get(&bundle_key(book_id, chapter_id))
    }

    pub fn put_bundle(&self, bundle: CachedChapterBundle) {
        let key = bundle_key(&bundle.book_id, &bundle.chapter_id);
        self.bundles.put(&key, bundle);
    }

    pub fn remove_bundle(&self, book_id: &str, chapter_id: &str) -> Option<CachedChapterBundle> {
        self.bundles.remove(&bundle_key(book_id, chapter_id))
    }

    pub fn chapter_list(&self, book_id: &str) -> Option<CachedChapterListBundle> {
        self.lists.get(book_id)
    }

    pub fn put_chapter_list(&self, list: CachedChapterListBundle) {
        let key = list.book_id.clone();
        self.lists.put(&key, list);
    }

    pub fn remove_chapter_list(&self, book_id: &str) -> Option<CachedChapterListBundle> {
        self.lists.remove(book_id)
    }

    pub fn bundles(&self) -> &DurableMap<CachedChapterBundle> {
        &self.bundles
    }

    pub fn lists(&self) -> &DurableMap<CachedChapterListBundle> {
        &self.lists
    }

    pub fn clear_all(&self) {
        self.bundles.clear_all();
        self.lists.clear_all();
    }
}

pub fn bundle_key(book_id: &str, chapter_id: &str) -> String {
    format!("{book_id}#{chapter_id}")
}

pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(book: &str, chapter: &str) -> CachedChapterBundle {
        CachedChapterBundle {
            book_id: book.to_string(),
            chapter_id: chapter.to_string(),
            title: format!("Chapter {chapter}"),
            chapter_number: Some(1),
            remote_audio_ref: "http://media.test/a.mp3".to_string(),
            remote_subtitle_ref: None,
            local_audio_path: PathBuf::from("/tmp/a.mp3"),
            local_subtitle_path: None,
            subtitle_text: Some("1\n00:00:00,000 --> 00:00:01,000\nHi.".to_string()),
            resolved_at: 1_700_000_000,
        }
    }

    #[test]
    fn bundle_key_joins_ids() {
        assert_eq!(bundle_key("7", "3"), "7#3");
    }

    #[test]
    fn put_overwrites_and_persists_immediately() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ChapterStateStore::new(backend.clone());
        store.put_bundle(bundle("7", "3"));
        let mut updated = bundle("7", "3");
        updated.title = "Renamed".to_string();
        store.put_bundle(updated);

        assert_eq!(store.bundle("7", "3").map(|b| b.title).as_deref(), Some("Renamed"));
        let raw = backend.raw(CHAPTER_BUNDLES).expect("persisted");
        assert!(raw.contains("Renamed"));
        assert!(backend.raw(CHAPTER_LISTS).is_none());
    }

    #[test]
    fn state_survives_reopen() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let store = ChapterStateStore::new(backend.clone());
            store.put_bundle(bundle("7", "3"));
            store.put_chapter_list(CachedChapterListBundle {
                book_id: "7".to_string(),
                chapters: Vec::new(),
                resolved_at: 5,
            });
        }
        let reopened = ChapterStateStore::new(backend);
        assert_eq!(reopened.bundle("7", "3"), Some(bundle("7", "3")));
        assert_eq!(reopened.chapter_list("7").map(|l| l.resolved_at), Some(5));
    }

    #[test]
    fn namespaces_are_independent() {
        let store = ChapterStateStore::new(Arc::new(MemoryBackend::new()));
        store.put_bundle(bundle("7", "3"));
        store.put_chapter_list(CachedChapterListBundle {
            book_id: "7".to_string(),
            chapters: Vec::new(),
            resolved_at: 1,
        });
        store.remove_bundle("7", "3");
        assert!(store.bundle("7", "3").is_none());
        assert!(store.chapter_list("7").is_some());
    }

    #[test]
    fn persist_failure_is_swallowed_and_memory_stays_authoritative() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ChapterStateStore::new(backend.clone());
        backend.set_fail_writes(true);
        store.put_bundle(bundle("1", "2"));
        assert!(store.bundle("1", "2").is_some());
        assert!(backend.raw(CHAPTER_BUNDLES).is_none());
    }

    #[test]
    fn clear_all_empties_both_namespaces() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ChapterStateStore::new(backend.clone());
        store.put_bundle(bundle("1", "2"));
        store.put_chapter_list(CachedChapterListBundle {
            book_id: "1".to_string(),
            chapters: Vec::new(),
            resolved_at: 1,
        });
        store.clear_all();
        assert!(store.bundles().is_empty());
        assert!(store.lists().is_empty());
        assert_eq!(backend.raw(CHAPTER_BUNDLES).as_deref(), Some("{}"));
    }

    #[test]
    fn corrupt_namespace_starts_empty() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .save(CHAPTER_BUNDLES, "{ not json")
            .expect("seed corrupt data");
        let store = ChapterStateStore::new(backend);
        assert!(store.bundles().is_empty());
    }

    #[test]
    fn file_backend_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = ChapterStateStore::open_dir(dir.path());
            store.put_bundle(bundle("b", "c"));
        }
        assert!(dir.path().join("chapter-bundles.json").is_file());
        let store = ChapterStateStore::open_dir(dir.path());
        assert_eq!(store.bundle("b", "c"), Some(bundle("b", "c")));
        assert_eq!(store.bundles().keys(), vec!["b#c".to_string()]);
    }

    #[test]
    fn concurrent_writers_never_tear_the_namespace() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(ChapterStateStore::new(backend.clone()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for j in 0..20 {
                        store.put_bundle(bundle(&i.to_string(), &j.to_string()));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer");
        }
        let raw = backend.raw(CHAPTER_BUNDLES).expect("persisted");
        let parsed: BTreeMap<String, CachedChapterBundle> =
            serde_json::from_str(&raw).expect("valid json");
        assert_eq!(parsed.len(), 160);
    }
}
