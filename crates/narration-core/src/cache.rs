//! Local cache for remote audio and subtitle payloads.
//!
//! Each remote URL maps to one deterministic slot under the cache root: the
//! payload lives at `<root>/<slot>` and the server's freshness token (ETag),
//! when one was offered, at `<root>/<slot>.etag`. A resolve probes the remote
//! with HEAD and only downloads when the stored copy cannot be shown to be
//! current.

use crate::error::{Error, Result};
use crate::remote::RemoteTransport;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const TOKEN_SUFFIX: &str = "etag";
const MAX_SLOT_LEN: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResourceEntry {
    pub remote_key: String,
    pub local_path: PathBuf,
    pub freshness_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The local copy was kept without downloading.
    Reused,
    Downloaded,
}

#[derive(Debug, Clone)]
pub struct ResolvedResource {
    pub entry: CachedResourceEntry,
    pub outcome: ResolveOutcome,
}

impl ResolvedResource {
    pub fn path(&self) -> &Path {
        &self.entry.local_path
    }
}

pub struct ResourceCache {
    root: PathBuf,
    transport: Arc<dyn RemoteTransport>,
    slot_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ResourceCache {
    pub fn new(root: impl Into<PathBuf>, transport: Arc<dyn RemoteTransport>) -> Self {
        Self {
            root: root.into(),
            transport,
            slot_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot_path(&self, url: &str) -> PathBuf {
        self.root.join(slot_name(url))
    }

    /// Current local state for `url`, without touching the network.
    pub fn entry(&self, url: &str) -> Option<CachedResourceEntry> {
        let local_path = self.slot_path(url);
        if !local_path.is_file() {
            return None;
        }
        Some(CachedResourceEntry {
            remote_key: slot_name(url),
            freshness_token: read_token(&token_path(&local_path)),
            local_path,
        })
    }

    /// Resolve `url` to a local file, downloading only when needed.
    ///
    /// A local copy is reused when the probe returns the stored token, or
    /// when the probe yields no token at all (the server does not support
    /// validation, or the probe failed).
    pub fn resolve(&self, url: &str) -> Result<ResolvedResource> {
        let key = slot_name(url);
        self.with_slot(&key, || self.resolve_slot(url, key.clone()))
    }

    fn resolve_slot(&self, url: &str, key: String) -> Result<ResolvedResource> {
        let payload_path = self.root.join(&key);
        let sidecar = token_path(&payload_path);
        let remote_token = self.probe(url);
        let stored_token = read_token(&sidecar);

        if payload_path.is_file() {
            let reuse = match (&remote_token, &stored_token) {
                (None, _) => true,
                (Some(remote), Some(stored)) => remote == stored,
                (Some(_), None) => false,
            };
            if reuse {
                debug!(
                    %url,
                    path = %payload_path.display(),
                    token = ?stored_token,
                    "Reusing cached resource"
                );
                return Ok(ResolvedResource {
                    entry: CachedResourceEntry {
                        remote_key: key,
                        local_path: payload_path,
                        freshness_token: stored_token,
                    },
                    outcome: ResolveOutcome::Reused,
                });
            }
        }

        let response = self.transport.get(url)?;
        if !response.is_success() {
            if response.is_gone() {
                info!(%url, status = response.status, "Remote resource is gone; evicting local copy");
                if let Err(err) = remove_slot(&payload_path) {
                    warn!(%url, "Failed to evict cached resource: {err}");
                }
            }
            return Err(Error::RemoteUnavailable {
                url: url.to_string(),
                status: Some(response.status),
            });
        }

        let new_token = response.etag.or(remote_token);
        match commit_slot(&payload_path, &response.body, new_token.as_deref()) {
            Ok(()) => {
                info!(
                    %url,
                    path = %payload_path.display(),
                    bytes = response.body.len(),
                    token = ?new_token,
                    "Downloaded resource"
                );
                Ok(ResolvedResource {
                    entry: CachedResourceEntry {
                        remote_key: key,
                        local_path: payload_path,
                        freshness_token: new_token,
                    },
                    outcome: ResolveOutcome::Downloaded,
                })
            }
            Err(err) if payload_path.is_file() => {
                warn!(%url, "Keeping stale cached copy after persist failure: {err}");
                Ok(ResolvedResource {
                    entry: CachedResourceEntry {
                        remote_key: key,
                        freshness_token: read_token(&sidecar),
                        local_path: payload_path,
                    },
                    outcome: ResolveOutcome::Reused,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Resolve `url` and read the payload as UTF-8 text.
    pub fn resolve_text(&self, url: &str) -> Result<(ResolvedResource, String)> {
        let resolved = self.resolve(url)?;
        let text = read_text(resolved.path())?;
        Ok((resolved, text))
    }

    /// Drop the payload and its token for `url`.
    pub fn evict(&self, url: &str) -> Result<()> {
        let key = slot_name(url);
        let path = self.root.join(&key);
        self.with_slot(&key, || remove_slot(&path))
            .map_err(|err| Error::persist(path, err))
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {
                info!(root = %self.root.display(), "Cleared resource cache");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::persist(self.root.clone(), err)),
        }
    }

    fn probe(&self, url: &str) -> Option<String> {
        match self.transport.head(url) {
            Ok(probe) if probe.is_success() => probe.etag,
            Ok(probe) => {
                debug!(%url, status = probe.status, "Probe returned non-success; freshness unknown");
                None
            }
            Err(err) => {
                warn!(%url, "Freshness probe failed; treating freshness as unknown: {err}");
                None
            }
        }
    }

    /// Run `f` holding the slot's lock. The lock entry is dropped again once
    /// no other caller holds or waits on it, so the map only tracks slots
    /// that are in use.
    fn with_slot<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.lock_table();
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        let result = {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f()
        };
        let mut locks = self.lock_table();
        drop(lock);
        // Callers release their handle under the table lock, so a lone
        // table reference means nobody holds or waits on this slot.
        if locks
            .get(key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(key);
        }
        result
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.slot_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Deterministic slot name for a remote identifier.
///
/// The identifier is percent-decoded, then every character that is not an
/// ASCII letter or digit becomes `_`. Case is preserved. Very long names are
/// truncated and suffixed with a hash of the full identifier.
pub fn slot_name(url: &str) -> String {
    let decoded = percent_decode(url);
    let mut name: String = decoded
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.len() > MAX_SLOT_LEN {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        name.truncate(MAX_SLOT_LEN);
        name.push('_');
        name.push_str(&hash[..16]);
    }
    name
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' && idx + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[idx + 1..idx + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(byte) = hex {
                out.push(byte);
                idx += 3;
                continue;
            }
        }
        out.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub(crate) fn token_path(payload: &Path) -> PathBuf {
    let mut name = payload
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(TOKEN_SUFFIX);
    payload.with_file_name(name)
}

fn read_token(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

pub(crate) fn read_text(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|err| Error::LocalRead {
        path: path.to_path_buf(),
        source: err,
    })?;
    String::from_utf8(bytes).map_err(|err| Error::DecodeFailure(err.to_string()))
}

/// Replace payload and token so a reader never sees a torn payload.
///
/// The stale token goes first: an interruption then leaves a payload with no
/// token, which the next resolve treats as needing validation.
fn commit_slot(payload: &Path, body: &[u8], token: Option<&str>) -> Result<()> {
    let sidecar = token_path(payload);
    remove_if_exists(&sidecar).map_err(|err| Error::persist(&sidecar, err))?;
    write_atomic(payload, body).map_err(|err| Error::persist(payload, err))?;
    if let Some(token) = token {
        write_atomic(&sidecar, token.as_bytes()).map_err(|err| Error::persist(&sidecar, err))?;
    }
    Ok(())
}

fn remove_slot(payload: &Path) -> io::Result<()> {
    remove_if_exists(&token_path(payload))?;
    remove_if_exists(payload)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Write to a sibling temp file, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = unique_temp_path(path);
    if let Err(err) = fs::write(&temp_path, contents) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    Ok(())
}

fn unique_temp_path(path: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nonce = SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut temp_name = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("resource")
        .to_string();
    temp_name.push_str(&format!(".tmp-{}-{nonce}", ts_nanos));
    path.with_file_name(temp_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::{FakeTransport, Route};
    use std::thread;

    const URL: &str = "http://media.test/books/1/Chapter%201.mp3";

    fn cache_with(transport: &Arc<FakeTransport>) -> (tempfile::TempDir, ResourceCache) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResourceCache::new(dir.path().join("resources"), transport.clone());
        (dir, cache)
    }

    #[test]
    fn slot_names_are_decoded_and_sanitized() {
        assert_eq!(slot_name(URL), "http___media_test_books_1_Chapter_1_mp3");
        assert_eq!(slot_name("http://a/B.mp3"), "http___a_B_mp3");
        assert_ne!(slot_name("http://a/B.mp3"), slot_name("http://a/b.mp3"));
        assert_eq!(slot_name("http://a/100%"), "http___a_100_");
        assert_eq!(slot_name(URL), slot_name(URL));
    }

    #[test]
    fn long_slot_names_keep_a_distinguishing_hash() {
        let base = format!("http://a/{}", "x".repeat(200));
        let one = slot_name(&format!("{base}/one"));
        let two = slot_name(&format!("{base}/two"));
        assert_ne!(one, two);
        assert_eq!(one.len(), MAX_SLOT_LEN + 17);
    }

    #[test]
    fn matching_token_skips_second_download() {
        let transport = Arc::new(FakeTransport::new());
        transport.serve(URL, Some("\"v1\""), b"audio-v1");
        let (_dir, cache) = cache_with(&transport);

        let first = cache.resolve(URL).expect("first resolve");
        assert_eq!(first.outcome, ResolveOutcome::Downloaded);
        assert_eq!(first.entry.freshness_token.as_deref(), Some("\"v1\""));

        let second = cache.resolve(URL).expect("second resolve");
        assert_eq!(second.outcome, ResolveOutcome::Reused);
        assert_eq!(transport.get_calls(URL), 1);
        assert_eq!(transport.head_calls(URL), 2);
        assert_eq!(fs::read(second.path()).expect("payload"), b"audio-v1");
    }

    #[test]
    fn changed_token_downloads_once_and_updates_token() {
        let transport = Arc::new(FakeTransport::new());
        transport.serve(URL, Some("v1"), b"old");
        let (_dir, cache) = cache_with(&transport);
        cache.resolve(URL).expect("first resolve");

        transport.serve(URL, Some("v2"), b"new");
        let second = cache.resolve(URL).expect("second resolve");
        assert_eq!(second.outcome, ResolveOutcome::Downloaded);
        assert_eq!(transport.get_calls(URL), 2);

        let third = cache.resolve(URL).expect("third resolve");
        assert_eq!(third.outcome, ResolveOutcome::Reused);
        assert_eq!(transport.get_calls(URL), 2);
        assert_eq!(
            cache.entry(URL).and_then(|e| e.freshness_token).as_deref(),
            Some("v2")
        );
        assert_eq!(fs::read(third.path()).expect("payload"), b"new");
    }

    #[test]
    fn missing_remote_token_keeps_local_copy() {
        let transport = Arc::new(FakeTransport::new());
        transport.serve(URL, Some("v1"), b"old");
        let (_dir, cache) = cache_with(&transport);
        cache.resolve(URL).expect("first resolve");

        transport.serve(URL, None, b"new");
        let second = cache.resolve(URL).expect("second resolve");
        assert_eq!(second.outcome, ResolveOutcome::Reused);
        assert_eq!(transport.get_calls(URL), 1);
        assert_eq!(fs::read(second.path()).expect("payload"), b"old");
    }

    #[test]
    fn failed_probe_is_not_fatal() {
        let transport = Arc::new(FakeTransport::new());
        transport.serve(URL, Some("v1"), b"body");
        transport.set_head(URL, Route::Down);
        let (_dir, cache) = cache_with(&transport);

        let first = cache.resolve(URL).expect("download despite probe failure");
        assert_eq!(first.outcome, ResolveOutcome::Downloaded);
        assert_eq!(first.entry.freshness_token.as_deref(), Some("v1"));

        let second = cache.resolve(URL).expect("reuse despite probe failure");
        assert_eq!(second.outcome, ResolveOutcome::Reused);
        assert_eq!(transport.get_calls(URL), 1);
    }

    #[test]
    fn token_is_cleared_when_remote_offers_none() {
        let transport = Arc::new(FakeTransport::new());
        let (_dir, cache) = cache_with(&transport);
        let payload = cache.slot_path(URL);
        fs::create_dir_all(cache.root()).expect("mkdir");
        fs::write(token_path(&payload), "stale").expect("orphan token");

        transport.serve(URL, None, b"fresh");
        let resolved = cache.resolve(URL).expect("resolve");
        assert_eq!(resolved.outcome, ResolveOutcome::Downloaded);
        assert_eq!(resolved.entry.freshness_token, None);
        assert!(!token_path(&payload).exists());
    }

    #[test]
    fn non_success_download_is_remote_unavailable_and_keeps_copy() {
        let transport = Arc::new(FakeTransport::new());
        transport.serve(URL, Some("v1"), b"old");
        let (_dir, cache) = cache_with(&transport);
        cache.resolve(URL).expect("first resolve");

        transport.set_head(
            URL,
            Route::Ok {
                status: 200,
                etag: Some("v2".to_string()),
                body: Vec::new(),
            },
        );
        transport.set_get(
            URL,
            Route::Ok {
                status: 500,
                etag: None,
                body: Vec::new(),
            },
        );
        let err = cache.resolve(URL).expect_err("500");
        assert!(matches!(err, Error::RemoteUnavailable { status: Some(500), .. }));
        assert_eq!(fs::read(cache.slot_path(URL)).expect("payload"), b"old");
    }

    #[test]
    fn gone_resource_is_evicted() {
        let transport = Arc::new(FakeTransport::new());
        transport.serve(URL, Some("v1"), b"old");
        let (_dir, cache) = cache_with(&transport);
        cache.resolve(URL).expect("first resolve");

        transport.set_head(
            URL,
            Route::Ok {
                status: 200,
                etag: Some("v2".to_string()),
                body: Vec::new(),
            },
        );
        transport.set_get(
            URL,
            Route::Ok {
                status: 410,
                etag: None,
                body: Vec::new(),
            },
        );
        assert!(cache.resolve(URL).is_err());
        assert!(cache.entry(URL).is_none());
        assert!(!token_path(&cache.slot_path(URL)).exists());
    }

    #[test]
    fn transport_failure_without_local_copy_propagates() {
        let transport = Arc::new(FakeTransport::new());
        transport.take_down(URL);
        let (_dir, cache) = cache_with(&transport);
        let err = cache.resolve(URL).expect_err("offline");
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[test]
    fn resolve_text_rejects_invalid_utf8() {
        let transport = Arc::new(FakeTransport::new());
        transport.serve(URL, None, &[0xff, 0xfe, 0xfd]);
        let (_dir, cache) = cache_with(&transport);
        let err = cache.resolve_text(URL).expect_err("binary");
        assert!(matches!(err, Error::DecodeFailure(_)));
    }

    #[test]
    fn concurrent_resolves_leave_one_complete_payload() {
        let transport = Arc::new(FakeTransport::new());
        let body = vec![7_u8; 256 * 1024];
        transport.serve(URL, Some("v1"), &body);
        let (_dir, cache) = cache_with(&transport);
        let cache = Arc::new(cache);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.resolve(URL).map(|r| r.outcome))
            })
            .collect();
        let outcomes: Vec<ResolveOutcome> = handles
            .into_iter()
            .map(|h| h.join().expect("thread").expect("resolve"))
            .collect();

        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == ResolveOutcome::Downloaded)
                .count(),
            1
        );
        assert_eq!(fs::read(cache.slot_path(URL)).expect("payload"), body);
        let leftovers: Vec<_> = fs::read_dir(cache.root())
            .expect("read dir")
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(cache.lock_table().is_empty());
    }

    #[test]
    fn slot_locks_do_not_accumulate_per_url() {
        let transport = Arc::new(FakeTransport::new());
        let (_dir, cache) = cache_with(&transport);
        for idx in 0..16 {
            let url = format!("http://media.test/chapter-{idx}.mp3");
            transport.serve(&url, Some("v1"), b"x");
            cache.resolve(&url).expect("resolve");
            cache.evict(&url).expect("evict");
        }
        let _ = cache.resolve("http://media.test/missing.mp3");
        assert!(cache.lock_table().is_empty());
    }

    #[test]
    fn evict_and_clear_remove_local_state() {
        let transport = Arc::new(FakeTransport::new());
        transport.serve(URL, Some("v1"), b"x");
        let (_dir, cache) = cache_with(&transport);
        cache.resolve(URL).expect("resolve");
        cache.evict(URL).expect("evict");
        assert!(cache.entry(URL).is_none());

        cache.resolve(URL).expect("resolve again");
        cache.clear().expect("clear");
        assert!(!cache.root().exists());
        cache.clear().expect("clearing twice is fine");
    }
}
