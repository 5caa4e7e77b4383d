//! Topic-keyed, TTL-expiring cache for synthesized research.
//!
//! Each entry records its own creation time and TTL alongside the payload,
//! so expiry never depends on storage-layer metadata such as file mtimes.
//! Entries that fail to decode are logged and treated as misses.
//!
//! The backing store is pluggable through [`CacheStore`]: [`FileStore`]
//! keeps one JSON file per topic hash, [`MemoryStore`] keeps bytes in a map.

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::persistence;
use crate::types::{SynthesizedResearch, duration_ms};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Bumped whenever the on-disk entry layout changes.
const CACHE_FORMAT_VERSION: u32 = 2;

/// Raw key/value storage behind the research cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Load the bytes stored under `key`, or `None` if absent.
    async fn load(&self, key: &str) -> io::Result<Option<Vec<u8>>>;

    /// Replace the bytes stored under `key`. Must be atomic with respect to `load`.
    async fn store(&self, key: &str, bytes: Vec<u8>) -> io::Result<()>;
}

/// One JSON file per key inside a directory fixed at construction.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl CacheStore for FileStore {
    async fn load(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        tokio::task::spawn_blocking(move || persistence::read_if_exists(&path))
            .await
            .map_err(io::Error::other)?
    }

    async fn store(&self, key: &str, bytes: Vec<u8>) -> io::Result<()> {
        let path = self.path_for(key);
        tokio::task::spawn_blocking(move || persistence::atomic_write(&path, &bytes))
            .await
            .map_err(io::Error::other)?
    }
}

/// In-process store, mainly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn load(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn store(&self, key: &str, bytes: Vec<u8>) -> io::Result<()> {
        self.entries.write().await.insert(key.to_string(), bytes);
        Ok(())
    }
}

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Persisted record: payload plus explicit expiry metadata.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    format_version: u32,
    key: String,
    topic: String,
    created_at: DateTime<Utc>,
    ttl_ms: u64,
    payload: SynthesizedResearch,
}

impl CacheEntry {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        // An entry stamped in the future (clock skew) counts as age zero.
        let age = (now - self.created_at).to_std().unwrap_or(Duration::ZERO);
        age < Duration::from_millis(self.ttl_ms)
    }
}

/// Stable cache key for a topic: lowercase hex SHA-256 of its UTF-8 bytes.
pub fn cache_key(topic: &str) -> String {
    format!("{:x}", Sha256::digest(topic.as_bytes()))
}

/// Research result cache keyed by topic.
pub struct ResearchCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResearchCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            clock: Arc::new(SystemClock),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// File-backed cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self, CacheError> {
        let store = FileStore::new(dir).map_err(|e| CacheError::Store {
            message: e.to_string(),
        })?;
        Ok(Self::new(Arc::new(store), ttl))
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryStore::new()), ttl)
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        Self::open(config.resolve_dir(), config.ttl())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached research for `topic` if present and younger than its TTL.
    ///
    /// Undecodable entries are misses; only store I/O failures are errors.
    pub async fn get(&self, topic: &str) -> Result<Option<SynthesizedResearch>, CacheError> {
        let key = cache_key(topic);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let Some(bytes) = self.store.load(&key).await.map_err(store_error)? else {
            debug!(topic, "Research cache miss");
            return Ok(None);
        };

        let entry = match decode_entry(&key, &bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(topic, error = %e, "Ignoring unreadable research cache entry");
                return Ok(None);
            }
        };

        if !entry.is_fresh(self.clock.now()) {
            debug!(topic, created_at = %entry.created_at, "Research cache entry expired");
            return Ok(None);
        }

        debug!(topic, "Research cache hit");
        Ok(Some(entry.payload))
    }

    /// Store `payload` for `topic` with the cache's default TTL.
    pub async fn set(&self, topic: &str, payload: &SynthesizedResearch) -> Result<(), CacheError> {
        self.set_with_ttl(topic, payload, self.ttl).await
    }

    /// Store `payload` for `topic`, expiring `ttl` after now.
    pub async fn set_with_ttl(
        &self,
        topic: &str,
        payload: &SynthesizedResearch,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = cache_key(topic);
        let entry = CacheEntry {
            format_version: CACHE_FORMAT_VERSION,
            key: key.clone(),
            topic: topic.to_string(),
            created_at: self.clock.now(),
            ttl_ms: duration_ms(ttl),
            payload: payload.clone(),
        };
        let bytes = serde_json::to_vec(&entry).map_err(|e| CacheError::Store {
            message: format!("failed to encode cache entry: {e}"),
        })?;

        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;
        self.store.store(&key, bytes).await.map_err(store_error)?;
        debug!(topic, ttl_ms = duration_ms(ttl), "Research cache entry written");
        Ok(())
    }

    /// Per-key async lock; idle locks are pruned as new keys arrive.
    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(key) {
            return lock.clone();
        }
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(key.to_string(), lock.clone());
        lock
    }
}

fn decode_entry(key: &str, bytes: &[u8]) -> Result<CacheEntry, CacheError> {
    let corrupt = |reason: String| CacheError::Corrupt {
        key: key.to_string(),
        reason,
    };
    let entry: CacheEntry = serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
    if entry.format_version != CACHE_FORMAT_VERSION {
        return Err(corrupt(format!(
            "format version {} (expected {CACHE_FORMAT_VERSION})",
            entry.format_version
        )));
    }
    if entry.key != key {
        return Err(corrupt(format!("entry belongs to key {}", entry.key)));
    }
    Ok(entry)
}

fn store_error(e: io::Error) -> CacheError {
    CacheError::Store {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SourceRef, SubtopicSynthesis};
    use chrono::TimeZone;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn sample_research(topic: &str) -> SynthesizedResearch {
        SynthesizedResearch {
            topic: topic.to_string(),
            executive_summary: "Summary".into(),
            subtopic_syntheses: vec![
                SubtopicSynthesis::synthesized("History", "Narrative", vec!["https://a".into()]),
                SubtopicSynthesis::failed("Algorithms", "timed out"),
            ],
            key_findings: vec!["Finding one".into()],
            sources: vec![SourceRef {
                title: "A".into(),
                url: "https://a".into(),
            }],
            warnings: vec![],
            relevant_content: vec![],
            generated_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn test_cache_key_is_stable_sha256() {
        assert_eq!(
            cache_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(cache_key("Quantum Computing"), cache_key("Quantum Computing"));
        assert_ne!(cache_key("Quantum Computing"), cache_key("quantum computing"));
    }

    #[tokio::test]
    async fn test_roundtrip_before_ttl() {
        let clock = manual_clock();
        let cache = ResearchCache::in_memory(DAY).with_clock(clock.clone());
        let payload = sample_research("Rust");

        cache.set("Rust", &payload).await.unwrap();
        clock.advance(DAY - Duration::from_secs(1));

        assert_eq!(cache.get("Rust").await.unwrap(), Some(payload));
    }

    #[tokio::test]
    async fn test_expired_after_ttl() {
        let clock = manual_clock();
        let cache = ResearchCache::in_memory(DAY).with_clock(clock.clone());

        cache.set("Rust", &sample_research("Rust")).await.unwrap();
        clock.advance(DAY);

        assert_eq!(cache.get("Rust").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_per_entry_ttl() {
        let clock = manual_clock();
        let cache = ResearchCache::in_memory(DAY).with_clock(clock.clone());

        cache
            .set_with_ttl("Rust", &sample_research("Rust"), Duration::from_secs(60))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(61));

        assert_eq!(cache.get("Rust").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sub_second_ttl() {
        let clock = manual_clock();
        let cache = ResearchCache::in_memory(DAY).with_clock(clock.clone());
        let payload = sample_research("Rust");

        cache
            .set_with_ttl("Rust", &payload, Duration::from_millis(750))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(400));
        assert_eq!(cache.get("Rust").await.unwrap(), Some(payload));

        clock.advance(Duration::from_millis(350));
        assert_eq!(cache.get("Rust").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_topic_is_miss() {
        let cache = ResearchCache::in_memory(DAY);
        assert_eq!(cache.get("never stored").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResearchCache::new(store.clone(), DAY);

        store
            .store(&cache_key("Rust"), b"\x80not json at all".to_vec())
            .await
            .unwrap();

        assert_eq!(cache.get("Rust").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncated_file_is_miss() {
        let dir = TempDir::new().unwrap();
        let cache = ResearchCache::open(dir.path(), DAY).unwrap();
        cache.set("Rust", &sample_research("Rust")).await.unwrap();

        let path = dir.path().join(format!("{}.json", cache_key("Rust")));
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert_eq!(cache.get("Rust").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResearchCache::new(store.clone(), DAY);
        cache.set("Rust", &sample_research("Rust")).await.unwrap();

        let key = cache_key("Rust");
        let bytes = store.load(&key).await.unwrap().unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["format_version"] = serde_json::json!(99);
        store
            .store(&key, serde_json::to_vec(&value).unwrap())
            .await
            .unwrap();

        assert_eq!(cache.get("Rust").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let payload = sample_research("Rust");

        {
            let cache = ResearchCache::open(dir.path(), DAY).unwrap();
            cache.set("Rust", &payload).await.unwrap();
        }

        let reopened = ResearchCache::open(dir.path(), DAY).unwrap();
        assert_eq!(reopened.get("Rust").await.unwrap(), Some(payload));
    }

    #[tokio::test]
    async fn test_touching_file_does_not_extend_ttl() {
        let dir = TempDir::new().unwrap();
        let clock = manual_clock();
        let cache = ResearchCache::open(dir.path(), DAY)
            .unwrap()
            .with_clock(clock.clone());
        cache.set("Rust", &sample_research("Rust")).await.unwrap();

        // Rewrite the same bytes, which refreshes the file's mtime.
        let path = dir.path().join(format!("{}.json", cache_key("Rust")));
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, bytes).unwrap();
        clock.advance(DAY + Duration::from_secs(1));

        assert_eq!(cache.get("Rust").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_topic_never_observes_partial_entry() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ResearchCache::open(dir.path(), DAY).unwrap());
        let payload = sample_research("Rust");

        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            let payload = payload.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    cache.set("Rust", &payload).await.unwrap();
                    None
                } else {
                    cache.get("Rust").await.unwrap()
                }
            }));
        }

        for handle in handles {
            if let Some(read) = handle.await.unwrap() {
                assert_eq!(read, payload);
            }
        }
        assert_eq!(cache.get("Rust").await.unwrap(), Some(payload));
    }

    #[tokio::test]
    async fn test_unreachable_store_propagates() {
        let dir = TempDir::new().unwrap();
        let cache = ResearchCache::open(dir.path(), DAY).unwrap();
        // Replace the entry path with a directory so reads fail with an I/O error.
        std::fs::create_dir_all(dir.path().join(format!("{}.json", cache_key("Rust")))).unwrap();

        let result = cache.get("Rust").await;
        assert!(matches!(result, Err(CacheError::Store { .. })));
    }
}
