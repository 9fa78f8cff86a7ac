//! TTL-scoped, disk-backed cache for expensive orchestration lookups.
//!
//! Layout under the cache root:
//!
//! ```text
//! index.json                      key -> {file, timestamp, lastAccessed, type, size, hits}
//! <key>-<timestamp>.json          one payload per live entry
//! ```
//!
//! Keys are `<type>-<sha256(canonical input)[..16]>`. Expiry is lazy: an entry
//! older than its type's TTL is evicted when it is read, or by [`OrchestrationCache::cleanup`].
//! Disk faults are counted in [`CacheStats::errors`] and behave like misses.
//! A root that cannot be created leaves the cache disabled: every read misses
//! and writes are skipped, so callers always fall through to computing.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::Result;

pub const INDEX_FILE: &str = "index.json";

/// Live workflow state
pub const WORKFLOW_STATE: &str = "workflow-state";
pub const PARSED_WORKFLOW: &str = "parsed-workflow";
pub const AGENT_ASSIGNMENT: &str = "agent-assignment";
pub const TASK_DECOMPOSITION: &str = "task-decomposition";
pub const WORK_ITEM_PATH: &str = "work-item-path";
pub const DOCUMENT: &str = "document";

/// Built-in TTLs in seconds; config overrides are merged on top
pub const DEFAULT_TTLS: &[(&str, u64)] = &[
    (WORKFLOW_STATE, 300),
    (PARSED_WORKFLOW, 3600),
    (AGENT_ASSIGNMENT, 3600),
    (TASK_DECOMPOSITION, 3600),
    (WORK_ITEM_PATH, 86400),
    (DOCUMENT, 86400),
];

// ============================================================================
// Clock
// ============================================================================

/// Time source for expiry decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let step = ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
        if let Ok(mut now) = self.now.lock() {
            *now += step;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|e| *e.into_inner())
    }
}

// ============================================================================
// Index and statistics
// ============================================================================

/// One `index.json` record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    /// Payload file name relative to the cache root
    pub file: String,
    /// Creation time, unix millis
    pub timestamp: i64,
    /// Last read time, unix millis
    pub last_accessed: i64,
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload size in bytes
    pub size: u64,
    pub hits: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub errors: u64,
    pub entries: usize,
    pub total_size_bytes: u64,
    /// hits / (hits + misses), 0 when nothing was read
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Cache
// ============================================================================

pub struct OrchestrationCache {
    root: PathBuf,
    ttls: HashMap<String, Duration>,
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
    // Held across payload IO so in-process writers never interleave index saves
    index: Mutex<BTreeMap<String, IndexEntry>>,
    counters: Counters,
    disabled: bool,
}

impl OrchestrationCache {
    pub async fn open(config: &CacheConfig) -> Self {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let root = config.resolve_dir();
        let counters = Counters::default();

        let disabled = match tokio::fs::create_dir_all(&root).await {
            Ok(()) => false,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Cache directory unusable, caching disabled");
                Counters::bump(&counters.errors);
                true
            }
        };

        let mut ttls: HashMap<String, Duration> = DEFAULT_TTLS
            .iter()
            .map(|(kind, secs)| (kind.to_string(), Duration::from_secs(*secs)))
            .collect();
        for (kind, secs) in &config.ttl_secs {
            ttls.insert(kind.clone(), Duration::from_secs(*secs));
        }

        let loaded = if disabled {
            Ok(BTreeMap::new())
        } else {
            load_index(&root).await
        };
        let index = match loaded {
            Ok(index) => index,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Cache index unreadable, starting empty");
                Counters::bump(&counters.errors);
                BTreeMap::new()
            }
        };

        debug!(root = %root.display(), entries = index.len(), "Opened orchestration cache");

        Self {
            root,
            ttls,
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            clock,
            index: Mutex::new(index),
            counters,
            disabled,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// False when the root could not be created at open
    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    pub fn ttl(&self, kind: &str) -> Duration {
        self.ttls.get(kind).copied().unwrap_or(self.default_ttl)
    }

    /// Cached value for `(kind, input)`, or `None` on miss, expiry, or fault
    pub async fn get<I, T>(&self, kind: &str, input: &I) -> Option<T>
    where
        I: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let Some(key) = self.key_for(kind, input) else {
            Counters::bump(&self.counters.misses);
            return None;
        };

        let mut index = self.index.lock().await;
        let Some(entry) = index.get(&key).cloned() else {
            Counters::bump(&self.counters.misses);
            return None;
        };

        let now = self.clock.now().timestamp_millis();
        if self.is_expired(&entry, now) {
            debug!(key = %key, "Cache entry expired");
            self.remove_payload(&entry.file).await;
            index.remove(&key);
            self.save_index(&index).await;
            Counters::bump(&self.counters.evictions);
            Counters::bump(&self.counters.misses);
            return None;
        }

        let path = self.root.join(&entry.file);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::NotFound {
                    warn!(key = %key, "Cache payload missing, dropping stale index entry");
                } else {
                    warn!(key = %key, error = %e, "Failed to read cache payload");
                    Counters::bump(&self.counters.errors);
                }
                index.remove(&key);
                self.save_index(&index).await;
                Counters::bump(&self.counters.misses);
                return None;
            }
        };

        let value = match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache payload did not deserialize, dropping entry");
                self.remove_payload(&entry.file).await;
                index.remove(&key);
                self.save_index(&index).await;
                Counters::bump(&self.counters.errors);
                Counters::bump(&self.counters.misses);
                return None;
            }
        };

        if let Some(live) = index.get_mut(&key) {
            live.last_accessed = now;
            live.hits += 1;
        }
        self.save_index(&index).await;
        Counters::bump(&self.counters.hits);

        Some(value)
    }

    /// Store `value` and hand it back; write faults are counted, never raised
    pub async fn set<I, T>(&self, kind: &str, input: &I, value: T) -> T
    where
        I: Serialize + ?Sized,
        T: Serialize,
    {
        if self.disabled {
            return value;
        }
        let Some(key) = self.key_for(kind, input) else {
            return value;
        };

        let payload = match serde_json::to_vec_pretty(&value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %key, error = %e, "Value not serializable, skipping cache write");
                Counters::bump(&self.counters.errors);
                return value;
            }
        };

        let mut index = self.index.lock().await;
        if let Some(previous) = index.remove(&key) {
            self.remove_payload(&previous.file).await;
        }

        let now = self.clock.now().timestamp_millis();
        let file = format!("{}-{}.json", key, now);
        if let Err(e) = tokio::fs::write(self.root.join(&file), &payload).await {
            warn!(key = %key, error = %e, "Failed to write cache payload");
            Counters::bump(&self.counters.errors);
            self.save_index(&index).await;
            return value;
        }

        index.insert(
            key,
            IndexEntry {
                file,
                timestamp: now,
                last_accessed: now,
                kind: kind.to_string(),
                size: payload.len() as u64,
                hits: 0,
            },
        );
        self.save_index(&index).await;

        value
    }

    /// Cached value, or compute, store, and return it. Compute errors are
    /// returned unchanged and nothing is stored.
    pub async fn with_cache<I, T, E, F, Fut>(&self, kind: &str, input: &I, compute: F) -> std::result::Result<T, E>
    where
        I: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(hit) = self.get(kind, input).await {
            return Ok(hit);
        }
        let value = compute().await?;
        Ok(self.set(kind, input, value).await)
    }

    /// Drop one entry; true when it existed
    pub async fn invalidate<I: Serialize + ?Sized>(&self, kind: &str, input: &I) -> bool {
        let Some(key) = self.key_for(kind, input) else {
            return false;
        };
        let mut index = self.index.lock().await;
        match index.remove(&key) {
            Some(entry) => {
                self.remove_payload(&entry.file).await;
                self.save_index(&index).await;
                true
            }
            None => false,
        }
    }

    /// Drop every entry of one type; returns how many went
    pub async fn invalidate_type(&self, kind: &str) -> usize {
        let mut index = self.index.lock().await;
        let doomed: Vec<String> = index
            .iter()
            .filter(|(_, entry)| entry.kind == kind)
            .map(|(key, _)| key.clone())
            .collect();
        self.drop_keys(&mut index, &doomed).await;
        info!(kind, removed = doomed.len(), "Invalidated cache type");
        doomed.len()
    }

    /// Drop everything; returns how many entries went
    pub async fn clear(&self) -> usize {
        let mut index = self.index.lock().await;
        let keys: Vec<String> = index.keys().cloned().collect();
        self.drop_keys(&mut index, &keys).await;
        info!(removed = keys.len(), "Cleared cache");
        keys.len()
    }

    /// Evict every expired entry now; returns the eviction count
    pub async fn cleanup(&self) -> usize {
        let now = self.clock.now().timestamp_millis();
        let mut index = self.index.lock().await;
        let expired: Vec<String> = index
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();

        self.drop_keys(&mut index, &expired).await;
        self.counters
            .evictions
            .fetch_add(expired.len() as u64, Ordering::Relaxed);

        if !expired.is_empty() {
            info!(evicted = expired.len(), "Cache cleanup evicted expired entries");
        }
        expired.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let index = self.index.lock().await;
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };

        CacheStats {
            hits,
            misses,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            entries: index.len(),
            total_size_bytes: index.values().map(|e| e.size).sum(),
            hit_rate,
        }
    }

    fn key_for<I: Serialize + ?Sized>(&self, kind: &str, input: &I) -> Option<String> {
        match cache_key(kind, input) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(kind, error = %e, "Cache input not serializable");
                Counters::bump(&self.counters.errors);
                None
            }
        }
    }

    fn is_expired(&self, entry: &IndexEntry, now_ms: i64) -> bool {
        let age_ms = now_ms.saturating_sub(entry.timestamp);
        age_ms > self.ttl(&entry.kind).as_millis() as i64
    }

    async fn drop_keys(&self, index: &mut BTreeMap<String, IndexEntry>, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        for key in keys {
            if let Some(entry) = index.remove(key) {
                self.remove_payload(&entry.file).await;
            }
        }
        self.save_index(index).await;
    }

    async fn remove_payload(&self, file: &str) {
        if let Err(e) = tokio::fs::remove_file(self.root.join(file)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(file, error = %e, "Failed to remove cache payload");
                Counters::bump(&self.counters.errors);
            }
        }
    }

    async fn save_index(&self, index: &BTreeMap<String, IndexEntry>) {
        let result = match serde_json::to_vec_pretty(index) {
            Ok(bytes) => tokio::fs::write(self.root.join(INDEX_FILE), bytes)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist cache index");
            Counters::bump(&self.counters.errors);
        }
    }
}

async fn load_index(root: &Path) -> Result<BTreeMap<String, IndexEntry>> {
    let path = root.join(INDEX_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

/// Strings hash as themselves; anything else hashes its JSON form
/// (object keys sorted).
pub fn canonicalize<I: Serialize + ?Sized>(input: &I) -> Result<String> {
    Ok(match serde_json::to_value(input)? {
        serde_json::Value::String(s) => s,
        other => serde_json::to_string(&other)?,
    })
}

pub fn cache_key<I: Serialize + ?Sized>(kind: &str, input: &I) -> Result<String> {
    let canonical = canonicalize(input)?;
    let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
    Ok(format!("{}-{}", kind, &digest[..16]))
}
