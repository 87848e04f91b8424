//! Fingerprint-keyed verdict cache with passive expiry and hit counting.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{sha256_hex, AggregatedVerdict, ResourceKind};

/// Cache failures. The orchestrator treats every variant as a miss or a skipped store.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Backing store could not be read or written.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    /// Requested lifetime cannot be represented.
    #[error("cache ttl out of range: {0:?}")]
    InvalidTtl(Duration),
}

/// 64-char lowercase hex fingerprint of `"{kind}:{identifier}"`.
#[must_use]
pub fn cache_key(kind: ResourceKind, identifier: &str) -> String {
    sha256_hex(format!("{}:{identifier}", kind.label()).as_bytes())
}

/// Stored verdict snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    /// Fingerprint.
    pub key: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Verdict returned on hits.
    pub verdict: AggregatedVerdict,
    /// Store time.
    pub created_at: DateTime<Utc>,
    /// First instant the entry is no longer served.
    pub expires_at: DateTime<Utc>,
    /// Served hits since the last store.
    pub hit_count: u64,
}

impl CacheEntry {
    /// Expired entries are kept but never served.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Time source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock moved by hand.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Storage behind [`ResultCache`]. Each call is atomic with respect to the others.
pub trait CacheBackend: Send + Sync {
    /// Live entry for `key` with its hit counter already incremented.
    fn hit(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, CacheError>;
    /// Inserts or replaces the entry for `entry.key`.
    fn store(&self, entry: CacheEntry) -> Result<(), CacheError>;
    /// Entry for `key`, expired or not, without touching the counter.
    fn peek(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;
}

fn hit_in(entries: &mut IndexMap<String, CacheEntry>, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
    let entry = entries.get_mut(key)?;
    if entry.is_expired(now) {
        return None;
    }
    entry.hit_count += 1;
    Some(entry.clone())
}

/// In-process backend.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: Mutex<IndexMap<String, CacheEntry>>,
}

impl MemoryCacheBackend {
    /// Empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing was stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn hit(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, CacheError> {
        Ok(hit_in(&mut self.entries.lock(), key, now))
    }

    fn store(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.lock().insert(entry.key.clone(), entry);
        Ok(())
    }

    fn peek(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }
}

/// Backend persisted as one JSON object `{ key: entry }`, rewritten on every change.
#[derive(Debug)]
pub struct FileCacheBackend {
    path: PathBuf,
    entries: Mutex<IndexMap<String, CacheEntry>>,
}

impl FileCacheBackend {
    /// Opens (or lazily creates) the snapshot at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => IndexMap::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|err| {
                CacheError::Unavailable(format!("corrupt cache file {}: {err}", path.display()))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => IndexMap::new(),
            Err(err) => {
                return Err(CacheError::Unavailable(format!(
                    "reading {}: {err}",
                    path.display()
                )))
            }
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Snapshot location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &IndexMap<String, CacheEntry>) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| self.unavailable(err))?;
        }
        let data = serde_json::to_vec_pretty(entries).map_err(|err| self.unavailable(err))?;
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, data).map_err(|err| self.unavailable(err))?;
        fs::rename(&staging, &self.path).map_err(|err| self.unavailable(err))
    }

    fn unavailable(&self, err: impl fmt::Display) -> CacheError {
        CacheError::Unavailable(format!("writing {}: {err}", self.path.display()))
    }
}

impl CacheBackend for FileCacheBackend {
    fn hit(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, CacheError> {
        let mut entries = self.entries.lock();
        let mut staged = entries.clone();
        let found = hit_in(&mut staged, key, now);
        if found.is_some() {
            self.persist(&staged)?;
            *entries = staged;
        }
        Ok(found)
    }

    fn store(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.lock();
        let mut staged = entries.clone();
        staged.insert(entry.key.clone(), entry);
        self.persist(&staged)?;
        *entries = staged;
        Ok(())
    }

    fn peek(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }
}

/// Default verdict lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Verdict cache used by the orchestrator.
#[derive(Clone)]
pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("clock", &self.clock)
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ResultCache {
    /// Cache over `backend` using the wall clock and the 24h default TTL.
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
            default_ttl: DEFAULT_TTL,
        }
    }

    /// Fresh in-memory cache.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new()))
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the default TTL.
    #[must_use]
    pub const fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Lifetime used when callers do not pass one.
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Current instant of the cache clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Live verdict, counting a hit.
    pub fn get(
        &self,
        kind: ResourceKind,
        identifier: &str,
    ) -> Result<Option<AggregatedVerdict>, CacheError> {
        Ok(self
            .backend
            .hit(&cache_key(kind, identifier), self.clock.now())?
            .map(|entry| entry.verdict))
    }

    /// Stores `verdict` for `ttl`, replacing any previous entry.
    pub fn put(
        &self,
        kind: ResourceKind,
        identifier: &str,
        verdict: &AggregatedVerdict,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let created_at = self.clock.now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .ok_or(CacheError::InvalidTtl(ttl))?;
        self.backend.store(CacheEntry {
            key: cache_key(kind, identifier),
            kind,
            verdict: verdict.clone(),
            created_at,
            expires_at,
            hit_count: 0,
        })
    }

    /// Stored entry without counting a hit; expired entries are returned too.
    pub fn entry(&self, kind: ResourceKind, identifier: &str) -> Result<Option<CacheEntry>, CacheError> {
        self.backend.peek(&cache_key(kind, identifier))
    }
}
