//! Key-value cache backends.
//!
//! [`CacheBackend`] is the seam every caller depends on. The backend is
//! chosen once, at construction, from [`crate::CacheConfig`]; nothing
//! downstream ever asks which tier it is talking to.
//!
//! Backend operations are infallible: an entry that cannot be served is a
//! miss, full stop. Failure accounting happens one level up in
//! [`crate::SensorCache`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use tracing::debug;

/// An entry paired with the TTL it was written with.
#[derive(Clone)]
struct TtlEntry {
    payload: String,
    ttl: Duration,
}

/// Abstract TTL'd key-value tier.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Look up a live entry. Expired or absent keys return `None`.
    async fn get(&self, key: &str) -> Option<String>;

    /// Insert or replace an entry with the given TTL.
    async fn put(&self, key: String, value: String, ttl: Duration);

    /// Remove an entry, returning whether it was present and live.
    async fn delete(&self, key: &str) -> bool;

    /// All live entries whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Vec<(String, String)>;

    /// Drop every entry.
    async fn clear(&self);

    /// Short backend name for logs and health reports.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Moka-backed accelerator tier
// ---------------------------------------------------------------------------

/// Per-entry expiry policy: each value carries its own TTL.
struct PerEntryTtl;

impl Expiry<String, TtlEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &TtlEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &TtlEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        // Overwrites restart the clock with the new TTL.
        Some(value.ttl)
    }
}

/// The accelerator tier: a lock-free concurrent cache with eager,
/// per-entry TTL eviction.
pub struct MokaBackend {
    inner: Cache<String, TtlEntry>,
}

impl MokaBackend {
    /// Create a backend bounded to `max_capacity` entries.
    pub fn new(max_capacity: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        debug!(max_capacity, "moka cache backend created");
        Self { inner }
    }
}

#[async_trait]
impl CacheBackend for MokaBackend {
    async fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).await.map(|entry| entry.payload)
    }

    async fn put(&self, key: String, value: String, ttl: Duration) {
        self.inner.insert(key, TtlEntry { payload: value, ttl }).await;
    }

    async fn delete(&self, key: &str) -> bool {
        self.inner.remove(key).await.is_some()
    }

    async fn scan_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.inner
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| ((*key).clone(), entry.payload))
            .collect()
    }

    async fn clear(&self) {
        self.inner.invalidate_all();
    }

    fn name(&self) -> &'static str {
        "moka"
    }
}

// ---------------------------------------------------------------------------
// In-process fallback tier
// ---------------------------------------------------------------------------

/// Fallback tier: a guarded map with expiry stamps checked on read.
///
/// Expired entries linger until touched or until the periodic sweep runs;
/// both paths observe the same TTL contract as [`MokaBackend`].
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    writes: AtomicU64,
}

/// Sweep the map of dead entries every this many writes.
const SWEEP_EVERY: u64 = 256;

impl MemoryBackend {
    pub fn new() -> Self {
        debug!("in-process map cache backend created");
        Self {
            entries: Mutex::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>> {
        // A poisoned cache map only ever holds reconstructible data.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    async fn put(&self, key: String, value: String, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        {
            let mut entries = self.lock();
            entries.insert(key, (value, expires_at));
            if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
                let now = Instant::now();
                entries.retain(|_, (_, expires_at)| *expires_at > now);
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        let mut entries = self.lock();
        match entries.remove(key) {
            Some((_, expires_at)) => expires_at > Instant::now(),
            None => false,
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        let now = Instant::now();
        let entries = self.lock();
        entries
            .iter()
            .filter(|(key, (_, expires_at))| key.starts_with(prefix) && *expires_at > now)
            .map(|(key, (value, _))| (key.clone(), value.clone()))
            .collect()
    }

    async fn clear(&self) {
        self.lock().clear();
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
