//! The cache service: category-scoped TTL key-value plus streams and pub/sub.
//!
//! [`SensorCache`] is what the rest of the system holds. It owns the chosen
//! [`CacheBackend`], resolves per-category default TTLs, serializes values
//! at a single serde boundary, and never lets an internal failure reach the
//! caller — a failed operation is a miss (or `false`) plus an error count.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::backend::{CacheBackend, MemoryBackend, MokaBackend};
use crate::error::{CacheError, CacheResult};

// ---------------------------------------------------------------------------
// Categories & config
// ---------------------------------------------------------------------------

/// Namespaces that partition the key space and carry default TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    /// Raw sensor readings — hot for seconds only.
    Sensor,
    /// The live operational state snapshot.
    State,
    /// Configuration entries — change rarely.
    Configuration,
    /// Analytics summaries and reports.
    Analytics,
    /// Named state checkpoints — long-lived, expire on their own.
    Checkpoint,
}

impl CacheCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::State => "state",
            Self::Configuration => "configuration",
            Self::Analytics => "analytics",
            Self::Checkpoint => "checkpoint",
        }
    }
}

/// Tunables for the cache tier.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// When `false` the accelerator tier is skipped entirely and the
    /// in-process map backend serves every call.
    pub accelerator: bool,
    /// Entry cap for the accelerator tier.
    pub max_capacity: u64,
    pub sensor_ttl: Duration,
    pub state_ttl: Duration,
    pub configuration_ttl: Duration,
    pub analytics_ttl: Duration,
    pub checkpoint_ttl: Duration,
    /// Entries retained per append-only stream.
    pub stream_capacity: usize,
    /// Broadcast buffer per pub/sub topic.
    pub topic_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            accelerator: true,
            max_capacity: 50_000,
            sensor_ttl: Duration::from_secs(30),
            state_ttl: Duration::from_secs(60),
            configuration_ttl: Duration::from_secs(600),
            analytics_ttl: Duration::from_secs(300),
            checkpoint_ttl: Duration::from_secs(86_400),
            stream_capacity: 1_000,
            topic_capacity: 256,
        }
    }
}

impl CacheConfig {
    /// Default TTL for a category.
    pub fn ttl_for(&self, category: CacheCategory) -> Duration {
        match category {
            CacheCategory::Sensor => self.sensor_ttl,
            CacheCategory::State => self.state_ttl,
            CacheCategory::Configuration => self.configuration_ttl,
            CacheCategory::Analytics => self.analytics_ttl,
            CacheCategory::Checkpoint => self.checkpoint_ttl,
        }
    }

    /// Reject configurations the cache cannot operate with.
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_capacity == 0 {
            return Err(CacheError::InvalidConfig("max_capacity must be > 0".into()));
        }
        if self.stream_capacity == 0 || self.topic_capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "stream and topic capacities must be > 0".into(),
            ));
        }
        for (name, ttl) in [
            ("sensor_ttl", self.sensor_ttl),
            ("state_ttl", self.state_ttl),
            ("configuration_ttl", self.configuration_ttl),
            ("analytics_ttl", self.analytics_ttl),
            ("checkpoint_ttl", self.checkpoint_ttl),
        ] {
            if ttl.is_zero() {
                return Err(CacheError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters tracking cache effectiveness and degradation.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn sets(&self) -> u64 {
        self.sets.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Hit rate in `[0, 1]`; `0.0` before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }

    /// Point-in-time copy for reports.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            sets: self.sets(),
            deletes: self.deletes(),
            errors: self.errors(),
            hit_rate: self.hit_rate(),
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} sets={} deletes={} errors={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.sets(),
            self.deletes(),
            self.errors(),
            self.hit_rate() * 100.0,
        )
    }
}

/// Serializable copy of [`CacheStats`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

// ---------------------------------------------------------------------------
// SensorCache
// ---------------------------------------------------------------------------

/// The cache tier handle shared across the system.
///
/// Cheaply cloneable; all clones share the backend, streams, topics, and
/// counters.
#[derive(Clone)]
pub struct SensorCache {
    backend: Arc<dyn CacheBackend>,
    streams: Arc<DashMap<String, Mutex<VecDeque<serde_json::Value>>>>,
    topics: Arc<DashMap<String, broadcast::Sender<Arc<serde_json::Value>>>>,
    stats: Arc<CacheStats>,
    config: Arc<CacheConfig>,
}

impl SensorCache {
    /// Build a cache, selecting the backend from `config.accelerator`.
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let backend: Arc<dyn CacheBackend> = if config.accelerator {
            Arc::new(MokaBackend::new(config.max_capacity))
        } else {
            warn!("cache accelerator disabled, using in-process map fallback");
            Arc::new(MemoryBackend::new())
        };
        Ok(Self::with_backend(backend, config))
    }

    /// Build a cache around an explicit backend (tests, custom tiers).
    pub fn with_backend(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self {
            backend,
            streams: Arc::new(DashMap::new()),
            topics: Arc::new(DashMap::new()),
            stats: Arc::new(CacheStats::default()),
            config: Arc::new(config),
        }
    }

    fn full_key(category: CacheCategory, key: &str) -> String {
        format!("{}:{}", category.as_str(), key)
    }

    /// Insert a value under `category:key`.
    ///
    /// `ttl` overrides the category default. Returns `false` (and counts an
    /// error) when the value cannot be serialized; never propagates.
    pub async fn put<T: Serialize>(
        &self,
        category: CacheCategory,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(category = category.as_str(), key, %err, "cache put failed to serialize");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        let ttl = ttl.unwrap_or_else(|| self.config.ttl_for(category));
        self.backend
            .put(Self::full_key(category, key), payload, ttl)
            .await;
        self.stats.sets.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Look up `category:key`, decoding to `T`.
    ///
    /// Undecodable entries are evicted and treated as a miss with an error
    /// count — a corrupt cache line must not wedge its key forever.
    pub async fn get<T: DeserializeOwned>(&self, category: CacheCategory, key: &str) -> Option<T> {
        let full_key = Self::full_key(category, key);
        match self.backend.get(&full_key).await {
            Some(payload) => match serde_json::from_str(&payload) {
                Ok(value) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    Some(value)
                }
                Err(err) => {
                    warn!(key = %full_key, %err, "cache entry undecodable, evicting");
                    self.backend.delete(&full_key).await;
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Remove `category:key`, returning whether a live entry existed.
    pub async fn delete(&self, category: CacheCategory, key: &str) -> bool {
        let deleted = self.backend.delete(&Self::full_key(category, key)).await;
        if deleted {
            self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        }
        deleted
    }

    /// All live entries in `category` whose key starts with `prefix`,
    /// decoded to `T`. Undecodable entries are skipped and counted.
    pub async fn get_by_prefix<T: DeserializeOwned>(
        &self,
        category: CacheCategory,
        prefix: &str,
    ) -> Vec<(String, T)> {
        let namespace = format!("{}:", category.as_str());
        let scan_prefix = format!("{namespace}{prefix}");
        let mut results = Vec::new();
        for (full_key, payload) in self.backend.scan_prefix(&scan_prefix).await {
            match serde_json::from_str(&payload) {
                Ok(value) => {
                    let key = full_key
                        .strip_prefix(&namespace)
                        .unwrap_or(&full_key)
                        .to_string();
                    results.push((key, value));
                }
                Err(err) => {
                    warn!(key = %full_key, %err, "skipping undecodable cache entry in prefix scan");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        results
    }

    // -- streams ------------------------------------------------------------

    /// Append to a bounded stream; the oldest entry is evicted at capacity.
    pub fn append_to_stream(&self, stream: &str, value: serde_json::Value) {
        let entry = self
            .streams
            .entry(stream.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut buf = entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if buf.len() >= self.config.stream_capacity {
            buf.pop_front();
        }
        buf.push_back(value);
    }

    /// The most recent `count` stream entries, oldest first.
    pub fn read_stream(&self, stream: &str, count: usize) -> Vec<serde_json::Value> {
        match self.streams.get(stream) {
            Some(entry) => {
                let buf = entry
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let skip = buf.len().saturating_sub(count);
                buf.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    // -- pub/sub ------------------------------------------------------------

    /// Publish to a topic, returning the number of live subscribers.
    ///
    /// Publishing to a topic nobody listens on is not an error.
    pub fn publish(&self, topic: &str, value: serde_json::Value) -> usize {
        let sender = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.config.topic_capacity).0)
            .clone();
        match sender.send(Arc::new(value)) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!(topic, "published with no active subscribers");
                0
            }
        }
    }

    /// Subscribe to a topic; only messages published after this call arrive.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Arc<serde_json::Value>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.config.topic_capacity).0)
            .subscribe()
    }

    // -- introspection ------------------------------------------------------

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether the accelerator tier is serving requests.
    pub fn is_accelerated(&self) -> bool {
        self.backend.name() != "memory"
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
