//! Coordinator configuration.
//!
//! Built through an explicit builder that validates required fields and
//! value ranges up front — a bad interval or retention horizon fails
//! `build()` instead of surfacing as a half-initialized subsystem later.

use std::path::PathBuf;
use std::time::Duration;

use mowos_analytics::AnalyticsConfig;
use mowos_cache::CacheConfig;
use mowos_state::StateMachineConfig;
use mowos_store::RetentionPolicy;

use crate::error::{CoreError, CoreResult};

/// Complete configuration of the data core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// SQLite file of the durable store.
    pub db_path: PathBuf,
    /// Directory the backup loop writes timestamped copies into.
    pub backup_dir: PathBuf,
    pub cache: CacheConfig,
    pub retention: RetentionPolicy,
    pub state: StateMachineConfig,
    pub analytics: AnalyticsConfig,
    /// Cadence of retention cleanup.
    pub cleanup_interval: Duration,
    /// Cadence of database backup.
    pub backup_interval: Duration,
    /// Buffer of the typed event broadcast channel.
    pub event_capacity: usize,
}

impl CoreConfig {
    /// Start building a configuration for the given database path.
    pub fn builder(db_path: impl Into<PathBuf>) -> CoreConfigBuilder {
        CoreConfigBuilder {
            db_path: db_path.into(),
            backup_dir: PathBuf::from("backups"),
            cache: CacheConfig::default(),
            retention: RetentionPolicy::default(),
            state: StateMachineConfig::default(),
            analytics: AnalyticsConfig::default(),
            cleanup_interval: Duration::from_secs(3_600),
            backup_interval: Duration::from_secs(86_400),
            event_capacity: 256,
        }
    }
}

/// Builder for [`CoreConfig`].
#[derive(Debug, Clone)]
pub struct CoreConfigBuilder {
    db_path: PathBuf,
    backup_dir: PathBuf,
    cache: CacheConfig,
    retention: RetentionPolicy,
    state: StateMachineConfig,
    analytics: AnalyticsConfig,
    cleanup_interval: Duration,
    backup_interval: Duration,
    event_capacity: usize,
}

impl CoreConfigBuilder {
    pub fn backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn state(mut self, state: StateMachineConfig) -> Self {
        self.state = state;
        self
    }

    pub fn analytics(mut self, analytics: AnalyticsConfig) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn backup_interval(mut self, interval: Duration) -> Self {
        self.backup_interval = interval;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> CoreResult<CoreConfig> {
        if self.db_path.as_os_str().is_empty() {
            return Err(CoreError::Config("db_path must not be empty".into()));
        }
        if self.backup_dir.as_os_str().is_empty() {
            return Err(CoreError::Config("backup_dir must not be empty".into()));
        }
        if self.cleanup_interval.is_zero() || self.backup_interval.is_zero() {
            return Err(CoreError::Config(
                "cleanup and backup intervals must be > 0".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(CoreError::Config("event_capacity must be > 0".into()));
        }
        self.cache
            .validate()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        self.retention
            .validate()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        if !(0.0..=1.0).contains(&self.state.battery_resume_floor) {
            return Err(CoreError::Config(
                "battery_resume_floor must lie in [0, 1]".into(),
            ));
        }
        if self.state.history_capacity == 0 {
            return Err(CoreError::Config("history_capacity must be > 0".into()));
        }
        if self.state.persist_interval.is_zero() {
            return Err(CoreError::Config("persist_interval must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.analytics.quality_threshold)
            || self.analytics.quality_threshold == 0.0
        {
            return Err(CoreError::Config(
                "quality_threshold must lie in (0, 1]".into(),
            ));
        }
        if self.analytics.anomaly_sigma <= 0.0 {
            return Err(CoreError::Config("anomaly_sigma must be > 0".into()));
        }
        if self.analytics.min_samples == 0 || self.analytics.window_capacity == 0 {
            return Err(CoreError::Config(
                "analytics window sizes must be > 0".into(),
            ));
        }

        Ok(CoreConfig {
            db_path: self.db_path,
            backup_dir: self.backup_dir,
            cache: self.cache,
            retention: self.retention,
            state: self.state,
            analytics: self.analytics,
            cleanup_interval: self.cleanup_interval,
            backup_interval: self.backup_interval,
            event_capacity: self.event_capacity,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────
