//! The coordinator: single entry point over cache, store, state machine,
//! and analytics.
//!
//! Writes fan out (durable store gates success; cache and analytics are
//! best-effort), reads are cache-first with store fallback, and every
//! background loop started here is owned here and joined on shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use mowos_analytics::{
    AnalyticsAlert, AnalyticsEngine, ComponentScore, CoverageEfficiency, MaintenancePrediction,
    PerformanceReport,
};
use mowos_cache::{CacheCategory, CacheStatsSnapshot, SensorCache};
use mowos_state::{StateMachine, StateUpdate};
use mowos_store::{
    CleanupReport, ConfigStore, Database, ReadingFilter, ReadingStore, RetentionManager,
    StateStore, TelemetryStore,
};
use mowos_types::{
    ConfigurationEntry, LogLevel, Metadata, OperationalLog, OperationalState, SensorReading,
    Severity, StateTransition,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventBus, EventHandler, EventKind};

/// Store probe round-trips above this count against the health score.
const PROBE_LATENCY_BUDGET_MS: f64 = 250.0;

// ---------------------------------------------------------------------------
// Health types
// ---------------------------------------------------------------------------

/// Coarse health classification derived from the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// Composite system health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    /// `0`–`100`, penalties applied from 100.
    pub score: f64,
    pub status: HealthStatus,
    pub cache_accelerated: bool,
    pub cache_errors: u64,
    pub store_probe_ms: f64,
    pub error_rate: f64,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Owns every subsystem of the data core and the background loops that
/// keep it healthy. Constructed once per process via
/// [`Coordinator::initialize`] and passed by reference.
pub struct Coordinator {
    config: Arc<CoreConfig>,
    cache: SensorCache,
    db: Database,
    readings: ReadingStore,
    configs: ConfigStore,
    telemetry: TelemetryStore,
    retention: RetentionManager,
    state: StateMachine,
    analytics: AnalyticsEngine,
    events: EventBus,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
    ops: Arc<AtomicU64>,
    op_errors: Arc<AtomicU64>,
}

impl Coordinator {
    /// Bring up the data core in dependency order: cache, store, state
    /// machine, analytics; then start the background loops.
    ///
    /// A failing stage aborts initialization and names itself in the
    /// returned error so the process owner knows what did not come up.
    pub async fn initialize(config: CoreConfig) -> CoreResult<Self> {
        info!(db_path = %config.db_path.display(), "initializing data core");

        let cache = SensorCache::new(config.cache.clone()).map_err(|e| CoreError::InitStage {
            stage: "cache",
            source: Box::new(e),
        })?;

        let db = Database::open_and_migrate(config.db_path.clone())
            .await
            .map_err(|e| CoreError::InitStage {
                stage: "store",
                source: Box::new(e),
            })?;
        let retention = RetentionManager::new(db.clone(), config.retention.clone()).map_err(
            |e| CoreError::InitStage {
                stage: "store",
                source: Box::new(e),
            },
        )?;

        let state = StateMachine::new(
            cache.clone(),
            StateStore::new(db.clone()),
            config.state.clone(),
        );
        let recovered = state.recover().await;
        info!(state = %recovered.state, "state machine recovered");

        let analytics = AnalyticsEngine::new(db.clone(), cache.clone(), config.analytics.clone());

        let coordinator = Self {
            events: EventBus::new(config.event_capacity),
            readings: ReadingStore::new(db.clone()),
            configs: ConfigStore::new(db.clone()),
            telemetry: TelemetryStore::new(db.clone()),
            config: Arc::new(config),
            cache,
            db,
            retention,
            state,
            analytics,
            tasks: std::sync::Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            ops: Arc::new(AtomicU64::new(0)),
            op_errors: Arc::new(AtomicU64::new(0)),
        };

        coordinator.start_background_loops();
        coordinator.events.trigger(Event::SystemEvent {
            kind: "startup".into(),
            message: "data core initialized".into(),
        });
        coordinator
            .log(
                LogLevel::Info,
                "coordinator",
                "data core initialized",
                Metadata::new(),
            )
            .await;
        Ok(coordinator)
    }

    fn start_background_loops(&self) {
        let mut tasks = self.lock_tasks();
        tasks.push(self.state.spawn_persistence_loop());
        tasks.push(self.analytics.spawn_refresh_loop());
        tasks.push(self.spawn_cleanup_loop());
        tasks.push(self.spawn_backup_loop());
        tasks.push(self.spawn_alert_forwarder());
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_cleanup_loop(&self) -> JoinHandle<()> {
        let retention = self.retention.clone();
        let events = self.events.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let notify = Arc::clone(&self.notify);
        let period = self.config.cleanup_interval;
        tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "cleanup loop started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => match retention.cleanup_old_data().await {
                        Ok(report) if report.total_deleted() > 0 => {
                            debug!(deleted = report.total_deleted(), "cleanup pass finished");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(%err, "cleanup pass failed");
                            events.trigger(Event::SystemEvent {
                                kind: "cleanup_failed".into(),
                                message: err.to_string(),
                            });
                        }
                    },
                    _ = notify.notified() => {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                    }
                }
            }
            info!("cleanup loop stopped");
        })
    }

    fn spawn_backup_loop(&self) -> JoinHandle<()> {
        let db = self.db.clone();
        let events = self.events.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let notify = Arc::clone(&self.notify);
        let period = self.config.backup_interval;
        let backup_dir = self.config.backup_dir.clone();
        tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "backup loop started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => match db.backup_to(backup_dir.clone()).await {
                        Ok(path) => debug!(path = %path.display(), "backup written"),
                        Err(err) => {
                            warn!(%err, "backup failed");
                            events.trigger(Event::SystemEvent {
                                kind: "backup_failed".into(),
                                message: err.to_string(),
                            });
                        }
                    },
                    _ = notify.notified() => {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                    }
                }
            }
            info!("backup loop stopped");
        })
    }

    /// Forward analytics alerts into the typed event stream.
    fn spawn_alert_forwarder(&self) -> JoinHandle<()> {
        let mut alerts = self.analytics.alerts();
        let events = self.events.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let notify = Arc::clone(&self.notify);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = alerts.recv() => match result {
                        Ok(AnalyticsAlert::QualityDegraded {
                            sensor_id, mean_quality, severity, timestamp, ..
                        }) => {
                            events.trigger(Event::QualityDegraded {
                                sensor_id,
                                mean_quality,
                                severity,
                                timestamp,
                            });
                        }
                        Ok(AnalyticsAlert::AnomalyDetected {
                            sensor_id, value, mean, timestamp, ..
                        }) => {
                            events.trigger(Event::AnomalyDetected {
                                sensor_id,
                                value,
                                mean,
                                timestamp,
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "alert forwarder lagged behind analytics");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = notify.notified() => {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                    }
                }
            }
        })
    }

    // -- readings -----------------------------------------------------------

    /// Store one sensor reading.
    ///
    /// The durable write gates success; the cache write and analytics
    /// ingest are best-effort accelerators. Returns `Ok(true)` once the
    /// reading is on disk.
    pub async fn store_sensor_reading(&self, reading: SensorReading) -> CoreResult<bool> {
        self.ops.fetch_add(1, Ordering::Relaxed);

        if !(0.0..=1.0).contains(&reading.quality) || reading.quality.is_nan() {
            return Err(CoreError::Validation(format!(
                "reading quality {} out of range [0, 1]",
                reading.quality
            )));
        }
        if reading.sensor_id.is_empty() {
            return Err(CoreError::Validation("empty sensor_id".into()));
        }

        if let Err(err) = self.readings.insert(&reading).await {
            self.op_errors.fetch_add(1, Ordering::Relaxed);
            return Err(err.into());
        }

        let cache_key = format!(
            "{}:{}",
            reading.sensor_id,
            reading.timestamp.timestamp_millis()
        );
        self.cache
            .put(CacheCategory::Sensor, &cache_key, &reading, None)
            .await;
        self.analytics.ingest(&reading);

        self.events.trigger(Event::ReadingStored {
            sensor_id: reading.sensor_id.clone(),
            sensor_type: reading.sensor_type.clone(),
            quality: reading.quality,
            timestamp: reading.timestamp,
        });
        Ok(true)
    }

    /// Query readings cache-first.
    ///
    /// A sensor-scoped query scans the cache's recent window first and only
    /// falls back to the store when the hit set is too small to be useful
    /// (fewer than `min(limit, 100)` rows).
    pub async fn get_sensor_readings(
        &self,
        filter: ReadingFilter,
    ) -> CoreResult<Vec<SensorReading>> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let limit = filter.limit.unwrap_or(100).min(1_000) as usize;

        if let Some(sensor_id) = &filter.sensor_id {
            let mut hits: Vec<SensorReading> = self
                .cache
                .get_by_prefix::<SensorReading>(CacheCategory::Sensor, &format!("{sensor_id}:"))
                .await
                .into_iter()
                .map(|(_, reading)| reading)
                .filter(|reading| Self::matches_filter(reading, &filter))
                .collect();

            let good_hit = limit.min(100);
            if hits.len() >= good_hit {
                hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                hits.truncate(limit);
                debug!(sensor_id = %sensor_id, hits = hits.len(), "readings served from cache");
                return Ok(hits);
            }
        }

        match self.readings.query(filter).await {
            Ok(readings) => Ok(readings),
            Err(err) => {
                self.op_errors.fetch_add(1, Ordering::Relaxed);
                Err(err.into())
            }
        }
    }

    fn matches_filter(reading: &SensorReading, filter: &ReadingFilter) -> bool {
        if let Some(sensor_type) = &filter.sensor_type {
            if &reading.sensor_type != sensor_type {
                return false;
            }
        }
        if let Some(start) = filter.start {
            if reading.timestamp < start {
                return false;
            }
        }
        if let Some(end) = filter.end {
            if reading.timestamp > end {
                return false;
            }
        }
        true
    }

    // -- configuration ------------------------------------------------------

    /// Read a configuration entry, cache-first with store fallback.
    pub async fn get_configuration(
        &self,
        section: &str,
        key: &str,
    ) -> CoreResult<Option<ConfigurationEntry>> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let cache_key = format!("{section}:{key}");
        if let Some(entry) = self
            .cache
            .get::<ConfigurationEntry>(CacheCategory::Configuration, &cache_key)
            .await
        {
            return Ok(Some(entry));
        }

        match self.configs.get(section, key).await {
            Ok(Some(entry)) => {
                self.cache
                    .put(CacheCategory::Configuration, &cache_key, &entry, None)
                    .await;
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.op_errors.fetch_add(1, Ordering::Relaxed);
                Err(err.into())
            }
        }
    }

    /// Write a configuration value. The store is authoritative; the cached
    /// entry is invalidated on success so the next read refills it.
    pub async fn set_configuration(
        &self,
        section: &str,
        key: &str,
        value: serde_json::Value,
    ) -> CoreResult<ConfigurationEntry> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let entry = ConfigurationEntry::new(section, key, value)?;

        let stored = match self.configs.upsert(&entry).await {
            Ok(stored) => stored,
            Err(err) => {
                self.op_errors.fetch_add(1, Ordering::Relaxed);
                return Err(err.into());
            }
        };

        self.cache
            .delete(CacheCategory::Configuration, &format!("{section}:{key}"))
            .await;
        self.events.trigger(Event::ConfigChanged {
            section: stored.section.clone(),
            key: stored.key.clone(),
            version: stored.version,
            timestamp: stored.last_modified,
        });
        Ok(stored)
    }

    /// List configuration entries, optionally one section.
    pub async fn list_configurations(
        &self,
        section: Option<&str>,
    ) -> CoreResult<Vec<ConfigurationEntry>> {
        Ok(self.configs.list(section).await?)
    }

    // -- state --------------------------------------------------------------

    /// Apply a state update; emits [`Event::StateChanged`] when a
    /// transition was accepted.
    pub async fn update_state(&self, update: StateUpdate) -> bool {
        let requested_transition = update.state.is_some();
        let accepted = self.state.update(update).await;
        if accepted && requested_transition {
            let current = self.state.current_state().await;
            self.events.trigger(Event::StateChanged {
                state: current.state,
                timestamp: current.last_update,
            });
        }
        accepted
    }

    /// A copy of the live operational state.
    pub async fn current_state(&self) -> OperationalState {
        self.state.current_state().await
    }

    /// The recent transition audit ring.
    pub async fn state_history(&self) -> Vec<StateTransition> {
        self.state.history().await
    }

    /// Force an emergency stop and emit the corresponding event.
    pub async fn emergency_stop(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.state.emergency_stop(reason.clone()).await;
        self.events.trigger(Event::EmergencyStop {
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        let mut context = Metadata::new();
        context.insert("reason".to_string(), serde_json::json!(reason));
        self.log(
            LogLevel::Error,
            "coordinator",
            "emergency stop forced",
            context,
        )
        .await;
    }

    /// Whether normal operation may resume (see the state machine's rules).
    pub async fn can_resume_operation(&self) -> bool {
        self.state.can_resume_operation().await
    }

    /// Create a named state checkpoint.
    pub async fn checkpoint(&self, name: &str) -> bool {
        self.state.checkpoint(name).await
    }

    /// Restore a named state checkpoint.
    pub async fn restore_checkpoint(&self, name: &str) -> CoreResult<OperationalState> {
        Ok(self.state.restore(name).await?)
    }

    // -- analytics ----------------------------------------------------------

    /// Coverage efficiency over the trailing window.
    pub async fn coverage_efficiency(&self, window: Duration) -> CoreResult<CoverageEfficiency> {
        Ok(self.analytics.coverage_efficiency(window).await?)
    }

    /// Health score of one component.
    pub fn component_performance(&self, component: &str) -> Option<ComponentScore> {
        self.analytics.component_performance(component)
    }

    /// Maintenance predictions; critical items also go out as events.
    pub fn predict_maintenance(&self) -> Vec<MaintenancePrediction> {
        let predictions = self.analytics.predict_maintenance();
        for prediction in &predictions {
            if prediction.urgency == Severity::Critical {
                self.events.trigger(Event::MaintenanceDue {
                    component: prediction.component.clone(),
                    maintenance_type: prediction.maintenance_type.clone(),
                    urgency: prediction.urgency,
                    timestamp: Utc::now(),
                });
            }
        }
        predictions
    }

    /// The aggregated (cached) performance report.
    pub async fn performance_report(&self, window: Duration) -> CoreResult<PerformanceReport> {
        Ok(self.analytics.generate_report(window).await?)
    }

    // -- health & export ----------------------------------------------------

    /// Composite system health: 100 minus penalties for a disabled
    /// accelerator tier, cache errors, a slow store probe, and the
    /// coordinator's own error rate.
    pub async fn system_health(&self) -> SystemHealth {
        let mut score = 100.0_f64;

        let cache_accelerated = self.cache.is_accelerated();
        if !cache_accelerated {
            score -= 25.0;
        }

        let cache_errors = self.cache.stats().errors();
        if cache_errors > 0 {
            score -= 20.0 * (cache_errors as f64 / 10.0).min(1.0);
        }

        let started = Instant::now();
        let probe_ok = self.readings.count().await.is_ok();
        let store_probe_ms = started.elapsed().as_secs_f64() * 1_000.0;
        if !probe_ok {
            score -= 40.0;
        } else if store_probe_ms > PROBE_LATENCY_BUDGET_MS {
            score -= 15.0;
        }

        let ops = self.ops.load(Ordering::Relaxed);
        let errors = self.op_errors.load(Ordering::Relaxed);
        let error_rate = if ops == 0 {
            0.0
        } else {
            errors as f64 / ops as f64
        };
        if error_rate > 0.0 {
            score -= 20.0 * (error_rate * 10.0).min(1.0);
        }

        let score = score.clamp(0.0, 100.0);
        let status = if score > 80.0 {
            HealthStatus::Healthy
        } else if score > 50.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        };

        SystemHealth {
            score,
            status,
            cache_accelerated,
            cache_errors,
            store_probe_ms,
            error_rate,
        }
    }

    /// On-demand JSON export of the requested data types over a window.
    pub async fn export_data(
        &self,
        window: Duration,
        data_types: &[&str],
    ) -> CoreResult<serde_json::Value> {
        let start = Utc::now() - chrono::Duration::seconds(window.as_secs() as i64);
        let mut bundle = serde_json::json!({
            "metadata": {
                "exported_at": Utc::now().to_rfc3339(),
                "window_secs": window.as_secs(),
                "data_types": data_types,
            }
        });

        if data_types.contains(&"sensor_readings") {
            let readings = self
                .readings
                .query(ReadingFilter {
                    start: Some(start),
                    limit: Some(1_000),
                    ..ReadingFilter::default()
                })
                .await?;
            bundle["sensor_readings"] =
                serde_json::to_value(readings).map_err(mowos_store::StoreError::from)?;
        }
        if data_types.contains(&"configurations") {
            let configurations = self.configs.list(None).await?;
            bundle["configurations"] =
                serde_json::to_value(configurations).map_err(mowos_store::StoreError::from)?;
        }
        Ok(bundle)
    }

    /// Persist an operational log line; failures degrade to a `warn!`.
    pub async fn log(
        &self,
        level: LogLevel,
        component: &str,
        message: impl Into<String>,
        context: Metadata,
    ) {
        let mut log = OperationalLog::new(level, component, message);
        log.context = context;
        log.correlation_id = Some(Uuid::now_v7());
        if let Err(err) = self.telemetry.insert_log(&log).await {
            warn!(%err, "failed to persist operational log");
        }
    }

    /// Run a retention cleanup pass immediately.
    pub async fn run_cleanup(&self) -> CoreResult<CleanupReport> {
        Ok(self.retention.cleanup_old_data().await?)
    }

    /// Write a backup immediately, returning the file path.
    pub async fn run_backup(&self) -> CoreResult<PathBuf> {
        Ok(self.db.backup_to(self.config.backup_dir.clone()).await?)
    }

    // -- events -------------------------------------------------------------

    /// Subscribe to the typed event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Arc<Event>> {
        self.events.subscribe()
    }

    /// Register a named handler for one event kind.
    pub fn register_handler(
        &self,
        kind: EventKind,
        name: impl Into<String>,
        handler: EventHandler,
    ) {
        self.events.register(kind, name, handler);
    }

    /// Cache effectiveness counters.
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats().snapshot()
    }

    // -- shutdown -----------------------------------------------------------

    /// Stop every background loop, force a final state flush, and release
    /// resources in reverse dependency order. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("data core shutting down");
        self.events.trigger(Event::SystemEvent {
            kind: "shutdown".into(),
            message: "data core stopping".into(),
        });

        // Coordinator loops first, then analytics, then the state machine
        // (whose loop performs the final durable flush).
        self.notify.notify_waiters();
        self.analytics.shutdown();
        self.state.shutdown();

        let handles: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(%err, "background task did not join cleanly");
            }
        }

        self.log(
            LogLevel::Info,
            "coordinator",
            "data core shut down",
            Metadata::new(),
        )
        .await;
        info!("data core stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
