//! The analytics engine: ingest path, alert evaluation, refresh loop.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mowos_cache::{CacheCategory, SensorCache};
use mowos_store::{Database, ReadingStore, TelemetryStore};
use mowos_types::{Metadata, PerformanceMetric, SensorReading, Severity};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::scoring::{self, ComponentScore, MaintenancePrediction};

/// Cache key of the headline summary (category `analytics`).
pub(crate) const SUMMARY_KEY: &str = "summary";

// ---------------------------------------------------------------------------
// Config & alerts
// ---------------------------------------------------------------------------

/// Tunables for the analytics layer.
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    /// Samples retained per sensor; oldest evicted on overflow.
    pub window_capacity: usize,
    /// Samples required before quality/anomaly evaluation starts.
    pub min_samples: usize,
    /// Trailing-window mean quality below this fires a degradation alert.
    pub quality_threshold: f64,
    /// Standard deviations a scalar must stray to count as an anomaly.
    pub anomaly_sigma: f64,
    /// Sensor types evaluated on every ingest.
    pub critical_sensor_types: HashSet<String>,
    /// Component score below this produces a maintenance prediction.
    pub score_threshold: f64,
    /// Buffer of the alert broadcast channel.
    pub alert_capacity: usize,
    /// Cadence of the headline refresh loop.
    pub refresh_interval: Duration,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            window_capacity: 200,
            min_samples: 3,
            quality_threshold: 0.8,
            anomaly_sigma: 2.0,
            critical_sensor_types: ["battery", "motor", "blade", "imu", "navigation"]
                .into_iter()
                .map(String::from)
                .collect(),
            score_threshold: scoring::DEFAULT_SCORE_THRESHOLD,
            alert_capacity: 256,
            refresh_interval: Duration::from_secs(3_600),
        }
    }
}

/// An alert produced by the ingest path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AnalyticsAlert {
    /// Trailing mean quality of a critical sensor fell below threshold.
    /// Emitted once per sustained episode.
    QualityDegraded {
        sensor_id: String,
        sensor_type: String,
        mean_quality: f64,
        threshold: f64,
        severity: Severity,
        timestamp: DateTime<Utc>,
    },
    /// Latest scalar sample strayed more than kσ from the trailing mean.
    AnomalyDetected {
        sensor_id: String,
        sensor_type: String,
        value: f64,
        mean: f64,
        std_dev: f64,
        sigma: f64,
        timestamp: DateTime<Utc>,
    },
}

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Sample {
    quality: f64,
    scalar: Option<f64>,
}

struct SensorWindow {
    sensor_type: String,
    samples: VecDeque<Sample>,
    /// True while a degradation episode is running; gates re-alerting.
    degradation_active: bool,
}

impl SensorWindow {
    fn new(sensor_type: &str) -> Self {
        Self {
            sensor_type: sensor_type.to_string(),
            samples: VecDeque::new(),
            degradation_active: false,
        }
    }

    fn push(&mut self, sample: Sample, capacity: usize) {
        if self.samples.len() >= capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn mean_quality(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.quality).sum::<f64>() / self.samples.len() as f64
    }

    fn scalars(&self) -> Vec<f64> {
        self.samples.iter().filter_map(|s| s.scalar).collect()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The analytics engine. Cheaply cloneable; clones share windows, the
/// alert channel, and counters.
#[derive(Clone)]
pub struct AnalyticsEngine {
    pub(crate) db: Database,
    pub(crate) readings: ReadingStore,
    pub(crate) telemetry: TelemetryStore,
    pub(crate) cache: SensorCache,
    pub(crate) config: Arc<AnalyticsConfig>,
    windows: Arc<DashMap<String, SensorWindow>>,
    alerts_tx: broadcast::Sender<AnalyticsAlert>,
    alerts_emitted: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AnalyticsEngine {
    /// Build an engine over the shared database handle and cache.
    pub fn new(db: Database, cache: SensorCache, config: AnalyticsConfig) -> Self {
        let (alerts_tx, _) = broadcast::channel(config.alert_capacity);
        Self {
            readings: ReadingStore::new(db.clone()),
            telemetry: TelemetryStore::new(db.clone()),
            db,
            cache,
            config: Arc::new(config),
            windows: Arc::new(DashMap::new()),
            alerts_tx,
            alerts_emitted: Arc::new(AtomicU64::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Subscribe to alerts. Only alerts raised after this call arrive.
    pub fn alerts(&self) -> broadcast::Receiver<AnalyticsAlert> {
        self.alerts_tx.subscribe()
    }

    /// Total alerts emitted since construction.
    pub fn alerts_emitted(&self) -> u64 {
        self.alerts_emitted.load(Ordering::Relaxed)
    }

    /// Number of sensors currently tracked.
    pub fn sensors_tracked(&self) -> usize {
        self.windows.len()
    }

    // -- ingest -------------------------------------------------------------

    /// Feed one reading into its sensor window and, for critical sensor
    /// types with enough history, evaluate quality and anomaly conditions.
    ///
    /// Never blocks on alert subscribers and never fails the caller.
    pub fn ingest(&self, reading: &SensorReading) {
        let mut window = self
            .windows
            .entry(reading.sensor_id.clone())
            .or_insert_with(|| SensorWindow::new(&reading.sensor_type));

        window.push(
            Sample {
                quality: reading.quality,
                scalar: reading.scalar_value(),
            },
            self.config.window_capacity,
        );

        if !self.config.critical_sensor_types.contains(&reading.sensor_type)
            || window.samples.len() < self.config.min_samples
        {
            return;
        }

        self.evaluate_quality(reading, &mut window);
        self.evaluate_anomaly(reading, &window);
    }

    fn evaluate_quality(&self, reading: &SensorReading, window: &mut SensorWindow) {
        let mean_quality = window.mean_quality();
        if mean_quality < self.config.quality_threshold {
            if !window.degradation_active {
                window.degradation_active = true;
                let deficit = self.config.quality_threshold - mean_quality;
                let severity = if deficit >= 0.3 {
                    Severity::Critical
                } else if deficit >= 0.1 {
                    Severity::Warning
                } else {
                    Severity::Info
                };
                warn!(
                    sensor_id = %reading.sensor_id,
                    mean_quality,
                    ?severity,
                    "sensor quality degraded"
                );
                self.emit(AnalyticsAlert::QualityDegraded {
                    sensor_id: reading.sensor_id.clone(),
                    sensor_type: reading.sensor_type.clone(),
                    mean_quality,
                    threshold: self.config.quality_threshold,
                    severity,
                    timestamp: Utc::now(),
                });
            }
        } else if window.degradation_active {
            debug!(sensor_id = %reading.sensor_id, mean_quality, "sensor quality recovered");
            window.degradation_active = false;
        }
    }

    fn evaluate_anomaly(&self, reading: &SensorReading, window: &SensorWindow) {
        // Structured payloads are excluded from the numeric check.
        let Some(latest) = reading.scalar_value() else {
            return;
        };

        let scalars = window.scalars();
        // The trailing statistics exclude the sample under test.
        let prior = &scalars[..scalars.len().saturating_sub(1)];
        if prior.len() < self.config.min_samples {
            return;
        }

        let mean = scoring::mean(prior);
        let std_dev = scoring::std_dev(prior, mean);
        if std_dev <= f64::EPSILON {
            // A perfectly flat history has no meaningful sigma band.
            return;
        }

        if (latest - mean).abs() > self.config.anomaly_sigma * std_dev {
            warn!(
                sensor_id = %reading.sensor_id,
                latest,
                mean,
                std_dev,
                "anomalous sensor value"
            );
            self.emit(AnalyticsAlert::AnomalyDetected {
                sensor_id: reading.sensor_id.clone(),
                sensor_type: reading.sensor_type.clone(),
                value: latest,
                mean,
                std_dev,
                sigma: self.config.anomaly_sigma,
                timestamp: Utc::now(),
            });
        }
    }

    fn emit(&self, alert: AnalyticsAlert) {
        self.alerts_emitted.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine; the alert still counts.
        let _ = self.alerts_tx.send(alert);
    }

    // -- scoring ------------------------------------------------------------

    /// Score one component from its buffered samples, if it has enough.
    pub fn component_performance(&self, component: &str) -> Option<ComponentScore> {
        let window = self.windows.get(component)?;
        scoring::score_samples(
            component,
            &window.sensor_type,
            &window.scalars(),
            self.config.min_samples,
        )
    }

    /// Scores for every tracked component with enough samples.
    pub fn all_component_scores(&self) -> Vec<ComponentScore> {
        let mut scores: Vec<ComponentScore> = self
            .windows
            .iter()
            .filter_map(|entry| {
                scoring::score_samples(
                    entry.key(),
                    &entry.sensor_type,
                    &entry.scalars(),
                    self.config.min_samples,
                )
            })
            .collect();
        scores.sort_by(|a, b| a.component.cmp(&b.component));
        scores
    }

    /// Maintenance predictions for components under the score threshold,
    /// most urgent first.
    pub fn predict_maintenance(&self) -> Vec<MaintenancePrediction> {
        let mut predictions: Vec<MaintenancePrediction> = self
            .all_component_scores()
            .iter()
            .filter_map(|score| scoring::predict_from_score(score, self.config.score_threshold))
            .collect();
        predictions.sort_by(|a, b| {
            b.urgency
                .cmp(&a.urgency)
                .then(a.estimated_days_until_due.cmp(&b.estimated_days_until_due))
        });
        predictions
    }

    // -- refresh loop -------------------------------------------------------

    /// Push headline metrics into the cache and append them to the metrics
    /// table. Failures degrade to log lines; the ingest path is untouched.
    pub async fn refresh_summary(&self) {
        let scores = self.all_component_scores();
        let avg_score = if scores.is_empty() {
            None
        } else {
            Some(scores.iter().map(|s| s.score).sum::<f64>() / scores.len() as f64)
        };

        let summary = serde_json::json!({
            "generated_at": Utc::now().to_rfc3339(),
            "sensors_tracked": self.sensors_tracked(),
            "alerts_emitted": self.alerts_emitted(),
            "avg_component_score": avg_score,
            "pending_maintenance": self.predict_maintenance().len(),
        });
        self.cache
            .put(CacheCategory::Analytics, SUMMARY_KEY, &summary, None)
            .await;

        if let Some(avg) = avg_score {
            let metric = PerformanceMetric {
                metric_name: "analytics.avg_component_score".to_string(),
                timestamp: Utc::now(),
                value: avg,
                category: "analytics".to_string(),
                tags: Metadata::new(),
            };
            if let Err(err) = self.telemetry.insert_metric(&metric).await {
                warn!(%err, "failed to persist headline metric");
            }
        }
    }

    /// Spawn the hourly summary refresh loop.
    pub fn spawn_refresh_loop(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            info!(
                interval_secs = engine.config.refresh_interval.as_secs(),
                "analytics refresh loop started"
            );
            let mut interval = tokio::time::interval(engine.config.refresh_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => engine.refresh_summary().await,
                    _ = engine.notify.notified() => {
                        if engine.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                    }
                }
            }
            info!("analytics refresh loop stopped");
        })
    }

    /// Signal the refresh loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
