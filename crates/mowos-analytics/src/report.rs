//! Coverage efficiency and the aggregated performance report.

use chrono::{Duration as ChronoDuration, Utc};
use mowos_cache::{CacheCategory, CacheStatsSnapshot};
use mowos_store::ReadingFilter;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::engine::AnalyticsEngine;
use crate::error::AnalyticsResult;
use crate::scoring::{ComponentScore, MaintenancePrediction};

/// Cache key of the aggregated report (category `analytics`).
const REPORT_KEY: &str = "report";

/// Payload fields navigation readings report per pass.
const COVERED_FIELD: &str = "covered_m2";
const TOTAL_FIELD: &str = "total_m2";
const OVERLAP_FIELD: &str = "overlap_m2";

/// Covered/total-area ratio derived from navigation readings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageEfficiency {
    /// Percentage, `0.0`–`100.0`.
    pub value: f64,
    /// `min(samples / 100, 1)` — thin data means thin confidence.
    pub confidence: f64,
    pub samples: usize,
}

/// Durable-tier stats folded into the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHealth {
    pub readings_count: i64,
    pub schema_version: u32,
}

/// The aggregated analytics report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub generated_at: chrono::DateTime<Utc>,
    pub window_secs: u64,
    pub coverage: CoverageEfficiency,
    pub component_scores: Vec<ComponentScore>,
    pub predictions: Vec<MaintenancePrediction>,
    pub cache_stats: CacheStatsSnapshot,
    pub store: StoreHealth,
    pub recommendations: Vec<String>,
}

impl AnalyticsEngine {
    /// Coverage efficiency over the trailing `window`.
    ///
    /// Navigation readings report `covered_m2`, `total_m2`, and
    /// `overlap_m2`; re-mowed area is penalized, capped at half the
    /// covered area so a badly overlapping run never scores negative
    /// coverage.
    pub async fn coverage_efficiency(
        &self,
        window: Duration,
    ) -> AnalyticsResult<CoverageEfficiency> {
        let start = Utc::now() - ChronoDuration::seconds(window.as_secs() as i64);
        let readings = self
            .readings
            .query(ReadingFilter {
                sensor_type: Some("navigation".to_string()),
                start: Some(start),
                limit: Some(1_000),
                ..ReadingFilter::default()
            })
            .await?;

        let mut covered = 0.0_f64;
        let mut overlap = 0.0_f64;
        let mut total = 0.0_f64;
        let mut samples = 0_usize;

        for reading in &readings {
            let Some(c) = reading.value.get(COVERED_FIELD).and_then(|v| v.as_f64()) else {
                continue;
            };
            samples += 1;
            covered += c;
            overlap += reading
                .value
                .get(OVERLAP_FIELD)
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            if let Some(t) = reading.value.get(TOTAL_FIELD).and_then(|v| v.as_f64()) {
                total = total.max(t);
            }
        }

        if samples == 0 || total <= f64::EPSILON {
            return Ok(CoverageEfficiency {
                value: 0.0,
                confidence: 0.0,
                samples: 0,
            });
        }

        let penalty = overlap.min(covered * 0.5);
        let value = (((covered - penalty) / total) * 100.0).clamp(0.0, 100.0);

        Ok(CoverageEfficiency {
            value,
            confidence: (samples as f64 / 100.0).min(1.0),
            samples,
        })
    }

    /// Build (or serve from cache) the aggregated performance report.
    ///
    /// The report is cached under the analytics TTL so repeated transport
    /// polls do not re-aggregate the store.
    pub async fn generate_report(&self, window: Duration) -> AnalyticsResult<PerformanceReport> {
        if let Some(cached) = self
            .cache
            .get::<PerformanceReport>(CacheCategory::Analytics, REPORT_KEY)
            .await
        {
            debug!("serving performance report from cache");
            return Ok(cached);
        }

        let coverage = self.coverage_efficiency(window).await?;
        let component_scores = self.all_component_scores();
        let predictions = self.predict_maintenance();
        let cache_stats = self.cache.stats().snapshot();
        let store = StoreHealth {
            readings_count: self.readings.count().await?,
            schema_version: self.db.schema_version().await?,
        };

        let recommendations =
            build_recommendations(&coverage, &component_scores, &predictions, &cache_stats);

        let report = PerformanceReport {
            generated_at: Utc::now(),
            window_secs: window.as_secs(),
            coverage,
            component_scores,
            predictions,
            cache_stats,
            store,
            recommendations,
        };

        self.cache
            .put(CacheCategory::Analytics, REPORT_KEY, &report, None)
            .await;
        Ok(report)
    }

}

fn build_recommendations(
    coverage: &CoverageEfficiency,
    scores: &[ComponentScore],
    predictions: &[MaintenancePrediction],
    cache_stats: &CacheStatsSnapshot,
) -> Vec<String> {
    let mut recommendations = Vec::new();

    if coverage.samples > 0 && coverage.value < 60.0 {
        recommendations.push(format!(
            "Coverage efficiency is {:.0}%. Review the mowing pattern for missed zones.",
            coverage.value
        ));
    }
    for prediction in predictions {
        recommendations.push(format!(
            "Schedule {} for {} within {} days.",
            prediction.maintenance_type.replace('_', " "),
            prediction.component,
            prediction.estimated_days_until_due
        ));
    }
    for score in scores {
        if score.violations > 0 {
            recommendations.push(format!(
                "{} exceeded its safe operating bounds {} times.",
                score.component, score.violations
            ));
        }
    }
    if cache_stats.errors > 0 {
        recommendations.push(format!(
            "The cache tier reported {} internal errors. Check its health.",
            cache_stats.errors
        ));
    }
    if recommendations.is_empty() {
        recommendations.push("All monitored components are operating normally.".to_string());
    }
    recommendations
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AnalyticsConfig;
    use mowos_cache::{CacheConfig, SensorCache};
    use mowos_store::{Database, ReadingStore};
    use mowos_types::SensorReading;

    async fn setup() -> (AnalyticsEngine, ReadingStore) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let readings = ReadingStore::new(db.clone());
        let cache = SensorCache::new(CacheConfig::default()).unwrap();
        let engine = AnalyticsEngine::new(db, cache, AnalyticsConfig::default());
        (engine, readings)
    }

    fn nav_reading(covered: f64, total: f64, overlap: f64) -> SensorReading {
        SensorReading::new(
            "nav_1",
            "navigation",
            serde_json::json!({
                "covered_m2": covered,
                "total_m2": total,
                "overlap_m2": overlap,
            }),
            "m2",
            1.0,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn coverage_without_data_is_zero_confidence() {
        let (engine, _) = setup().await;
        let coverage = engine
            .coverage_efficiency(Duration::from_secs(3_600))
            .await
            .unwrap();
        assert_eq!(coverage.value, 0.0);
        assert_eq!(coverage.confidence, 0.0);
    }

    #[tokio::test]
    async fn coverage_subtracts_overlap() {
        let (engine, readings) = setup().await;
        // 40 + 40 covered of 100 total, 10 overlapped.
        readings.insert(&nav_reading(40.0, 100.0, 0.0)).await.unwrap();
        readings.insert(&nav_reading(40.0, 100.0, 10.0)).await.unwrap();

        let coverage = engine
            .coverage_efficiency(Duration::from_secs(3_600))
            .await
            .unwrap();
        assert!((coverage.value - 70.0).abs() < 1e-9);
        assert_eq!(coverage.samples, 2);
        assert!((coverage.confidence - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn overlap_penalty_is_capped_at_half_covered() {
        let (engine, readings) = setup().await;
        // Pathological overlap larger than the covered area itself.
        readings.insert(&nav_reading(40.0, 100.0, 90.0)).await.unwrap();

        let coverage = engine
            .coverage_efficiency(Duration::from_secs(3_600))
            .await
            .unwrap();
        // Penalty capped at 20 (half of 40): (40 - 20) / 100.
        assert!((coverage.value - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn coverage_ignores_readings_without_area_fields() {
        let (engine, readings) = setup().await;
        let bare = SensorReading::new("nav_1", "navigation", serde_json::json!(1.0), "", 1.0)
            .unwrap();
        readings.insert(&bare).await.unwrap();

        let coverage = engine
            .coverage_efficiency(Duration::from_secs(3_600))
            .await
            .unwrap();
        assert_eq!(coverage.samples, 0);
    }

    #[tokio::test]
    async fn report_aggregates_and_caches() {
        let (engine, readings) = setup().await;
        readings.insert(&nav_reading(80.0, 100.0, 0.0)).await.unwrap();
        for _ in 0..10 {
            engine.ingest(
                &SensorReading::new("battery_main", "battery", serde_json::json!(12.5), "V", 1.0)
                    .unwrap(),
            );
        }

        let report = engine
            .generate_report(Duration::from_secs(3_600))
            .await
            .unwrap();
        assert_eq!(report.component_scores.len(), 1);
        assert!(report.store.readings_count >= 1);
        assert!(report.store.schema_version >= 1);
        assert!(!report.recommendations.is_empty());

        // Second call within the TTL serves the cached report.
        let again = engine
            .generate_report(Duration::from_secs(3_600))
            .await
            .unwrap();
        assert_eq!(report.generated_at, again.generated_at);
    }

    #[test]
    fn healthy_system_gets_the_all_clear() {
        let recommendations = build_recommendations(
            &CoverageEfficiency {
                value: 90.0,
                confidence: 0.5,
                samples: 50,
            },
            &[],
            &[],
            &CacheStatsSnapshot {
                hits: 10,
                misses: 2,
                sets: 12,
                deletes: 0,
                errors: 0,
                hit_rate: 0.83,
            },
        );
        assert_eq!(recommendations.len(), 1);
        assert!(recommendations[0].contains("normally"));
    }

    #[test]
    fn recommendations_name_concrete_actions() {
        let prediction = MaintenancePrediction {
            component: "blade_1".to_string(),
            maintenance_type: "blade_replacement".to_string(),
            urgency: mowos_types::Severity::Warning,
            estimated_days_until_due: 12,
            confidence: 0.4,
        };
        let recommendations = build_recommendations(
            &CoverageEfficiency {
                value: 45.0,
                confidence: 0.3,
                samples: 30,
            },
            &[],
            &[prediction],
            &CacheStatsSnapshot {
                hits: 0,
                misses: 0,
                sets: 0,
                deletes: 0,
                errors: 3,
                hit_rate: 0.0,
            },
        );
        assert_eq!(recommendations.len(), 3);
        assert!(recommendations[0].contains("mowing pattern"));
        assert!(recommendations[1].contains("blade replacement"));
        assert!(recommendations[2].contains("cache"));
    }
}
