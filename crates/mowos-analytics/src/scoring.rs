//! Pure scoring math over buffered samples.
//!
//! Everything here is synchronous and side-effect free so it can be tested
//! against hand-computed values. Operating limits follow commercial
//! component datasheets; samples outside them count as safe-bound
//! violations.

use serde::{Deserialize, Serialize};

use mowos_types::Severity;

/// Score below which a component is flagged for maintenance.
pub const DEFAULT_SCORE_THRESHOLD: f64 = 70.0;

/// Per-violation score penalty, capped at [`MAX_VIOLATION_PENALTY`].
const VIOLATION_PENALTY: f64 = 5.0;
const MAX_VIOLATION_PENALTY: f64 = 40.0;

/// Safe operating bounds per sensor type, in the unit the driver reports.
///
/// Battery: pack voltage window of a 12 V LiFePO4 pack.
/// Motor: winding temperature, °C.
/// Blade: spindle speed, rpm.
/// Imu: pitch/roll envelope, degrees.
pub fn safe_bounds(sensor_type: &str) -> Option<(f64, f64)> {
    match sensor_type {
        "battery" => Some((9.0, 14.8)),
        "motor" => Some((-20.0, 90.0)),
        "blade" => Some((0.0, 3500.0)),
        "imu" => Some((-180.0, 180.0)),
        _ => None,
    }
}

/// Bounded `[0, 100]` health score for one component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentScore {
    pub component: String,
    pub sensor_type: String,
    pub score: f64,
    /// Inverse coefficient of variation, `(0, 1]`.
    pub stability: f64,
    /// Agreement of the recent half-window with the rolling baseline, `[0, 1]`.
    pub efficiency: f64,
    pub violations: usize,
    pub samples: usize,
}

/// A predicted maintenance need for one component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenancePrediction {
    pub component: String,
    pub maintenance_type: String,
    pub urgency: Severity,
    pub estimated_days_until_due: u32,
    pub confidence: f64,
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Score a component from its buffered scalar samples.
///
/// Returns `None` when there are fewer than `min_samples` scalars — a
/// score from two points is noise, not signal.
pub fn score_samples(
    component: &str,
    sensor_type: &str,
    scalars: &[f64],
    min_samples: usize,
) -> Option<ComponentScore> {
    if scalars.len() < min_samples.max(2) {
        return None;
    }

    let m = mean(scalars);
    let sd = std_dev(scalars, m);

    // Stability: inverse coefficient of variation. A flat signal scores
    // 1.0; noise relative to the mean pulls it toward 0.
    let cv = if m.abs() > f64::EPSILON {
        sd / m.abs()
    } else if sd > f64::EPSILON {
        1.0
    } else {
        0.0
    };
    let stability = 1.0 / (1.0 + cv);

    // Efficiency: how closely the recent half tracks the rolling baseline
    // (the older half). Drift in either direction costs score.
    let half = scalars.len() / 2;
    let baseline = mean(&scalars[..half.max(1)]);
    let recent = mean(&scalars[half..]);
    let efficiency = if baseline.abs() > f64::EPSILON {
        (1.0 - ((recent - baseline) / baseline).abs()).clamp(0.0, 1.0)
    } else if recent.abs() > f64::EPSILON {
        0.0
    } else {
        1.0
    };

    let violations = match safe_bounds(sensor_type) {
        Some((lo, hi)) => scalars.iter().filter(|v| **v < lo || **v > hi).count(),
        None => 0,
    };
    let penalty = (violations as f64 * VIOLATION_PENALTY).min(MAX_VIOLATION_PENALTY);

    let score = (stability * 50.0 + efficiency * 50.0 - penalty).clamp(0.0, 100.0);

    Some(ComponentScore {
        component: component.to_string(),
        sensor_type: sensor_type.to_string(),
        score,
        stability,
        efficiency,
        violations,
        samples: scalars.len(),
    })
}

/// Turn a below-threshold score into a maintenance prediction.
pub fn predict_from_score(score: &ComponentScore, threshold: f64) -> Option<MaintenancePrediction> {
    if score.score >= threshold {
        return None;
    }
    let deficit = threshold - score.score;
    let urgency = if deficit >= 30.0 {
        Severity::Critical
    } else if deficit >= 10.0 {
        Severity::Warning
    } else {
        Severity::Info
    };

    // A component right at the threshold has ~a month; one at zero is due
    // now.
    let estimated_days_until_due =
        ((score.score / threshold) * 30.0).round().clamp(1.0, 30.0) as u32;

    let maintenance_type = match score.sensor_type.as_str() {
        "battery" => "battery_service",
        "blade" => "blade_replacement",
        "motor" => "motor_inspection",
        "imu" => "sensor_calibration",
        _ => "general_inspection",
    };

    Some(MaintenancePrediction {
        component: score.component.clone(),
        maintenance_type: maintenance_type.to_string(),
        urgency,
        estimated_days_until_due,
        confidence: (score.samples as f64 / 100.0).min(1.0),
    })
}

// ── tests ────────────────────────────────────────────────────────────
