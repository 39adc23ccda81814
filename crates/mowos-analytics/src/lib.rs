//! # mowos-analytics
//!
//! Analytics layer of the MowOS data core.
//!
//! Ingests sensor readings into per-sensor bounded windows and derives:
//!
//! - quality-degradation alerts (one per sustained episode, not per sample)
//! - anomaly alerts (latest scalar vs trailing mean, ±kσ)
//! - coverage efficiency from navigation readings
//! - per-component performance scores and maintenance predictions
//! - a cached, TTL'd performance report with plain-language recommendations
//!
//! Alerts fan out over a broadcast channel; `ingest` never blocks on slow
//! subscribers. A lightweight background refresh pushes headline metrics
//! into the cache on its own timer, independent of the ingest path.

pub mod engine;
pub mod error;
pub mod report;
pub mod scoring;

pub use engine::{AnalyticsAlert, AnalyticsConfig, AnalyticsEngine};
pub use error::{AnalyticsError, AnalyticsResult};
pub use report::{CoverageEfficiency, PerformanceReport, StoreHealth};
pub use scoring::{ComponentScore, MaintenancePrediction};
