//! Shared data model for the MowOS data core.
//!
//! Every record that crosses a subsystem boundary — sensor readings, the
//! operational state, configuration entries, telemetry rows, checkpoints —
//! is defined here so that the cache, store, state machine, and analytics
//! crates agree on one serialized shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Free-form metadata attached to readings, states, and config entries.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Errors raised when constructing model values from untrusted input.
#[derive(Debug, Error)]
pub enum TypeError {
    /// Reading quality must lie in `[0.0, 1.0]`.
    #[error("quality {0} out of range [0, 1]")]
    QualityOutOfRange(f64),

    /// Progress must lie in `[0.0, 1.0]`.
    #[error("progress {0} out of range [0, 1]")]
    ProgressOutOfRange(f64),

    /// A required identifier field was empty.
    #[error("empty field: {0}")]
    EmptyField(&'static str),
}

// ---------------------------------------------------------------------------
// Sensor readings
// ---------------------------------------------------------------------------

/// One immutable sensor sample.
///
/// The `value` payload is schema-less on purpose: drivers report anything
/// from a bare number to a nested object, and the single serde boundary at
/// the store keeps every consumer agnostic of the shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    pub sensor_type: String,
    pub timestamp: DateTime<Utc>,
    pub value: serde_json::Value,
    pub unit: String,
    /// Confidence of the sample, `0.0` (garbage) to `1.0` (trusted).
    pub quality: f64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl SensorReading {
    /// Build a reading stamped with the current time.
    ///
    /// Rejects empty identifiers and out-of-range quality so that malformed
    /// driver output never reaches the store.
    pub fn new(
        sensor_id: impl Into<String>,
        sensor_type: impl Into<String>,
        value: serde_json::Value,
        unit: impl Into<String>,
        quality: f64,
    ) -> Result<Self, TypeError> {
        let sensor_id = sensor_id.into();
        if sensor_id.is_empty() {
            return Err(TypeError::EmptyField("sensor_id"));
        }
        let sensor_type = sensor_type.into();
        if sensor_type.is_empty() {
            return Err(TypeError::EmptyField("sensor_type"));
        }
        if !(0.0..=1.0).contains(&quality) || quality.is_nan() {
            return Err(TypeError::QualityOutOfRange(quality));
        }

        Ok(Self {
            sensor_id,
            sensor_type,
            timestamp: Utc::now(),
            value,
            unit: unit.into(),
            quality,
            metadata: Metadata::new(),
        })
    }

    /// Attach metadata, replacing any existing map.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// The payload as a scalar, when it is a bare number.
    ///
    /// Structured payloads return `None` and are excluded from numeric
    /// analytics such as anomaly detection.
    pub fn scalar_value(&self) -> Option<f64> {
        self.value.as_f64()
    }
}

// ---------------------------------------------------------------------------
// Operational state
// ---------------------------------------------------------------------------

/// The mutually exclusive top-level states a mower can be in.
///
/// `Unknown` carries any state string we do not recognize — typically a
/// legacy value recovered from an older installation. It is round-tripped
/// verbatim so that a newer controller never destroys state it does not
/// understand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum MowerState {
    Starting,
    Idle,
    Active,
    Navigating,
    Charging,
    Error,
    EmergencyStop,
    Maintenance,
    ShuttingDown,
    Unknown(String),
}

impl MowerState {
    /// Canonical lowercase wire name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Navigating => "navigating",
            Self::Charging => "charging",
            Self::Error => "error",
            Self::EmergencyStop => "emergency_stop",
            Self::Maintenance => "maintenance",
            Self::ShuttingDown => "shutting_down",
            Self::Unknown(s) => s,
        }
    }

    /// Parse a wire name. Total: unrecognized input becomes `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "starting" => Self::Starting,
            "idle" => Self::Idle,
            "active" => Self::Active,
            "navigating" => Self::Navigating,
            "charging" => Self::Charging,
            "error" => Self::Error,
            "emergency_stop" => Self::EmergencyStop,
            "maintenance" => Self::Maintenance,
            "shutting_down" => Self::ShuttingDown,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Whether this is a state the current firmware recognizes.
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl From<MowerState> for String {
    fn from(state: MowerState) -> Self {
        state.as_str().to_string()
    }
}

impl From<String> for MowerState {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl std::fmt::Display for MowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating mode, orthogonal to [`MowerState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpMode {
    Automatic,
    Manual,
    Safety,
    Service,
}

impl OpMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
            Self::Safety => "safety",
            Self::Service => "service",
        }
    }

    /// Parse a wire name, falling back to `Automatic` for unknown input.
    pub fn parse(s: &str) -> Self {
        match s {
            "manual" => Self::Manual,
            "safety" => Self::Safety,
            "service" => Self::Service,
            _ => Self::Automatic,
        }
    }
}

/// The single live operational snapshot of the machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationalState {
    pub state: MowerState,
    pub mode: OpMode,
    /// Battery charge, `0.0`–`1.0`.
    pub battery_level: f64,
    pub current_task: Option<String>,
    /// Task progress, `0.0`–`1.0`.
    pub progress: f64,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Default for OperationalState {
    fn default() -> Self {
        Self {
            state: MowerState::Starting,
            mode: OpMode::Automatic,
            battery_level: 0.0,
            current_task: None,
            progress: 0.0,
            estimated_completion: None,
            last_update: Utc::now(),
            metadata: Metadata::new(),
        }
    }
}

/// One accepted state change, kept in the bounded audit ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: MowerState,
    pub to: MowerState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// A named, restorable snapshot of operational state plus recovery data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub state: OperationalState,
    pub recovery_data: Metadata,
    pub transitions: Vec<StateTransition>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Declared type of a configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigDataType {
    String,
    Integer,
    Float,
    Boolean,
    Json,
}

impl ConfigDataType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Json => "json",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "string" => Self::String,
            "integer" => Self::Integer,
            "float" => Self::Float,
            "boolean" => Self::Boolean,
            _ => Self::Json,
        }
    }

    /// Infer the declared type from a JSON value.
    pub fn infer(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(_) => Self::String,
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            serde_json::Value::Number(_) => Self::Float,
            serde_json::Value::Bool(_) => Self::Boolean,
            _ => Self::Json,
        }
    }
}

/// One versioned configuration entry, unique per `(section, key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationEntry {
    pub section: String,
    pub key: String,
    pub value: serde_json::Value,
    pub data_type: ConfigDataType,
    pub last_modified: DateTime<Utc>,
    /// Incremented on every write to the same `(section, key)`.
    pub version: i64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ConfigurationEntry {
    /// Build a version-1 entry with the type inferred from the value.
    pub fn new(
        section: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<Self, TypeError> {
        let section = section.into();
        if section.is_empty() {
            return Err(TypeError::EmptyField("section"));
        }
        let key = key.into();
        if key.is_empty() {
            return Err(TypeError::EmptyField("key"));
        }
        let data_type = ConfigDataType::infer(&value);
        Ok(Self {
            section,
            key,
            value,
            data_type,
            last_modified: Utc::now(),
            version: 1,
            metadata: Metadata::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Append-only performance sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub metric_name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub category: String,
    #[serde(default)]
    pub tags: Metadata,
}

/// Severity of an operational log line or analytics alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Log level for persisted operational logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "debug" => Self::Debug,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// One persisted operational log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationalLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    #[serde(default)]
    pub context: Metadata,
    pub correlation_id: Option<Uuid>,
}

impl OperationalLog {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            context: Metadata::new(),
            correlation_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_rejects_bad_quality() {
        assert!(SensorReading::new("s1", "battery", serde_json::json!(1.0), "v", 1.5).is_err());
        assert!(SensorReading::new("s1", "battery", serde_json::json!(1.0), "v", -0.1).is_err());
        assert!(SensorReading::new("s1", "battery", serde_json::json!(1.0), "v", f64::NAN).is_err());
        assert!(SensorReading::new("s1", "battery", serde_json::json!(1.0), "v", 0.95).is_ok());
    }

    #[test]
    fn reading_rejects_empty_ids() {
        assert!(SensorReading::new("", "battery", serde_json::json!(0), "v", 0.5).is_err());
        assert!(SensorReading::new("s1", "", serde_json::json!(0), "v", 0.5).is_err());
    }

    #[test]
    fn scalar_value_excludes_structured_payloads() {
        let scalar =
            SensorReading::new("s1", "battery", serde_json::json!(12.6), "V", 1.0).unwrap();
        assert_eq!(scalar.scalar_value(), Some(12.6));

        let structured =
            SensorReading::new("s1", "battery", serde_json::json!({"voltage": 12.6}), "V", 1.0)
                .unwrap();
        assert_eq!(structured.scalar_value(), None);
    }

    #[test]
    fn mower_state_roundtrips_through_strings() {
        for state in [
            MowerState::Starting,
            MowerState::Idle,
            MowerState::Active,
            MowerState::Navigating,
            MowerState::Charging,
            MowerState::Error,
            MowerState::EmergencyStop,
            MowerState::Maintenance,
            MowerState::ShuttingDown,
        ] {
            assert_eq!(MowerState::parse(state.as_str()), state);
        }
    }

    #[test]
    fn unknown_state_is_preserved_verbatim() {
        let state = MowerState::parse("legacy_docking");
        assert_eq!(state, MowerState::Unknown("legacy_docking".to_string()));
        assert!(!state.is_recognized());

        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, "\"legacy_docking\"");
        let back: MowerState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn operational_state_serde_roundtrip() {
        let mut state = OperationalState::default();
        state.state = MowerState::Active;
        state.current_task = Some("zone_a".to_string());
        state
            .metadata
            .insert("blade_rpm".to_string(), serde_json::json!(2800));

        let json = serde_json::to_string(&state).unwrap();
        let back: OperationalState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, MowerState::Active);
        assert_eq!(back.current_task.as_deref(), Some("zone_a"));
        assert_eq!(back.metadata["blade_rpm"], serde_json::json!(2800));
    }

    #[test]
    fn config_data_type_inference() {
        assert_eq!(
            ConfigDataType::infer(&serde_json::json!("hello")),
            ConfigDataType::String
        );
        assert_eq!(
            ConfigDataType::infer(&serde_json::json!(42)),
            ConfigDataType::Integer
        );
        assert_eq!(
            ConfigDataType::infer(&serde_json::json!(0.5)),
            ConfigDataType::Float
        );
        assert_eq!(
            ConfigDataType::infer(&serde_json::json!(true)),
            ConfigDataType::Boolean
        );
        assert_eq!(
            ConfigDataType::infer(&serde_json::json!({"a": 1})),
            ConfigDataType::Json
        );
    }

    #[test]
    fn configuration_entry_starts_at_version_one() {
        let entry =
            ConfigurationEntry::new("mowing", "blade_height_mm", serde_json::json!(35)).unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.data_type, ConfigDataType::Integer);
        assert!(ConfigurationEntry::new("", "k", serde_json::json!(1)).is_err());
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn checkpoint_serde_roundtrip() {
        let checkpoint = Checkpoint {
            name: "pre_update".to_string(),
            created_at: Utc::now(),
            state: OperationalState::default(),
            recovery_data: Metadata::new(),
            transitions: vec![StateTransition {
                from: MowerState::Starting,
                to: MowerState::Idle,
                timestamp: Utc::now(),
                reason: None,
            }],
        };
        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "pre_update");
        assert_eq!(back.transitions.len(), 1);
        assert_eq!(back.transitions[0].to, MowerState::Idle);
    }
}
