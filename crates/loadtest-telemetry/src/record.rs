//! Synthetic telemetry and alarm records.
//!
//! Every numeric field is drawn from a fixed inclusive range, so generated
//! records always fit the downstream schemas no matter which seed is used.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Alarm types the generator draws from.
pub const ALARM_TYPES: [&str; 3] = ["HIGH_TEMP", "LOW_BATTERY", "HIGH_HUMIDITY"];

/// Device id used when a run does not name one.
pub const DEFAULT_DEVICE_ID: &str = "test-device-001";

/// The two record shapes a run can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Telemetry,
    Alarm,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Telemetry, RecordKind::Alarm];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Telemetry => "telemetry",
            RecordKind::Alarm => "alarm",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "telemetry" => Ok(RecordKind::Telemetry),
            "alarm" | "alarms" => Ok(RecordKind::Alarm),
            other => Err(format!("unknown record kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub id: i64,
    pub device_id: String,
    pub timestamp: String,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub battery: f64,
    pub signal_strength: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmRecord {
    pub id: i64,
    pub device_id: String,
    pub timestamp: String,
    pub alarm_type: String,
    pub severity: i32,
    pub code: i32,
    pub message: String,
}

/// A logical record of either kind.
///
/// Untagged on the wire: the two shapes share no required numeric fields, so
/// plain JSON decodes unambiguously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Record {
    Telemetry(TelemetryRecord),
    Alarm(AlarmRecord),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Telemetry(_) => RecordKind::Telemetry,
            Record::Alarm(_) => RecordKind::Alarm,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            Record::Telemetry(r) => &r.device_id,
            Record::Alarm(r) => &r.device_id,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Record::Telemetry(r) => r.id,
            Record::Alarm(r) => r.id,
        }
    }
}

/// Seeded generator for synthetic records.
pub struct RecordGenerator {
    rng: StdRng,
    device_id: String,
}

impl RecordGenerator {
    /// Create a generator. `None` seeds from OS entropy.
    pub fn new(seed: Option<u64>, device_id: impl Into<String>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            device_id: device_id.into(),
        }
    }

    /// Generate record number `id` (1-based) of the given kind.
    pub fn generate(&mut self, kind: RecordKind, id: i64) -> Record {
        match kind {
            RecordKind::Telemetry => Record::Telemetry(self.telemetry(id)),
            RecordKind::Alarm => Record::Alarm(self.alarm(id)),
        }
    }

    fn telemetry(&mut self, id: i64) -> TelemetryRecord {
        TelemetryRecord {
            id,
            device_id: self.device_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            temperature: self.float_range(20.0, 30.0),
            humidity: self.float_range(40.0, 60.0),
            pressure: self.float_range(1000.0, 1020.0),
            battery: self.float_range(80.0, 100.0),
            signal_strength: self.rng.gen_range(-90..=-50),
        }
    }

    fn alarm(&mut self, id: i64) -> AlarmRecord {
        let alarm_type = ALARM_TYPES[self.rng.gen_range(0..ALARM_TYPES.len())];
        let now = Utc::now();
        AlarmRecord {
            id,
            device_id: self.device_id.clone(),
            timestamp: now.to_rfc3339(),
            alarm_type: alarm_type.to_string(),
            severity: self.rng.gen_range(1..=3),
            code: self.rng.gen_range(100..=200),
            message: format!("Test alarm message {}", now.timestamp_millis()),
        }
    }

    /// Uniform value in `[min, max]`, rounded to two decimals.
    fn float_range(&mut self, min: f64, max: f64) -> f64 {
        let value: f64 = self.rng.gen_range(min..=max);
        ((value * 100.0).round() / 100.0).clamp(min, max)
    }
}
