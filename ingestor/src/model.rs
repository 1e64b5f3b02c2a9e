use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Inbound telemetry report, as sent by devices over HTTP or MQTT.
///
/// Coordinates and sensors are optional at the wire level: `null` and a
/// missing key both read as `None`, while `0.0` is a real value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    #[serde(rename = "identificador", default, deserialize_with = "null_as_empty")]
    pub identifier: String,
    #[serde(rename = "latitud", default)]
    pub latitude: Option<f64>,
    #[serde(rename = "longitud", default)]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_3: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_4: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_5: Option<f64>,
}

/// `null` reads like an absent identifier so it reaches validation.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl TelemetryReport {
    /// Both coordinates, when the report carries a full fix.
    pub fn position(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }

    /// Sensor readings in slot order, 1-based index alongside each value.
    pub fn sensors(&self) -> [(u8, Option<f64>); 5] {
        [
            (1, self.sensor_1),
            (2, self.sensor_2),
            (3, self.sensor_3),
            (4, self.sensor_4),
            (5, self.sensor_5),
        ]
    }
}

/// A registered telemetry device.
///
/// `max_offline` keeps the stored `HH:MM:SS` form; it is parsed by the
/// staleness policy when a report arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub identifier: String,
    pub name: String,
    pub last_contact: DateTime<Utc>,
    pub max_offline: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Device {
    pub fn position(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }
}

/// One stored telemetry sample. `id` is assigned by the repository.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub id: Option<i64>,
    pub device_id: i64,
    pub recorded_at: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub distance: Option<f64>,
    pub sensor_1: Option<f64>,
    pub sensor_2: Option<f64>,
    pub sensor_3: Option<f64>,
    pub sensor_4: Option<f64>,
    pub sensor_5: Option<f64>,
}

/// Append-only audit row describing why a report was rejected or flagged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub id: Option<i64>,
    pub device_id: Option<i64>,
    pub identifier: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub description: String,
}

/// A missing required field in an inbound report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: &'static str,
    pub message: &'static str,
}
