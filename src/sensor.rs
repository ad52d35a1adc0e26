//! Sensors and the raw alerts they raise.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::NodeId;
use crate::time::secs;

/// Server-assigned sensor identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(pub i64);

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sensor state. Travels as `0` (normal) / `1` (triggered) on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SensorState {
    #[default]
    Normal,
    Triggered,
}

impl From<SensorState> for u8 {
    fn from(state: SensorState) -> Self {
        match state {
            SensorState::Normal => 0,
            SensorState::Triggered => 1,
        }
    }
}

impl TryFrom<u8> for SensorState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Triggered),
            other => Err(format!("invalid sensor state {other}")),
        }
    }
}

/// Optional measurement carried by a sensor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SensorData {
    #[default]
    None,
    Int(i64),
    Float(f64),
}

/// A sensor as known to the server.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    pub sensor_id: SensorId,
    pub node_id: NodeId,
    pub client_sensor_id: i64,
    pub description: String,
    pub state: SensorState,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_state_updated: DateTime<Utc>,
    /// Seconds a raw alert of this sensor waits before it counts.
    pub alert_delay: u64,
    pub alert_levels: Vec<u32>,
    #[serde(default)]
    pub data: SensorData,
}

/// Identifier of a stored raw sensor alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawAlertId(Uuid);

impl RawAlertId {
    /// Generates a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RawAlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RawAlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A sensor alert as received from a sensor node, before any policy applies.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct RawSensorAlert {
    pub id: RawAlertId,
    pub sensor_id: SensorId,
    pub node_id: NodeId,
    /// Username of the reporting node; rules address sensors by it.
    pub username: String,
    pub client_sensor_id: i64,
    pub time_received: DateTime<Utc>,
    /// Seconds to wait before the alert counts.
    pub alert_delay: u64,
    pub state: SensorState,
    pub description: String,
    pub optional_data: Option<serde_json::Value>,
    pub change_state: bool,
    pub has_latest_data: bool,
    pub data: SensorData,
}

impl RawSensorAlert {
    /// Configured delay as a duration.
    #[must_use]
    pub fn delay(&self) -> Duration {
        secs(self.alert_delay)
    }

    /// Instant at which the alert stops being delayed.
    #[must_use]
    pub fn activation_time(&self) -> DateTime<Utc> {
        self.time_received + self.delay()
    }

    /// Whether the delay has fully elapsed at `now`.
    #[must_use]
    pub fn delay_elapsed(&self, now: DateTime<Utc>) -> bool {
        now - self.time_received >= self.delay()
    }
}
