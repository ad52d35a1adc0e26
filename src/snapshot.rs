//! Full system status snapshots and their manager-side mirror.
//!
//! The server sends a [`SystemSnapshot`] as the `status` payload. A manager
//! keeps a [`SnapshotMirror`] of it and folds in `statechange` deltas. A
//! snapshot that contradicts itself is rejected whole and the mirror keeps
//! its previous contents.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alert_level::AlertLevel;
use crate::error::ConsistencyError;
use crate::node::{AlertRecord, ManagerRecord, Node, NodeId};
use crate::sensor::{Sensor, SensorData, SensorId, SensorState};

/// Name of the option that switches the alert system on and off.
pub const ALERT_SYSTEM_ACTIVE: &str = "alertSystemActive";

/// A system option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionRecord {
    #[serde(rename = "type")]
    pub option_type: String,
    pub value: f64,
}

/// Alert level as exposed to managers (policy only, no rule state).
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertLevelRecord {
    pub alert_level: u32,
    pub name: String,
    pub trigger_always: bool,
    pub rules_activated: bool,
}

impl From<&AlertLevel> for AlertLevelRecord {
    fn from(level: &AlertLevel) -> Self {
        Self {
            alert_level: level.level,
            name: level.name.clone(),
            trigger_always: level.trigger_always,
            rules_activated: level.rules_activated(),
        }
    }
}

/// Everything a manager needs to rebuild its view of the system.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub options: Vec<OptionRecord>,
    pub nodes: Vec<Node>,
    pub sensors: Vec<Sensor>,
    pub managers: Vec<ManagerRecord>,
    pub alerts: Vec<AlertRecord>,
    pub alert_levels: Vec<AlertLevelRecord>,
}

/// A single sensor state delta.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub sensor_id: SensorId,
    pub state: SensorState,
    #[serde(default)]
    pub data: SensorData,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub changed_at: DateTime<Utc>,
}

/// Manager-side copy of the server's state.
#[derive(Debug, Default, Clone)]
pub struct SnapshotMirror {
    options: BTreeMap<String, f64>,
    nodes: BTreeMap<NodeId, Node>,
    sensors: BTreeMap<SensorId, Sensor>,
    managers: BTreeMap<i64, ManagerRecord>,
    alerts: BTreeMap<i64, AlertRecord>,
    alert_levels: BTreeMap<u32, AlertLevelRecord>,
}

fn insert_unique<K: Ord + ToString, V>(
    map: &mut BTreeMap<K, V>,
    kind: &'static str,
    key: K,
    value: V,
) -> Result<(), ConsistencyError> {
    if map.contains_key(&key) {
        return Err(ConsistencyError::DuplicateKey {
            kind,
            id: key.to_string(),
        });
    }
    map.insert(key, value);
    Ok(())
}

impl SnapshotMirror {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the mirror with `snapshot`, or leaves it untouched on error.
    ///
    /// A sensor whose stored state is newer than the snapshot's keeps its state.
    pub fn ingest(&mut self, snapshot: &SystemSnapshot) -> Result<(), ConsistencyError> {
        let mut next = Self::default();

        for option in &snapshot.options {
            insert_unique(&mut next.options, "option", option.option_type.clone(), option.value)?;
        }
        for node in &snapshot.nodes {
            insert_unique(&mut next.nodes, "node", node.node_id, node.clone())?;
        }
        for sensor in &snapshot.sensors {
            next.require_node("sensor", sensor.sensor_id.0, sensor.node_id)?;
            let mut sensor = sensor.clone();
            if let Some(old) = self.sensors.get(&sensor.sensor_id) {
                if old.last_state_updated > sensor.last_state_updated {
                    sensor.state = old.state;
                    sensor.data = old.data.clone();
                    sensor.last_state_updated = old.last_state_updated;
                }
            }
            insert_unique(&mut next.sensors, "sensor", sensor.sensor_id, sensor)?;
        }
        for manager in &snapshot.managers {
            next.require_node("manager", manager.manager_id, manager.node_id)?;
            insert_unique(&mut next.managers, "manager", manager.manager_id, manager.clone())?;
        }
        for alert in &snapshot.alerts {
            next.require_node("alert", alert.alert_id, alert.node_id)?;
            insert_unique(&mut next.alerts, "alert", alert.alert_id, alert.clone())?;
        }
        for level in &snapshot.alert_levels {
            insert_unique(&mut next.alert_levels, "alert level", level.alert_level, level.clone())?;
        }

        *self = next;
        Ok(())
    }

    fn require_node(&self, kind: &'static str, id: i64, node_id: NodeId) -> Result<(), ConsistencyError> {
        if self.nodes.contains_key(&node_id) {
            Ok(())
        } else {
            Err(ConsistencyError::DanglingReference {
                kind,
                id: id.to_string(),
                node_id: node_id.0,
            })
        }
    }

    /// Applies a state delta unless the mirror already holds newer state.
    ///
    /// Returns false for unknown sensors and stale deltas.
    pub fn apply_state_change(&mut self, change: &StateChange) -> bool {
        let Some(sensor) = self.sensors.get_mut(&change.sensor_id) else {
            return false;
        };
        if sensor.last_state_updated > change.changed_at {
            return false;
        }
        sensor.state = change.state;
        sensor.data = change.data.clone();
        sensor.last_state_updated = change.changed_at;
        true
    }

    /// Re-emits the mirror as a snapshot.
    #[must_use]
    pub fn to_snapshot(&self) -> SystemSnapshot {
        SystemSnapshot {
            options: self
                .options
                .iter()
                .map(|(option_type, value)| OptionRecord {
                    option_type: option_type.clone(),
                    value: *value,
                })
                .collect(),
            nodes: self.nodes.values().cloned().collect(),
            sensors: self.sensors.values().cloned().collect(),
            managers: self.managers.values().cloned().collect(),
            alerts: self.alerts.values().cloned().collect(),
            alert_levels: self.alert_levels.values().cloned().collect(),
        }
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn sensor(&self, id: SensorId) -> Option<&Sensor> {
        self.sensors.get(&id)
    }

    #[must_use]
    pub fn option(&self, option_type: &str) -> Option<f64> {
        self.options.get(option_type).copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
