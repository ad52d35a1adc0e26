//! In-memory storage backend.
//!
//! Thread-safe implementation of the storage traits. It is used by the
//! server binary and by tests, and is the reference for other backends.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::alert_level::AlertLevel;
use crate::node::{AlertRecord, ManagerRecord, Node, NodeId, NodeRegistration};
use crate::sensor::{RawAlertId, RawSensorAlert, Sensor, SensorId};
use crate::snapshot::{AlertLevelRecord, OptionRecord, SystemSnapshot, ALERT_SYSTEM_ACTIVE};
use crate::storage::traits::{
    NodeStore, PendingAlertStore, PolicyStore, SensorStore, SensorUpdate, Storage, StorageError,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<NodeId, Node>,
    sensors: BTreeMap<SensorId, Sensor>,
    managers: BTreeMap<i64, ManagerRecord>,
    alerts: BTreeMap<i64, AlertRecord>,
    alert_levels: BTreeMap<u32, AlertLevel>,
    options: BTreeMap<String, f64>,
    pending: Vec<RawSensorAlert>,
    next_node_id: i64,
    next_sensor_id: i64,
    next_alert_id: i64,
    next_manager_id: i64,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

impl State {
    fn upsert_sensors(&mut self, node_id: NodeId, registration: &NodeRegistration, now: DateTime<Utc>) {
        let mut existing: BTreeMap<i64, SensorId> = self
            .sensors
            .values()
            .filter(|s| s.node_id == node_id)
            .map(|s| (s.client_sensor_id, s.sensor_id))
            .collect();

        for declared in &registration.sensors {
            let sensor_id = existing
                .remove(&declared.client_sensor_id)
                .unwrap_or_else(|| SensorId(next_id(&mut self.next_sensor_id)));
            self.sensors.insert(
                sensor_id,
                Sensor {
                    sensor_id,
                    node_id,
                    client_sensor_id: declared.client_sensor_id,
                    description: declared.description.clone(),
                    state: declared.state,
                    last_state_updated: now,
                    alert_delay: declared.alert_delay,
                    alert_levels: declared.alert_levels.clone(),
                    data: declared.data.clone(),
                },
            );
        }

        for stale in existing.into_values() {
            self.sensors.remove(&stale);
        }
    }

    fn upsert_alerts(&mut self, node_id: NodeId, registration: &NodeRegistration) {
        let mut existing: BTreeMap<i64, i64> = self
            .alerts
            .values()
            .filter(|a| a.node_id == node_id)
            .map(|a| (a.client_alert_id, a.alert_id))
            .collect();

        for declared in &registration.alerts {
            let alert_id = existing
                .remove(&declared.client_alert_id)
                .unwrap_or_else(|| next_id(&mut self.next_alert_id));
            self.alerts.insert(
                alert_id,
                AlertRecord {
                    alert_id,
                    node_id,
                    client_alert_id: declared.client_alert_id,
                    description: declared.description.clone(),
                    alert_levels: declared.alert_levels.clone(),
                },
            );
        }

        for stale in existing.into_values() {
            self.alerts.remove(&stale);
        }
    }

    fn upsert_manager(&mut self, node_id: NodeId, registration: &NodeRegistration) {
        let existing = self.managers.values().find(|m| m.node_id == node_id).map(|m| m.manager_id);
        match &registration.manager {
            Some(declared) => {
                let manager_id = existing.unwrap_or_else(|| next_id(&mut self.next_manager_id));
                self.managers.insert(
                    manager_id,
                    ManagerRecord {
                        manager_id,
                        node_id,
                        description: declared.description.clone(),
                    },
                );
            }
            None => {
                if let Some(id) = existing {
                    self.managers.remove(&id);
                }
            }
        }
    }
}

/// Thread-safe in-memory storage.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: RwLock<State>,
}

impl InMemoryStorage {
    /// Creates empty storage with the alert system switched on.
    #[must_use]
    pub fn new() -> Self {
        let mut state = State::default();
        state.options.insert(ALERT_SYSTEM_ACTIVE.to_string(), 1.0);
        Self {
            state: RwLock::new(state),
        }
    }

    /// Creates storage holding the given alert levels.
    ///
    /// # Errors
    /// - `DuplicateKey`: two levels share a level number
    pub fn with_policy(levels: Vec<AlertLevel>, system_active: bool) -> Result<Self, StorageError> {
        let storage = Self::new();
        storage.set_option(ALERT_SYSTEM_ACTIVE, if system_active { 1.0 } else { 0.0 })?;
        for level in levels {
            storage.insert_alert_level(level)?;
        }
        Ok(storage)
    }

    /// Adds an alert level. Returns error if the level number already exists.
    pub fn insert_alert_level(&self, level: AlertLevel) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("state"))?;
        if state.alert_levels.contains_key(&level.level) {
            return Err(StorageError::DuplicateKey(format!("alert level {}", level.level)));
        }
        state.alert_levels.insert(level.level, level);
        Ok(())
    }
}

impl NodeStore for InMemoryStorage {
    fn register_node(&self, registration: &NodeRegistration, now: DateTime<Utc>) -> Result<NodeId, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("state"))?;

        let existing = state.nodes.values().find(|n| n.username == registration.username).cloned();
        if let Some(node) = &existing {
            if node.node_type != registration.node_type {
                return Err(StorageError::Conflict(format!(
                    "username '{}' is registered as a {} node",
                    registration.username, node.node_type
                )));
            }
        }

        let node_id = match &existing {
            Some(node) => node.node_id,
            None => NodeId(next_id(&mut state.next_node_id)),
        };
        state.nodes.insert(
            node_id,
            Node {
                node_id,
                hostname: registration.hostname.clone(),
                username: registration.username.clone(),
                node_type: registration.node_type,
                instance: registration.instance.clone(),
                connected: existing.is_some_and(|n| n.connected),
                version: registration.version,
                rev: registration.rev,
                persistent: registration.persistent,
            },
        );

        state.upsert_sensors(node_id, registration, now);
        state.upsert_alerts(node_id, registration);
        state.upsert_manager(node_id, registration);
        Ok(node_id)
    }

    fn node(&self, id: NodeId) -> Result<Option<Node>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("state"))?;
        Ok(state.nodes.get(&id).cloned())
    }

    fn nodes(&self) -> Result<Vec<Node>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("state"))?;
        Ok(state.nodes.values().cloned().collect())
    }

    fn mark_node_connected(&self, id: NodeId, connected: bool) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("state"))?;
        let node = state.nodes.get_mut(&id).ok_or(StorageError::NodeNotFound(id))?;
        node.connected = connected;
        Ok(())
    }
}

impl SensorStore for InMemoryStorage {
    fn sensor(&self, id: SensorId) -> Result<Option<Sensor>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("state"))?;
        Ok(state.sensors.get(&id).cloned())
    }

    fn sensor_by_client_id(&self, node_id: NodeId, client_sensor_id: i64) -> Result<Option<Sensor>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("state"))?;
        Ok(state
            .sensors
            .values()
            .find(|s| s.node_id == node_id && s.client_sensor_id == client_sensor_id)
            .cloned())
    }

    fn sensors_updated_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Sensor>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("state"))?;
        Ok(state
            .sensors
            .values()
            .filter(|s| s.last_state_updated < cutoff)
            .cloned()
            .collect())
    }

    fn update_sensor(&self, id: SensorId, update: &SensorUpdate) -> Result<bool, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("state"))?;
        let sensor = state.sensors.get_mut(&id).ok_or(StorageError::SensorNotFound(id))?;
        if update.at < sensor.last_state_updated {
            return Ok(false);
        }
        if let Some(new_state) = update.state {
            sensor.state = new_state;
        }
        if let Some(data) = &update.data {
            sensor.data = data.clone();
        }
        sensor.last_state_updated = update.at;
        Ok(true)
    }
}

impl PendingAlertStore for InMemoryStorage {
    fn add_pending_alert(&self, alert: RawSensorAlert) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("state"))?;
        if state.pending.iter().any(|a| a.id == alert.id) {
            return Err(StorageError::DuplicateKey(format!("sensor alert {}", alert.id)));
        }
        state.pending.push(alert);
        Ok(())
    }

    fn pending_alerts(&self) -> Result<Vec<RawSensorAlert>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("state"))?;
        Ok(state.pending.clone())
    }

    fn delete_pending_alert(&self, id: RawAlertId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("state"))?;
        let idx = state
            .pending
            .iter()
            .position(|a| a.id == id)
            .ok_or(StorageError::AlertNotFound(id))?;
        state.pending.remove(idx);
        Ok(())
    }
}

impl PolicyStore for InMemoryStorage {
    fn alert_levels(&self) -> Result<Vec<AlertLevel>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("state"))?;
        Ok(state.alert_levels.values().cloned().collect())
    }

    fn alert_levels_for_sensor(&self, id: SensorId) -> Result<Vec<AlertLevel>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("state"))?;
        let sensor = state.sensors.get(&id).ok_or(StorageError::SensorNotFound(id))?;
        Ok(sensor
            .alert_levels
            .iter()
            .filter_map(|level| state.alert_levels.get(level).cloned())
            .collect())
    }

    fn is_system_active(&self) -> Result<bool, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("state"))?;
        Ok(state.options.get(ALERT_SYSTEM_ACTIVE).is_some_and(|v| *v > 0.0))
    }

    fn set_option(&self, option_type: &str, value: f64) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("state"))?;
        state.options.insert(option_type.to_string(), value);
        Ok(())
    }

    fn options(&self) -> Result<Vec<OptionRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("state"))?;
        Ok(state
            .options
            .iter()
            .map(|(option_type, value)| OptionRecord {
                option_type: option_type.clone(),
                value: *value,
            })
            .collect())
    }
}

impl Storage for InMemoryStorage {
    fn snapshot(&self) -> Result<SystemSnapshot, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("state"))?;
        Ok(SystemSnapshot {
            options: state
                .options
                .iter()
                .map(|(option_type, value)| OptionRecord {
                    option_type: option_type.clone(),
                    value: *value,
                })
                .collect(),
            nodes: state.nodes.values().cloned().collect(),
            sensors: state.sensors.values().cloned().collect(),
            managers: state.managers.values().cloned().collect(),
            alerts: state.alerts.values().cloned().collect(),
            alert_levels: state.alert_levels.values().map(AlertLevelRecord::from).collect(),
        })
    }
}
