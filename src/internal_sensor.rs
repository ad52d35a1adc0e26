//! Sensors of the server itself.
//!
//! The server registers a sensor node of its own. Its sensors turn node and
//! sensor timeouts into ordinary raw sensor alerts, so alert levels and rule
//! chains handle them like any other sensor (rules address them as
//! `alertr.server` plus the client sensor id).

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::{InternalSensorConfig, InternalSensorsConfig};
use crate::context::ServerContext;
use crate::error::AlertrResult;
use crate::node::{Node, NodeId, NodeRegistration, NodeType, SensorRegistration};
use crate::sensor::{RawAlertId, RawSensorAlert, Sensor, SensorData, SensorId, SensorState};
use crate::storage::{SensorUpdate, Storage};

/// Username of the server's own node.
pub const SERVER_USERNAME: &str = "alertr.server";

/// Client sensor id of the node timeout sensor.
pub const NODE_TIMEOUT_SENSOR: i64 = 1;

/// Client sensor id of the sensor timeout sensor.
pub const SENSOR_TIMEOUT_SENSOR: i64 = 2;

#[derive(Debug, Clone)]
struct InternalSensor {
    sensor_id: SensorId,
    client_sensor_id: i64,
    description: String,
    state: SensorState,
}

impl InternalSensor {
    /// Stores a raw alert for this sensor and wakes the executer.
    fn raise(
        &mut self,
        ctx: &ServerContext,
        node_id: NodeId,
        state: SensorState,
        change_state: bool,
        optional_data: Value,
        now: DateTime<Utc>,
    ) -> AlertrResult<()> {
        if change_state {
            self.state = state;
            ctx.storage.update_sensor(
                self.sensor_id,
                &SensorUpdate {
                    state: Some(state),
                    data: None,
                    at: now,
                },
            )?;
        }
        debug!(sensor_id = %self.sensor_id, state = ?state, change_state, "internal sensor alert");
        ctx.storage.add_pending_alert(RawSensorAlert {
            id: RawAlertId::new(),
            sensor_id: self.sensor_id,
            node_id,
            username: SERVER_USERNAME.to_string(),
            client_sensor_id: self.client_sensor_id,
            time_received: now,
            alert_delay: 0,
            state,
            description: self.description.clone(),
            optional_data: Some(optional_data),
            change_state,
            has_latest_data: false,
            data: SensorData::None,
        })?;
        ctx.sensor_alerts.wake();
        Ok(())
    }
}

fn node_fields(node: &Node) -> Value {
    json!({
        "hostname": node.hostname,
        "username": node.username,
        "instance": node.instance,
        "nodeType": node.node_type,
    })
}

fn sensor_fields(node: &Node, sensor: &Sensor) -> Value {
    json!({
        "description": sensor.description,
        "hostname": node.hostname,
        "username": node.username,
        "instance": node.instance,
        "nodeType": node.node_type,
        "lastStateUpdated": sensor.last_state_updated.timestamp(),
    })
}

fn with_message(mut fields: Value, message: String) -> Value {
    if let Value::Object(map) = &mut fields {
        map.insert("message".to_string(), Value::String(message));
    }
    fields
}

/// The server node and whichever internal sensors are configured.
#[derive(Debug, Clone, Default)]
pub struct InternalSensors {
    node_id: Option<NodeId>,
    node_timeout: Option<InternalSensor>,
    sensor_timeout: Option<InternalSensor>,
}

impl InternalSensors {
    /// Registers the server node and its configured sensors.
    ///
    /// Registers nothing when no internal sensor is configured.
    pub fn register(
        storage: &dyn Storage,
        cfg: &InternalSensorsConfig,
        hostname: &str,
        now: DateTime<Utc>,
    ) -> AlertrResult<Self> {
        let declared: Vec<(i64, &InternalSensorConfig)> = [
            (NODE_TIMEOUT_SENSOR, cfg.node_timeout.as_ref()),
            (SENSOR_TIMEOUT_SENSOR, cfg.sensor_timeout.as_ref()),
        ]
        .into_iter()
        .filter_map(|(id, sensor)| sensor.map(|sensor| (id, sensor)))
        .collect();
        if declared.is_empty() {
            return Ok(Self::default());
        }

        let mut registration = NodeRegistration::new(SERVER_USERNAME, NodeType::Sensor);
        registration.hostname = hostname.to_string();
        registration.instance = "server".to_string();
        registration.sensors = declared
            .iter()
            .map(|(client_sensor_id, sensor)| SensorRegistration {
                client_sensor_id: *client_sensor_id,
                description: sensor.description.clone(),
                alert_delay: 0,
                alert_levels: sensor.alert_levels.clone(),
                state: SensorState::Normal,
                data: SensorData::None,
            })
            .collect();
        let node_id = storage.register_node(&registration, now)?;
        storage.mark_node_connected(node_id, true)?;

        let lookup = |client_sensor_id: i64| -> AlertrResult<Option<InternalSensor>> {
            Ok(storage
                .sensor_by_client_id(node_id, client_sensor_id)?
                .map(|sensor| InternalSensor {
                    sensor_id: sensor.sensor_id,
                    client_sensor_id,
                    description: sensor.description,
                    state: sensor.state,
                }))
        };
        let sensors = Self {
            node_id: Some(node_id),
            node_timeout: lookup(NODE_TIMEOUT_SENSOR)?,
            sensor_timeout: lookup(SENSOR_TIMEOUT_SENSOR)?,
        };
        info!(
            node_id = %node_id,
            node_timeout = sensors.node_timeout.is_some(),
            sensor_timeout = sensors.sensor_timeout.is_some(),
            "internal sensors registered"
        );
        Ok(sensors)
    }

    /// Id of the server node, if it was registered.
    #[must_use]
    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id
    }

    /// Whether `id` is the server node.
    #[must_use]
    pub fn is_server_node(&self, id: NodeId) -> bool {
        self.node_id == Some(id)
    }

    /// A persistent node freshly timed out.
    pub fn node_timed_out(&mut self, ctx: &ServerContext, node: &Node, now: DateTime<Utc>) -> AlertrResult<()> {
        let (Some(node_id), Some(sensor)) = (self.node_id, self.node_timeout.as_mut()) else {
            return Ok(());
        };
        let message = format!(
            "Node '{}' with username '{}' on host '{}' timed out.",
            node.instance, node.username, node.hostname
        );
        let change_state = sensor.state == SensorState::Normal;
        sensor.raise(
            ctx,
            node_id,
            SensorState::Triggered,
            change_state,
            with_message(node_fields(node), message),
            now,
        )
    }

    /// A timed out node is back; `still_timed_out` counts the nodes that are not.
    pub fn node_back(
        &mut self,
        ctx: &ServerContext,
        node: &Node,
        still_timed_out: usize,
        now: DateTime<Utc>,
    ) -> AlertrResult<()> {
        let (Some(node_id), Some(sensor)) = (self.node_id, self.node_timeout.as_mut()) else {
            return Ok(());
        };
        let message = format!(
            "Node '{}' with username '{}' on host '{}' reconnected.",
            node.instance, node.username, node.hostname
        );
        let change_state = sensor.state == SensorState::Triggered && still_timed_out == 0;
        sensor.raise(
            ctx,
            node_id,
            SensorState::Normal,
            change_state,
            with_message(node_fields(node), message),
            now,
        )
    }

    /// Reminds about every node that is still timed out.
    pub fn node_reminder(&mut self, ctx: &ServerContext, nodes: &[Node], now: DateTime<Utc>) -> AlertrResult<()> {
        let (Some(node_id), Some(sensor)) = (self.node_id, self.node_timeout.as_mut()) else {
            return Ok(());
        };
        let mut message = format!("{} node(s) still timed out:", nodes.len());
        for node in nodes {
            message.push_str(&format!(
                " Node: '{}', Username: '{}', Hostname: '{}';",
                node.instance, node.username, node.hostname
            ));
        }
        let data = json!({
            "message": message,
            "nodes": nodes.iter().map(node_fields).collect::<Vec<_>>(),
        });
        sensor.raise(ctx, node_id, SensorState::Triggered, false, data, now)
    }

    /// A sensor stopped reporting.
    pub fn sensor_timed_out(
        &mut self,
        ctx: &ServerContext,
        node: &Node,
        timed_out: &Sensor,
        now: DateTime<Utc>,
    ) -> AlertrResult<()> {
        let (Some(node_id), Some(sensor)) = (self.node_id, self.sensor_timeout.as_mut()) else {
            return Ok(());
        };
        let message = format!("Sensor '{}' on host '{}' timed out.", timed_out.description, node.hostname);
        let change_state = sensor.state == SensorState::Normal;
        sensor.raise(
            ctx,
            node_id,
            SensorState::Triggered,
            change_state,
            with_message(sensor_fields(node, timed_out), message),
            now,
        )
    }

    /// A timed out sensor reports again; `still_timed_out` counts the sensors that do not.
    pub fn sensor_back(
        &mut self,
        ctx: &ServerContext,
        node: &Node,
        back: &Sensor,
        still_timed_out: usize,
        now: DateTime<Utc>,
    ) -> AlertrResult<()> {
        let (Some(node_id), Some(sensor)) = (self.node_id, self.sensor_timeout.as_mut()) else {
            return Ok(());
        };
        let message = format!("Sensor '{}' on host '{}' reconnected.", back.description, node.hostname);
        let change_state = sensor.state == SensorState::Triggered && still_timed_out == 0;
        sensor.raise(
            ctx,
            node_id,
            SensorState::Normal,
            change_state,
            with_message(sensor_fields(node, back), message),
            now,
        )
    }

    /// Reminds about every sensor that is still timed out.
    pub fn sensor_reminder(
        &mut self,
        ctx: &ServerContext,
        sensors: &[(Node, Sensor)],
        now: DateTime<Utc>,
    ) -> AlertrResult<()> {
        let (Some(node_id), Some(sensor)) = (self.node_id, self.sensor_timeout.as_mut()) else {
            return Ok(());
        };
        let mut message = format!("{} sensor(s) still timed out:", sensors.len());
        for (node, timed_out) in sensors {
            message.push_str(&format!(
                " Host: '{}', Sensor: '{}', Last seen: {};",
                node.hostname, timed_out.description, timed_out.last_state_updated
            ));
        }
        let data = json!({
            "message": message,
            "sensors": sensors.iter().map(|(node, s)| sensor_fields(node, s)).collect::<Vec<_>>(),
        });
        sensor.raise(ctx, node_id, SensorState::Triggered, false, data, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executer::test_support::context;
    use crate::storage::{InMemoryStorage, NodeStore, PendingAlertStore, SensorStore};
    use crate::time::{from_unix, Clock};

    fn both() -> InternalSensorsConfig {
        InternalSensorsConfig {
            node_timeout: Some(InternalSensorConfig {
                description: "node timeout".to_string(),
                alert_levels: vec![1],
            }),
            sensor_timeout: Some(InternalSensorConfig {
                description: "sensor timeout".to_string(),
                alert_levels: vec![2],
            }),
            ..InternalSensorsConfig::default()
        }
    }

    fn door() -> Node {
        Node {
            node_id: NodeId(42),
            hostname: "hall-pi".to_string(),
            username: "door".to_string(),
            node_type: NodeType::Sensor,
            instance: "sensorClientRaspberryPi".to_string(),
            connected: false,
            version: 0.0,
            rev: 0,
            persistent: true,
        }
    }

    #[test]
    fn test_nothing_registered_without_sensors() {
        let storage = InMemoryStorage::new();
        let sensors = InternalSensors::register(&storage, &InternalSensorsConfig::default(), "srv", from_unix(0)).unwrap();
        assert_eq!(sensors.node_id(), None);
        assert!(storage.nodes().unwrap().is_empty());
    }

    #[test]
    fn test_registers_server_node() {
        let storage = InMemoryStorage::new();
        let sensors = InternalSensors::register(&storage, &both(), "srv", from_unix(0)).unwrap();
        let node_id = sensors.node_id().unwrap();
        let node = storage.node(node_id).unwrap().unwrap();
        assert_eq!(node.username, SERVER_USERNAME);
        assert!(node.connected);
        let sensor = storage.sensor_by_client_id(node_id, SENSOR_TIMEOUT_SENSOR).unwrap().unwrap();
        assert_eq!(sensor.alert_levels, vec![2]);
        assert!(sensors.is_server_node(node_id));
    }

    #[test]
    fn test_node_timeout_toggles_sensor_state() {
        let (ctx, clock, _rx) = context(InMemoryStorage::new(), 100);
        let mut sensors = InternalSensors::register(ctx.storage.as_ref(), &both(), "srv", from_unix(100)).unwrap();
        let node_id = sensors.node_id().unwrap();
        let state = || {
            ctx.storage
                .sensor_by_client_id(node_id, NODE_TIMEOUT_SENSOR)
                .unwrap()
                .unwrap()
                .state
        };

        sensors.node_timed_out(&ctx, &door(), clock.now()).unwrap();
        assert_eq!(state(), SensorState::Triggered);
        sensors.node_timed_out(&ctx, &door(), clock.now()).unwrap();

        // Another node is still out: the alert goes out but the state stays.
        sensors.node_back(&ctx, &door(), 1, clock.now()).unwrap();
        assert_eq!(state(), SensorState::Triggered);
        sensors.node_back(&ctx, &door(), 0, clock.now()).unwrap();
        assert_eq!(state(), SensorState::Normal);

        let alerts = ctx.storage.pending_alerts().unwrap();
        let flags: Vec<(SensorState, bool)> = alerts.iter().map(|a| (a.state, a.change_state)).collect();
        assert_eq!(
            flags,
            vec![
                (SensorState::Triggered, true),
                (SensorState::Triggered, false),
                (SensorState::Normal, false),
                (SensorState::Normal, true),
            ]
        );
        assert!(alerts.iter().all(|a| a.username == SERVER_USERNAME));
        assert_eq!(alerts[0].optional_data.as_ref().unwrap()["username"], "door");
    }

    #[test]
    fn test_unconfigured_sensor_stays_silent() {
        let (ctx, clock, _rx) = context(InMemoryStorage::new(), 100);
        let cfg = InternalSensorsConfig {
            sensor_timeout: None,
            ..both()
        };
        let mut sensors = InternalSensors::register(ctx.storage.as_ref(), &cfg, "srv", from_unix(100)).unwrap();
        let sensor = ctx
            .storage
            .sensor_by_client_id(sensors.node_id().unwrap(), NODE_TIMEOUT_SENSOR)
            .unwrap()
            .unwrap();
        sensors.sensor_timed_out(&ctx, &door(), &sensor, clock.now()).unwrap();
        assert!(ctx.storage.pending_alerts().unwrap().is_empty());
    }

    #[test]
    fn test_reminder_lists_nodes() {
        let (ctx, clock, _rx) = context(InMemoryStorage::new(), 100);
        let mut sensors = InternalSensors::register(ctx.storage.as_ref(), &both(), "srv", from_unix(100)).unwrap();
        sensors.node_reminder(&ctx, &[door()], clock.now()).unwrap();

        let alerts = ctx.storage.pending_alerts().unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(!alerts[0].change_state);
        let data = alerts[0].optional_data.as_ref().unwrap();
        assert!(data["message"].as_str().unwrap().starts_with("1 node(s) still timed out"));
        assert_eq!(data["nodes"][0]["hostname"], "hall-pi");
    }
}
