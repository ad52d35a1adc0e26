//! Nodes of the mesh and the records they register.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sensor::{SensorData, SensorState};

/// Server-assigned node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub i64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role a node plays in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Reports sensor state.
    Sensor,
    /// Acts on sensor alerts.
    Alert,
    /// Observes and configures the whole system.
    Manager,
}

impl NodeType {
    /// Wire name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::Alert => "alert",
            Self::Manager => "manager",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered node.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: NodeId,
    pub hostname: String,
    pub username: String,
    pub node_type: NodeType,
    pub instance: String,
    pub connected: bool,
    pub version: f64,
    pub rev: i64,
    /// Persistent nodes are expected to stay connected; losing them is reported.
    pub persistent: bool,
}

/// Manager record as exposed in status snapshots.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerRecord {
    pub manager_id: i64,
    pub node_id: NodeId,
    pub description: String,
}

/// Alert record as exposed in status snapshots.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub alert_id: i64,
    pub node_id: NodeId,
    pub client_alert_id: i64,
    pub description: String,
    pub alert_levels: Vec<u32>,
}

/// What a node announces about itself when it connects.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegistration {
    pub username: String,
    pub hostname: String,
    pub node_type: NodeType,
    pub instance: String,
    #[serde(default)]
    pub version: f64,
    #[serde(default)]
    pub rev: i64,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub sensors: Vec<SensorRegistration>,
    #[serde(default)]
    pub alerts: Vec<AlertRegistration>,
    #[serde(default)]
    pub manager: Option<ManagerRegistration>,
}

impl NodeRegistration {
    /// A registration with no sensors, alerts or manager description.
    #[must_use]
    pub fn new(username: impl Into<String>, node_type: NodeType) -> Self {
        let username = username.into();
        Self {
            hostname: format!("{username}-host"),
            instance: node_type.as_str().to_string(),
            username,
            node_type,
            version: 0.0,
            rev: 0,
            persistent: false,
            sensors: Vec::new(),
            alerts: Vec::new(),
            manager: None,
        }
    }
}

/// A sensor declared by a sensor node.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRegistration {
    pub client_sensor_id: i64,
    pub description: String,
    #[serde(default)]
    pub alert_delay: u64,
    pub alert_levels: Vec<u32>,
    #[serde(default)]
    pub state: SensorState,
    #[serde(default)]
    pub data: SensorData,
}

/// An alert declared by an alert node.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRegistration {
    pub client_alert_id: i64,
    pub description: String,
    pub alert_levels: Vec<u32>,
}

/// Description a manager node registers with.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerRegistration {
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_wire_names() {
        assert_eq!(serde_json::to_string(&NodeType::Manager).unwrap(), "\"manager\"");
        let parsed: NodeType = serde_json::from_str("\"alert\"").unwrap();
        assert_eq!(parsed, NodeType::Alert);
        assert_eq!(NodeType::Sensor.to_string(), "sensor");
    }

    #[test]
    fn test_node_serializes_camel_case() {
        let node = Node {
            node_id: NodeId(3),
            hostname: "pi".to_string(),
            username: "sensor_kitchen".to_string(),
            node_type: NodeType::Sensor,
            instance: "sensorClientRaspberryPi".to_string(),
            connected: true,
            version: 0.9,
            rev: 1,
            persistent: false,
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["nodeId"], 3);
        assert_eq!(json["nodeType"], "sensor");
    }
}
