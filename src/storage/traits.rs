//! Abstract storage traits for AlertR.
//!
//! The core never talks to a database directly. It needs a small read/write
//! port over nodes, sensors, raw sensor alerts, alert levels and options;
//! backends implement these traits.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::alert_level::AlertLevel;
use crate::node::{Node, NodeId, NodeRegistration};
use crate::sensor::{RawAlertId, RawSensorAlert, Sensor, SensorData, SensorId, SensorState};
use crate::snapshot::{OptionRecord, SystemSnapshot};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Node not found.
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Sensor not found.
    #[error("Sensor not found: {0}")]
    SensorNotFound(SensorId),

    /// Raw sensor alert not found.
    #[error("Sensor alert not found: {0}")]
    AlertNotFound(RawAlertId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// A stored record contradicts the request.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

/// A sensor update reported by its node.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorUpdate {
    /// New state, if the report changes it.
    pub state: Option<SensorState>,
    /// New measurement, if the report carries one.
    pub data: Option<SensorData>,
    /// When the node reported it.
    pub at: DateTime<Utc>,
}

/// Storage trait for node records.
pub trait NodeStore: Send + Sync {
    /// Creates or refreshes the node registered under `registration.username`,
    /// replacing its sensors, alerts and manager record.
    ///
    /// # Errors
    /// - `Conflict`: the username is already registered with a different node type
    fn register_node(&self, registration: &NodeRegistration, now: DateTime<Utc>) -> Result<NodeId, StorageError>;

    /// Get a node by ID.
    fn node(&self, id: NodeId) -> Result<Option<Node>, StorageError>;

    /// List all nodes.
    fn nodes(&self) -> Result<Vec<Node>, StorageError>;

    /// Set the connected flag of a node.
    fn mark_node_connected(&self, id: NodeId, connected: bool) -> Result<(), StorageError>;
}

/// Storage trait for sensor records.
pub trait SensorStore: Send + Sync {
    /// Get a sensor by ID.
    fn sensor(&self, id: SensorId) -> Result<Option<Sensor>, StorageError>;

    /// Find a sensor by the id its node uses for it.
    fn sensor_by_client_id(&self, node_id: NodeId, client_sensor_id: i64) -> Result<Option<Sensor>, StorageError>;

    /// Sensors whose last state update is older than `cutoff`.
    fn sensors_updated_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Sensor>, StorageError>;

    /// Apply a sensor update.
    ///
    /// Updates older than the stored `last_state_updated` are discarded and
    /// `Ok(false)` is returned.
    fn update_sensor(&self, id: SensorId, update: &SensorUpdate) -> Result<bool, StorageError>;
}

/// Storage trait for raw sensor alerts awaiting the executer.
pub trait PendingAlertStore: Send + Sync {
    /// Store a new raw sensor alert.
    fn add_pending_alert(&self, alert: RawSensorAlert) -> Result<(), StorageError>;

    /// All stored raw sensor alerts, oldest first.
    fn pending_alerts(&self) -> Result<Vec<RawSensorAlert>, StorageError>;

    /// Remove a raw sensor alert. Returns error if not found.
    fn delete_pending_alert(&self, id: RawAlertId) -> Result<(), StorageError>;
}

/// Storage trait for alert levels and system options.
pub trait PolicyStore: Send + Sync {
    /// All configured alert levels, ordered by level.
    fn alert_levels(&self) -> Result<Vec<AlertLevel>, StorageError>;

    /// Alert levels the given sensor is assigned to.
    fn alert_levels_for_sensor(&self, id: SensorId) -> Result<Vec<AlertLevel>, StorageError>;

    /// Whether the alert system is switched on.
    fn is_system_active(&self) -> Result<bool, StorageError>;

    /// Set an option value, creating it if needed.
    fn set_option(&self, option_type: &str, value: f64) -> Result<(), StorageError>;

    /// All options.
    fn options(&self) -> Result<Vec<OptionRecord>, StorageError>;
}

/// The complete storage port used by the server.
pub trait Storage: NodeStore + SensorStore + PendingAlertStore + PolicyStore + std::fmt::Debug {
    /// Consistent copy of everything managers are shown.
    fn snapshot(&self) -> Result<SystemSnapshot, StorageError>;
}
