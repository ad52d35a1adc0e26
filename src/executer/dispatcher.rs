//! Dispatcher workers.
//!
//! A dispatcher is a short-lived thread bound to one session that performs
//! exactly one transaction. It never retries: a failure is logged, and a
//! connection-level failure closes the session so its thread cleans up.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::error::{AlertrError, AlertrResult};
use crate::node::NodeType;
use crate::protocol::{MessageType, ResponseResult, TransactionChannel};
use crate::sensor::{RawSensorAlert, SensorData, SensorId, SensorState};
use crate::session::{Session, SessionRegistry};
use crate::snapshot::{StateChange, SystemSnapshot};

/// Payload of a `sensoralert` message.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorAlertMessage {
    /// Absent for alerts raised by a rule chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<SensorId>,
    pub state: SensorState,
    pub alert_levels: Vec<u32>,
    pub description: String,
    pub rules_activated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional_data: Option<Value>,
    pub change_state: bool,
    pub has_latest_data: bool,
    #[serde(default)]
    pub data: SensorData,
}

impl SensorAlertMessage {
    /// Message for a sensor that triggered alert levels directly.
    #[must_use]
    pub fn from_raw(alert: &RawSensorAlert, alert_levels: Vec<u32>) -> Self {
        Self {
            sensor_id: Some(alert.sensor_id),
            state: alert.state,
            alert_levels,
            description: alert.description.clone(),
            rules_activated: false,
            optional_data: alert.optional_data.clone(),
            change_state: alert.change_state,
            has_latest_data: alert.has_latest_data,
            data: alert.data.clone(),
        }
    }

    /// Message for an alert level whose rule chain fired.
    #[must_use]
    pub fn for_rule(level: u32, name: &str) -> Self {
        Self {
            sensor_id: None,
            state: SensorState::Triggered,
            alert_levels: vec![level],
            description: format!("Rule of Alert Level: '{name}'"),
            rules_activated: true,
            optional_data: None,
            change_state: false,
            has_latest_data: false,
            data: SensorData::None,
        }
    }
}

/// A message pushed to a client.
#[derive(Debug, Clone)]
pub enum Dispatch {
    Status(Arc<SystemSnapshot>),
    SensorAlert(SensorAlertMessage),
    StateChange(StateChange),
    AlertsOff,
}

impl Dispatch {
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Status(_) => MessageType::Status,
            Self::SensorAlert(_) => MessageType::SensorAlert,
            Self::StateChange(_) => MessageType::StateChange,
            Self::AlertsOff => MessageType::SensorAlertsOff,
        }
    }

    fn deliver(&self, channel: &TransactionChannel) -> AlertrResult<ResponseResult> {
        let message = self.message_type();
        match self {
            Self::Status(snapshot) => channel.send_request(message, snapshot.as_ref()),
            Self::SensorAlert(alert) => channel.send_request(message, alert),
            Self::StateChange(change) => channel.send_request(message, change),
            Self::AlertsOff => channel.send_request(message, &Map::new()),
        }
    }
}

/// Delivers `message` to `session` on a new thread.
pub fn dispatch(session: Arc<Session>, message: Dispatch) -> AlertrResult<JoinHandle<()>> {
    let message_type = message.message_type();
    thread::Builder::new()
        .name(format!("alertr-dispatch-{message_type}"))
        .spawn(move || match message.deliver(session.channel()) {
            Ok(result) => {
                debug!(session = %session.id(), peer = session.channel().peer(), msg_type = %message_type, ?result, "dispatched");
            }
            Err(e) if e.is_fatal_to_connection() => {
                warn!(session = %session.id(), peer = session.channel().peer(), msg_type = %message_type, error = %e, "dispatch failed, closing connection");
                session.close();
            }
            Err(e) => {
                warn!(session = %session.id(), msg_type = %message_type, error = %e, "dispatch failed");
            }
        })
        .map_err(|e| AlertrError::internal(format!("failed to spawn dispatcher: {e}")))
}

fn spawn_logged(session: &Arc<Session>, message: Dispatch, handles: &mut Vec<JoinHandle<()>>) {
    match dispatch(Arc::clone(session), message) {
        Ok(handle) => handles.push(handle),
        Err(e) => error!(session = %session.id(), error = %e, "could not start dispatcher"),
    }
}

/// Spawns one dispatcher per initialized session of `node_type`.
pub fn dispatch_to_role<F>(sessions: &SessionRegistry, node_type: NodeType, make: F) -> Vec<JoinHandle<()>>
where
    F: Fn() -> Dispatch,
{
    let mut handles = Vec::new();
    sessions.for_each_session(|s| s.serves(node_type), |s| spawn_logged(s, make(), &mut handles));
    handles
}

/// Spawns one dispatcher per target of a sensor alert.
///
/// Managers receive every alert; alert nodes receive it only for the levels
/// they serve, and only those levels are listed in their copy.
pub fn dispatch_sensor_alert(sessions: &SessionRegistry, message: &SensorAlertMessage) -> Vec<JoinHandle<()>> {
    let mut handles = dispatch_to_role(sessions, NodeType::Manager, || Dispatch::SensorAlert(message.clone()));

    sessions.for_each_session(
        |s| s.serves(NodeType::Alert),
        |s| {
            let served = s.info().map(|info| info.alert_levels).unwrap_or_default();
            let levels: Vec<u32> = message
                .alert_levels
                .iter()
                .copied()
                .filter(|level| served.contains(level))
                .collect();
            if levels.is_empty() {
                return;
            }
            let mut copy = message.clone();
            copy.alert_levels = levels;
            spawn_logged(s, Dispatch::SensorAlert(copy), &mut handles);
        },
    );
    handles
}
