//! Per-connection handling.
//!
//! The first transaction of every connection is `initialization`, carrying
//! the node's full registration. After that the session thread serves the
//! client's requests until the connection fails, is closed by the watchdog,
//! or the server shuts down. What a client may send depends on its node type.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::context::ServerContext;
use crate::error::{AlertrError, AlertrResult, ProtocolError, TransportError};
use crate::executer::OptionChange;
use crate::node::{NodeRegistration, NodeType};
use crate::protocol::{InboundRequest, MessageType, ResponseResult};
use crate::sensor::{RawAlertId, RawSensorAlert, Sensor, SensorData, SensorState};
use crate::snapshot::StateChange;
use crate::storage::SensorUpdate;

use super::{Session, SessionInfo};

/// Payload of a `sensoralert` request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SensorAlertRequest {
    client_sensor_id: i64,
    state: SensorState,
    #[serde(default)]
    optional_data: Option<Value>,
    #[serde(default)]
    change_state: bool,
    #[serde(default)]
    has_latest_data: bool,
    #[serde(default)]
    data: SensorData,
}

/// Payload of a `statechange` request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateChangeRequest {
    client_sensor_id: i64,
    state: SensorState,
    #[serde(default)]
    data: Option<SensorData>,
}

/// One sensor of a `status` request sent by a sensor node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SensorStatus {
    client_sensor_id: i64,
    state: SensorState,
    #[serde(default)]
    data: Option<SensorData>,
}

#[derive(Debug, Clone, Deserialize)]
struct SensorStatusRequest {
    sensors: Vec<SensorStatus>,
}

/// Serves one connection until it ends, then unregisters it.
pub fn run_session(ctx: &Arc<ServerContext>, session: &Arc<Session>) {
    let peer = session.channel().peer().to_string();
    info!(session = %session.id(), peer = %peer, "connection accepted");

    match serve(ctx, session) {
        Ok(()) => info!(session = %session.id(), peer = %peer, "session ended"),
        Err(AlertrError::Protocol(ProtocolError::Closed)) => {
            info!(session = %session.id(), peer = %peer, "connection closed");
        }
        Err(e) if e.is_fatal_to_connection() => {
            warn!(session = %session.id(), peer = %peer, error = %e, "connection failed");
        }
        Err(e) => error!(session = %session.id(), peer = %peer, error = %e, "session aborted"),
    }
    cleanup(ctx, session);
}

fn serve(ctx: &ServerContext, session: &Session) -> AlertrResult<()> {
    let info = register(ctx, session)?;
    synchronize(ctx, session, &info)?;

    while !ctx.is_shutting_down() {
        let Some(request) = session.channel().poll_request()? else {
            continue;
        };
        session.touch(ctx.clock.now());
        handle_request(ctx, &info, request)?;
    }
    Ok(())
}

fn register(ctx: &ServerContext, session: &Session) -> AlertrResult<SessionInfo> {
    let timeout = ctx.settings.registration_timeout;
    let deadline = Instant::now() + timeout;
    let request = loop {
        if let Some(request) = session.channel().poll_request()? {
            break request;
        }
        if Instant::now() >= deadline || ctx.is_shutting_down() {
            return Err(TransportError::Timeout {
                context: "registration",
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .into());
        }
    };

    let now = ctx.clock.now();
    session.touch(now);
    if request.message() != MessageType::Initialization {
        let actual = request.message().to_string();
        request.reject("expected initialization")?;
        return Err(ProtocolError::UnexpectedMessage {
            expected: MessageType::Initialization.to_string(),
            actual,
        }
        .into());
    }
    let (request, registration) = body_or_reject::<NodeRegistration>(request)?;

    let node_id = match ctx.storage.register_node(&registration, now) {
        Ok(node_id) => node_id,
        Err(e) => {
            request.reject(&e.to_string())?;
            return Err(ProtocolError::RegistrationRejected { reason: e.to_string() }.into());
        }
    };
    ctx.storage.mark_node_connected(node_id, true)?;

    let mut alert_levels: Vec<u32> = registration
        .alerts
        .iter()
        .flat_map(|a| a.alert_levels.iter().copied())
        .collect();
    alert_levels.sort_unstable();
    alert_levels.dedup();

    let info = SessionInfo {
        node_id,
        node_type: registration.node_type,
        username: registration.username,
        alert_levels,
    };
    session.set_info(info.clone());
    request.respond(ResponseResult::Ok)?;

    // A client that reconnects before its old connection timed out replaces it.
    ctx.sessions.for_each_session(
        |other| other.id() != session.id() && other.node_id() == Some(node_id),
        |other| {
            info!(session = %other.id(), node_id = %node_id, "closing connection replaced by a new one");
            other.close();
        },
    );

    info!(
        session = %session.id(),
        node_id = %node_id,
        node_type = %info.node_type,
        username = %info.username,
        "node registered"
    );
    Ok(info)
}

/// Brings the client up to date before it receives pushed messages.
fn synchronize(ctx: &ServerContext, session: &Session, info: &SessionInfo) -> AlertrResult<()> {
    if info.node_type == NodeType::Manager {
        // A manager's first pushed message is always a full snapshot.
        let snapshot = ctx.storage.snapshot()?;
        session.channel().send_request(MessageType::Status, &snapshot)?;
        debug!(session = %session.id(), "initial status sent");
    }
    session.mark_initialized();
    ctx.manager_updates.force_status_update();
    Ok(())
}

fn body_or_reject<T: DeserializeOwned>(request: InboundRequest<'_>) -> AlertrResult<(InboundRequest<'_>, T)> {
    match request.envelope().request_body::<T>() {
        Ok(body) => Ok((request, body)),
        Err(e) => {
            request.reject(&e.to_string())?;
            Err(e)
        }
    }
}

fn handle_request(ctx: &ServerContext, info: &SessionInfo, request: InboundRequest<'_>) -> AlertrResult<()> {
    let message = request.message();
    let now = ctx.clock.now();

    let outcome = match (message, info.node_type) {
        (MessageType::Ping, _) => Ok(()),
        (MessageType::SensorAlert, NodeType::Sensor) => {
            let (r, body) = body_or_reject::<SensorAlertRequest>(request)?;
            return finish(r, handle_sensor_alert(ctx, info, body, now));
        }
        (MessageType::StateChange, NodeType::Sensor) => {
            let (r, body) = body_or_reject::<StateChangeRequest>(request)?;
            return finish(r, handle_state_change(ctx, info, body, now));
        }
        (MessageType::Status, NodeType::Sensor) => {
            let (r, body) = body_or_reject::<SensorStatusRequest>(request)?;
            return finish(r, handle_sensor_status(ctx, info, body, now));
        }
        (MessageType::Option, NodeType::Manager) => {
            let (r, body) = body_or_reject::<OptionChange>(request)?;
            info!(username = %info.username, option = %body.option_type, value = body.value, delay = body.time_delay, "option change requested");
            return finish(r, ctx.options.schedule(body, now));
        }
        _ => Err(ProtocolError::NotPermitted {
            message: message.to_string(),
            role: info.node_type.to_string(),
        }
        .into()),
    };
    finish(request, outcome)
}

/// Answers the request according to `outcome`.
///
/// Errors that do not concern the connection are reported to the client
/// and logged; the session continues.
fn finish(request: InboundRequest<'_>, outcome: AlertrResult<()>) -> AlertrResult<()> {
    match outcome {
        Ok(()) => request.respond(ResponseResult::Ok),
        Err(e) if e.is_fatal_to_connection() => {
            request.reject(&e.to_string())?;
            Err(e)
        }
        Err(e) => {
            error!(msg_type = %request.message(), error = %e, "request failed");
            request.reject(&e.to_string())
        }
    }
}

fn owned_sensor(ctx: &ServerContext, info: &SessionInfo, client_sensor_id: i64) -> AlertrResult<Sensor> {
    ctx.storage
        .sensor_by_client_id(info.node_id, client_sensor_id)?
        .ok_or_else(|| {
            ProtocolError::MalformedEnvelope {
                reason: format!("node {} has no sensor with client id {client_sensor_id}", info.node_id),
            }
            .into()
        })
}

fn handle_sensor_alert(ctx: &ServerContext, info: &SessionInfo, body: SensorAlertRequest, now: DateTime<Utc>) -> AlertrResult<()> {
    let sensor = owned_sensor(ctx, info, body.client_sensor_id)?;

    if body.change_state || body.has_latest_data {
        let update = SensorUpdate {
            state: body.change_state.then_some(body.state),
            data: body.has_latest_data.then(|| body.data.clone()),
            at: now,
        };
        ctx.storage.update_sensor(sensor.sensor_id, &update)?;
    }

    debug!(sensor_id = %sensor.sensor_id, state = ?body.state, "sensor alert received");
    ctx.storage.add_pending_alert(RawSensorAlert {
        id: RawAlertId::new(),
        sensor_id: sensor.sensor_id,
        node_id: info.node_id,
        username: info.username.clone(),
        client_sensor_id: body.client_sensor_id,
        time_received: now,
        alert_delay: sensor.alert_delay,
        state: body.state,
        description: sensor.description,
        optional_data: body.optional_data,
        change_state: body.change_state,
        has_latest_data: body.has_latest_data,
        data: body.data,
    })?;
    ctx.sensor_alerts.wake();
    Ok(())
}

fn apply_sensor_state(
    ctx: &ServerContext,
    sensor: &Sensor,
    state: SensorState,
    data: Option<SensorData>,
    now: DateTime<Utc>,
) -> AlertrResult<()> {
    let update = SensorUpdate {
        state: Some(state),
        data: data.clone(),
        at: now,
    };
    if !ctx.storage.update_sensor(sensor.sensor_id, &update)? {
        debug!(sensor_id = %sensor.sensor_id, "discarded outdated sensor state");
        return Ok(());
    }
    if sensor.state != state {
        ctx.manager_updates.queue_state_change(StateChange {
            sensor_id: sensor.sensor_id,
            state,
            data: data.unwrap_or_else(|| sensor.data.clone()),
            changed_at: now,
        });
    }
    Ok(())
}

fn handle_state_change(ctx: &ServerContext, info: &SessionInfo, body: StateChangeRequest, now: DateTime<Utc>) -> AlertrResult<()> {
    let sensor = owned_sensor(ctx, info, body.client_sensor_id)?;
    apply_sensor_state(ctx, &sensor, body.state, body.data, now)
}

fn handle_sensor_status(ctx: &ServerContext, info: &SessionInfo, body: SensorStatusRequest, now: DateTime<Utc>) -> AlertrResult<()> {
    for status in body.sensors {
        let sensor = owned_sensor(ctx, info, status.client_sensor_id)?;
        apply_sensor_state(ctx, &sensor, status.state, status.data, now)?;
    }
    Ok(())
}

fn cleanup(ctx: &ServerContext, session: &Session) {
    session.close();
    ctx.sessions.remove(session.id());

    let Some(node_id) = session.node_id() else {
        return;
    };
    if ctx.sessions.any(|other| other.node_id() == Some(node_id)) {
        return;
    }
    if let Err(e) = ctx.storage.mark_node_connected(node_id, false) {
        error!(node_id = %node_id, error = %e, "failed to mark node disconnected");
    }
    ctx.manager_updates.force_status_update();
    info!(node_id = %node_id, "node disconnected");
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::alert_level::AlertLevel;
    use crate::executer::test_support::context;
    use crate::node::{AlertRegistration, SensorRegistration};
    use crate::protocol::codec::{self, FrameReader};
    use crate::protocol::{ControlPayload, Envelope};
    use crate::session::test_support::loopback_channel;
    use crate::storage::{InMemoryStorage, NodeStore, PendingAlertStore, SensorStore};
    use crate::time::from_unix;

    struct Client {
        stream: TcpStream,
        frames: FrameReader,
    }

    impl Client {
        fn new(stream: TcpStream) -> Self {
            stream.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
            Self {
                stream,
                frames: FrameReader::new(),
            }
        }

        fn read(&mut self, context: &'static str) -> Envelope {
            let deadline = Instant::now() + Duration::from_secs(5);
            self.frames
                .read_envelope_until(&mut self.stream, deadline, context, Duration::from_secs(5))
                .unwrap()
        }

        fn send(&mut self, envelope: &Envelope) {
            self.stream.write_all(&codec::encode(envelope).unwrap()).unwrap();
        }

        /// Client-initiated transaction; returns the server's reply.
        fn request(&mut self, message: MessageType, body: &Value) -> Envelope {
            let payload = codec::encode(&Envelope::request(message, body).unwrap()).unwrap();
            self.send(&Envelope::rts(message, 77, payload.len()).unwrap());
            assert_eq!(self.read("cts").control().unwrap(), ControlPayload::Cts { id: 77 });
            self.stream.write_all(&payload).unwrap();
            self.read("response")
        }

        /// Server-initiated transaction; returns the pushed request.
        fn accept(&mut self) -> Envelope {
            let rts = self.read("rts");
            let ControlPayload::Rts { id } = rts.control().unwrap() else {
                panic!("expected rts, got {rts:?}");
            };
            self.send(&Envelope::cts(rts.message, id).unwrap());
            let deadline = Instant::now() + Duration::from_secs(5);
            let request = self
                .frames
                .read_sized(&mut self.stream, rts.size.unwrap(), deadline, Duration::from_secs(5))
                .unwrap();
            self.send(&Envelope::response(request.message, ResponseResult::Ok).unwrap());
            request
        }
    }

    fn sensor_registration() -> Value {
        let mut reg = NodeRegistration::new("pi", NodeType::Sensor);
        reg.sensors.push(SensorRegistration {
            client_sensor_id: 0,
            description: "hall".to_string(),
            alert_delay: 0,
            alert_levels: vec![1],
            state: SensorState::Normal,
            data: SensorData::None,
        });
        serde_json::to_value(reg).unwrap()
    }

    fn start(ctx: &Arc<ServerContext>) -> (Arc<Session>, Client, thread::JoinHandle<()>) {
        let (channel, client) = loopback_channel();
        let session = Arc::new(Session::new(channel, from_unix(0)));
        ctx.sessions.insert(Arc::clone(&session));
        let thread_ctx = Arc::clone(ctx);
        let thread_session = Arc::clone(&session);
        let handle = thread::spawn(move || run_session(&thread_ctx, &thread_session));
        (session, Client::new(client), handle)
    }

    #[test]
    fn test_sensor_node_registers_and_reports() {
        let storage = InMemoryStorage::with_policy(vec![AlertLevel::new(1, "home")], true).unwrap();
        let (ctx, _clock, _rx) = context(storage, 100);
        let (session, mut client, handle) = start(&ctx);

        let reply = client.request(MessageType::Initialization, &sensor_registration());
        assert!(reply.error.is_none());
        assert_eq!(reply.control().unwrap(), ControlPayload::Response { result: ResponseResult::Ok });

        let reply = client.request(
            MessageType::SensorAlert,
            &json!({"clientSensorId": 0, "state": 1, "changeState": true, "hasLatestData": false}),
        );
        assert!(reply.error.is_none());

        let node_id = session.node_id().unwrap();
        let sensor = ctx.storage.sensor_by_client_id(node_id, 0).unwrap().unwrap();
        assert_eq!(sensor.state, SensorState::Triggered);
        let pending = ctx.storage.pending_alerts().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].username, "pi");
        assert!(ctx.storage.node(node_id).unwrap().unwrap().connected);

        drop(client);
        handle.join().unwrap();
        assert!(ctx.sessions.is_empty());
        assert!(!ctx.storage.node(node_id).unwrap().unwrap().connected);
    }

    #[test]
    fn test_state_change_queues_manager_delta() {
        let (ctx, _clock, _rx) = context(InMemoryStorage::new(), 100);
        let (_session, mut client, handle) = start(&ctx);
        client.request(MessageType::Initialization, &sensor_registration());

        let reply = client.request(MessageType::StateChange, &json!({"clientSensorId": 0, "state": 1}));
        assert!(reply.error.is_none());
        let deltas = ctx.manager_updates.take_state_changes();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].state, SensorState::Triggered);

        let reply = client.request(MessageType::StateChange, &json!({"clientSensorId": 9, "state": 1}));
        assert!(reply.error.is_some());
        handle.join().unwrap();
    }

    #[test]
    fn test_first_message_must_be_initialization() {
        let (ctx, _clock, _rx) = context(InMemoryStorage::new(), 100);
        let (session, mut client, handle) = start(&ctx);

        let reply = client.request(MessageType::Ping, &json!({}));
        assert!(reply.error.is_some());
        handle.join().unwrap();
        assert!(session.channel().is_closed());
    }

    #[test]
    fn test_alert_node_may_not_send_options() {
        let (ctx, _clock, _rx) = context(InMemoryStorage::new(), 100);
        let (session, mut client, handle) = start(&ctx);

        let mut reg = NodeRegistration::new("siren", NodeType::Alert);
        reg.alerts.push(AlertRegistration {
            client_alert_id: 0,
            description: "siren".to_string(),
            alert_levels: vec![3, 1, 3],
        });
        client.request(MessageType::Initialization, &serde_json::to_value(reg).unwrap());
        assert_eq!(session.info().unwrap().alert_levels, vec![1, 3]);

        let reply = client.request(MessageType::Option, &json!({"optionType": "alertSystemActive", "value": 0.0}));
        assert!(reply.error.unwrap().contains("not permitted"));
        handle.join().unwrap();
    }

    #[test]
    fn test_manager_receives_snapshot_before_anything_else() {
        let (ctx, _clock, _rx) = context(InMemoryStorage::new(), 100);
        let (session, mut client, handle) = start(&ctx);

        let reg = NodeRegistration::new("console", NodeType::Manager);
        let reply = client.request(MessageType::Initialization, &serde_json::to_value(reg).unwrap());
        assert!(reply.error.is_none());

        let first = client.accept();
        assert_eq!(first.message, MessageType::Status);
        for _ in 0..100 {
            if session.is_initialized() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(session.is_initialized());

        let reply = client.request(MessageType::Option, &json!({"optionType": "volume", "value": 2.0}));
        assert!(reply.error.is_none());

        drop(client);
        handle.join().unwrap();
    }
}
