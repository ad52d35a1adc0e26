//! Long-running workers of the server.
//!
//! Each executer owns one thread that wakes on a crossbeam channel or after a
//! poll interval, runs one cycle, and polls the shutdown flag in between.
//! Delivery to clients goes through short-lived dispatcher threads.

use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};

/// One-shot delivery of one message to one session.
pub mod dispatcher;

/// Manager status snapshots and state deltas.
pub mod manager_update;

/// Delayed option changes.
pub mod option;

/// Raw sensor alerts, alert level policy and rule chains.
pub mod sensor_alert;

pub use dispatcher::{dispatch, Dispatch, SensorAlertMessage};
pub use manager_update::{ManagerUpdateExecuter, ManagerUpdateHandle, UpdateKind};
pub use option::{OptionChange, OptionExecuter, OptionHandle};
pub use sensor_alert::{SensorAlertExecuter, SensorAlertHandle};

/// Executer timing.
#[derive(Debug, Clone)]
pub struct ExecuterConfig {
    /// Longest sleep of the sensor alert executer between cycles.
    pub sensor_alert_poll: Duration,
    /// Seconds between full status snapshots to managers.
    pub manager_update_interval_secs: u64,
    /// Longest sleep of the option executer between cycles.
    pub option_poll: Duration,
}

impl Default for ExecuterConfig {
    fn default() -> Self {
        Self {
            sensor_alert_poll: Duration::from_millis(500),
            manager_update_interval_secs: 60,
            option_poll: Duration::from_secs(1),
        }
    }
}

/// Non-blocking wake-up; a wake-up already queued is enough.
pub(crate) fn wake(tx: &Sender<()>) {
    match tx.try_send(()) {
        Ok(()) | Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => {}
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Write;
    use std::net::TcpStream;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::context::{ExecuterReceivers, ServerContext, SessionSettings};
    use crate::node::{NodeId, NodeType};
    use crate::protocol::codec::{self, FrameReader};
    use crate::protocol::{ControlPayload, Envelope, ResponseResult};
    use crate::session::test_support::{fast_channel_config, loopback_channel};
    use crate::session::{Session, SessionInfo};
    use crate::storage::InMemoryStorage;
    use crate::time::{from_unix, ManualClock};

    pub(crate) fn context(storage: InMemoryStorage, start: i64) -> (Arc<ServerContext>, Arc<ManualClock>, ExecuterReceivers) {
        let clock = Arc::new(ManualClock::new(from_unix(start)));
        let settings = SessionSettings {
            channel: fast_channel_config(),
            registration_timeout: Duration::from_secs(2),
        };
        let (ctx, receivers) = ServerContext::new(Arc::new(storage), Arc::clone(&clock) as _, settings);
        (ctx, clock, receivers)
    }

    /// Registers an initialized session and returns the client end of its socket.
    pub(crate) fn connect(ctx: &ServerContext, node_type: NodeType, alert_levels: Vec<u32>) -> (Arc<Session>, TcpStream) {
        let (channel, client) = loopback_channel();
        let session = Arc::new(Session::new(channel, from_unix(0)));
        session.set_info(SessionInfo {
            node_id: NodeId(0),
            node_type,
            username: format!("{node_type}-client"),
            alert_levels,
        });
        session.mark_initialized();
        ctx.sessions.insert(Arc::clone(&session));
        (session, client)
    }

    /// Plays the client side of one server-initiated transaction and returns the request.
    pub(crate) fn accept_one(client: &mut TcpStream) -> Envelope {
        client.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let mut frames = FrameReader::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let rts = frames
            .read_envelope_until(client, deadline, "rts", Duration::from_secs(5))
            .unwrap();
        let ControlPayload::Rts { id } = rts.control().unwrap() else {
            panic!("expected rts, got {rts:?}");
        };
        client.write_all(&codec::encode(&Envelope::cts(rts.message, id).unwrap()).unwrap()).unwrap();
        let request = frames
            .read_sized(client, rts.size.unwrap(), deadline, Duration::from_secs(5))
            .unwrap();
        let response = Envelope::response(request.message, ResponseResult::Ok).unwrap();
        client.write_all(&codec::encode(&response).unwrap()).unwrap();
        request
    }
}
