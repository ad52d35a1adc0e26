//! Connection supervision.
//!
//! The watchdog closes connections that have been silent for longer than
//! the connection timeout, reports persistent nodes that are gone and sensors
//! that stopped reporting, and raises both through the internal sensors. The
//! reconnect policy paces retries of failing server-side operations and
//! decides when a run of failures is worth reporting.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as TimeDelta, Utc};
use tracing::{error, info, warn};

use crate::context::ServerContext;
use crate::error::{AlertrError, AlertrResult};
use crate::internal_sensor::InternalSensors;
use crate::node::{Node, NodeId};
use crate::sensor::{Sensor, SensorId};
use crate::session::SessionId;
use crate::time::secs;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Receives persistent node timeouts and reconnects.
pub trait NodeTimeoutObserver: Send + Sync {
    /// A persistent node has been disconnected for longer than the timeout.
    fn on_node_timeout(&self, node: &Node);

    /// A node previously reported as timed out is connected again.
    fn on_node_reconnect(&self, node: &Node);
}

/// Receives reports about repeated failures.
pub trait FailureNotifier: Send + Sync {
    /// Called every few consecutive failures with the latest error.
    fn notify(&self, consecutive_failures: u32, error: &AlertrError);
}

/// Observer that only writes log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl NodeTimeoutObserver for LoggingObserver {
    fn on_node_timeout(&self, node: &Node) {
        warn!(node_id = %node.node_id, username = %node.username, hostname = %node.hostname, "persistent node timed out");
    }

    fn on_node_reconnect(&self, node: &Node) {
        info!(node_id = %node.node_id, username = %node.username, "persistent node reconnected");
    }
}

impl FailureNotifier for LoggingObserver {
    fn notify(&self, consecutive_failures: u32, error: &AlertrError) {
        error!(consecutive_failures, error = %error, "operation keeps failing");
    }
}

/// Watchdog settings.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Seconds without traffic after which a connection is closed.
    pub connection_timeout_secs: u64,
    pub check_interval: Duration,
    /// Interval of reminders about nodes and sensors that are still timed out.
    pub reminder_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 90,
            check_interval: Duration::from_secs(5),
            reminder_secs: 86_400,
        }
    }
}

/// Outcome of one watchdog cycle.
#[allow(missing_docs)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatchdogReport {
    pub closed_sessions: Vec<SessionId>,
    pub timed_out: Vec<NodeId>,
    pub reconnected: Vec<NodeId>,
    pub sensors_timed_out: Vec<SensorId>,
    pub sensors_back: Vec<SensorId>,
    pub node_reminder: bool,
    pub sensor_reminder: bool,
}

/// The connection watchdog.
pub struct ConnectionWatchdog {
    ctx: Arc<ServerContext>,
    observer: Arc<dyn NodeTimeoutObserver>,
    internal: InternalSensors,
    cfg: WatchdogConfig,
    timed_out: BTreeSet<NodeId>,
    timed_out_sensors: BTreeSet<SensorId>,
    last_node_reminder: Option<DateTime<Utc>>,
    last_sensor_reminder: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for ConnectionWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWatchdog")
            .field("cfg", &self.cfg)
            .field("internal", &self.internal)
            .field("timed_out", &self.timed_out)
            .field("timed_out_sensors", &self.timed_out_sensors)
            .finish_non_exhaustive()
    }
}

/// Internal sensor failures are logged; the cycle goes on.
fn log_internal(result: AlertrResult<()>, what: &'static str) {
    if let Err(e) = result {
        error!(error = %e, what, "internal sensor alert failed");
    }
}

/// Advances a reminder clock; true when a reminder is due.
fn reminder_due(last: &mut Option<DateTime<Utc>>, active: bool, now: DateTime<Utc>, interval: TimeDelta) -> bool {
    match *last {
        _ if !active => {
            *last = None;
            false
        }
        None => {
            *last = Some(now);
            false
        }
        Some(at) if now - at >= interval => {
            *last = Some(now);
            true
        }
        Some(_) => false,
    }
}

impl ConnectionWatchdog {
    #[must_use]
    pub fn new(ctx: Arc<ServerContext>, observer: Arc<dyn NodeTimeoutObserver>, cfg: WatchdogConfig) -> Self {
        Self {
            ctx,
            observer,
            internal: InternalSensors::default(),
            cfg,
            timed_out: BTreeSet::new(),
            timed_out_sensors: BTreeSet::new(),
            last_node_reminder: None,
            last_sensor_reminder: None,
        }
    }

    /// Raises node and sensor timeouts through the server's internal sensors.
    #[must_use]
    pub fn with_internal_sensors(mut self, internal: InternalSensors) -> Self {
        self.internal = internal;
        self
    }

    /// Persistent nodes currently reported as timed out.
    #[must_use]
    pub fn timed_out_nodes(&self) -> Vec<NodeId> {
        self.timed_out.iter().copied().collect()
    }

    /// Sensors currently reported as timed out.
    #[must_use]
    pub fn timed_out_sensors(&self) -> Vec<SensorId> {
        self.timed_out_sensors.iter().copied().collect()
    }

    /// Runs one check.
    pub fn run_cycle(&mut self) -> AlertrResult<WatchdogReport> {
        let now = self.ctx.clock.now();
        let timeout = secs(self.cfg.connection_timeout_secs);
        let mut report = WatchdogReport::default();

        self.ctx.sessions.for_each_session(
            |s| now - s.last_recv() >= timeout,
            |s| {
                warn!(session = %s.id(), peer = s.channel().peer(), "connection timed out");
                s.close();
                report.closed_sessions.push(s.id());
            },
        );

        self.check_nodes(now, &mut report)?;
        self.check_sensors(now, &mut report)?;
        self.remind(now, &mut report)?;
        Ok(report)
    }

    fn check_nodes(&mut self, now: DateTime<Utc>, report: &mut WatchdogReport) -> AlertrResult<()> {
        for node in self.ctx.storage.nodes()? {
            if !node.persistent {
                continue;
            }
            let reported = self.timed_out.contains(&node.node_id);
            if node.connected && reported {
                self.timed_out.remove(&node.node_id);
                self.observer.on_node_reconnect(&node);
                let remaining = self.timed_out.len();
                log_internal(self.internal.node_back(&self.ctx, &node, remaining, now), "node back");
                report.reconnected.push(node.node_id);
            } else if !node.connected && !reported {
                self.timed_out.insert(node.node_id);
                self.observer.on_node_timeout(&node);
                log_internal(self.internal.node_timed_out(&self.ctx, &node, now), "node timeout");
                report.timed_out.push(node.node_id);
            }
        }
        Ok(())
    }

    /// Sensors silent for twice the connection timeout are timed out.
    fn check_sensors(&mut self, now: DateTime<Utc>, report: &mut WatchdogReport) -> AlertrResult<()> {
        let cutoff = now - secs(self.cfg.connection_timeout_secs.saturating_mul(2));
        let stale: BTreeMap<SensorId, Sensor> = self
            .ctx
            .storage
            .sensors_updated_before(cutoff)?
            .into_iter()
            .filter(|s| !self.internal.is_server_node(s.node_id))
            .map(|s| (s.sensor_id, s))
            .collect();

        for (id, sensor) in &stale {
            if !self.timed_out_sensors.insert(*id) {
                continue;
            }
            warn!(
                sensor_id = %id,
                description = %sensor.description,
                last_state_updated = %sensor.last_state_updated,
                "sensor timed out"
            );
            report.sensors_timed_out.push(*id);
            if let Some(node) = self.ctx.storage.node(sensor.node_id)? {
                log_internal(
                    self.internal.sensor_timed_out(&self.ctx, &node, sensor, now),
                    "sensor timeout",
                );
            }
        }

        let back: Vec<SensorId> = self
            .timed_out_sensors
            .iter()
            .filter(|id| !stale.contains_key(id))
            .copied()
            .collect();
        for id in back {
            self.timed_out_sensors.remove(&id);
            report.sensors_back.push(id);
            // Gone sensors belonged to a node that registered again without them.
            let Some(sensor) = self.ctx.storage.sensor(id)? else {
                continue;
            };
            info!(sensor_id = %id, description = %sensor.description, "sensor reports again");
            if let Some(node) = self.ctx.storage.node(sensor.node_id)? {
                let remaining = self.timed_out_sensors.len();
                log_internal(
                    self.internal.sensor_back(&self.ctx, &node, &sensor, remaining, now),
                    "sensor back",
                );
            }
        }
        Ok(())
    }

    fn remind(&mut self, now: DateTime<Utc>, report: &mut WatchdogReport) -> AlertrResult<()> {
        let interval = secs(self.cfg.reminder_secs);

        if reminder_due(&mut self.last_node_reminder, !self.timed_out.is_empty(), now, interval) {
            let mut nodes = Vec::new();
            for id in &self.timed_out {
                match self.ctx.storage.node(*id)? {
                    Some(node) => nodes.push(node),
                    None => error!(node_id = %id, "timed out node no longer stored"),
                }
            }
            warn!(count = nodes.len(), "nodes still timed out");
            log_internal(self.internal.node_reminder(&self.ctx, &nodes, now), "node reminder");
            report.node_reminder = true;
        }

        if reminder_due(&mut self.last_sensor_reminder, !self.timed_out_sensors.is_empty(), now, interval) {
            let mut sensors = Vec::new();
            for id in &self.timed_out_sensors {
                let Some(sensor) = self.ctx.storage.sensor(*id)? else {
                    continue;
                };
                if let Some(node) = self.ctx.storage.node(sensor.node_id)? {
                    sensors.push((node, sensor));
                }
            }
            warn!(count = sensors.len(), "sensors still timed out");
            log_internal(self.internal.sensor_reminder(&self.ctx, &sensors, now), "sensor reminder");
            report.sensor_reminder = true;
        }
        Ok(())
    }

    /// Starts the watchdog loop on its own thread.
    #[must_use]
    pub fn spawn(mut self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("alertr-watchdog".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn connection watchdog")
    }

    /// Sleeps one check interval, returning early on shutdown.
    fn pause(&self) {
        let deadline = Instant::now() + self.cfg.check_interval;
        while !self.ctx.is_shutting_down() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return;
            }
            thread::sleep(left.min(SHUTDOWN_POLL));
        }
    }

    fn run(&mut self) {
        info!(timeout_secs = self.cfg.connection_timeout_secs, "connection watchdog started");
        while !self.ctx.is_shutting_down() {
            if let Err(e) = self.run_cycle() {
                error!(error = %e, "watchdog cycle failed");
            }
            self.pause();
        }
        info!("connection watchdog stopped");
    }
}

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectDecision {
    /// How long to wait before the next attempt.
    pub delay: Duration,
    /// Whether this failure should be reported.
    pub notify: bool,
}

/// Fixed-delay retry pacing with periodic failure reports.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    backoff: Duration,
    notify_every: u32,
    consecutive_failures: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 5)
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(backoff: Duration, notify_every: u32) -> Self {
        Self {
            backoff,
            notify_every: notify_every.max(1),
            consecutive_failures: 0,
        }
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Records a failure.
    pub fn on_failure(&mut self) -> ReconnectDecision {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        ReconnectDecision {
            delay: self.backoff,
            notify: self.consecutive_failures % self.notify_every == 0,
        }
    }

    /// Records a success and resets the failure count.
    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Runs `op` until it succeeds or `should_stop` returns true.
    ///
    /// Returns `None` when stopped before a success.
    pub fn retry<T, F, S>(&mut self, notifier: &dyn FailureNotifier, mut should_stop: S, mut op: F) -> Option<T>
    where
        F: FnMut() -> AlertrResult<T>,
        S: FnMut() -> bool,
    {
        while !should_stop() {
            match op() {
                Ok(value) => {
                    self.on_success();
                    return Some(value);
                }
                Err(e) => {
                    let decision = self.on_failure();
                    warn!(attempt = self.consecutive_failures, error = %e, "operation failed, retrying");
                    if decision.notify {
                        notifier.notify(self.consecutive_failures, &e);
                    }
                    thread::sleep(decision.delay);
                }
            }
        }
        None
    }
}
