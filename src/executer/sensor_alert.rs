//! Sensor alert executer.
//!
//! Each cycle drains the raw sensor alerts stored by session threads,
//! deleting every one before it is processed so an alert enters the
//! pipeline at most once. Accepted alert levels without rules fire as soon
//! as the sensor's delay has elapsed. Alert levels with rules collect raw
//! alerts into a per-level bucket that feeds their rule chain; the chain
//! state lives here for the lifetime of the executer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::alert_level::AlertLevel;
use crate::context::ServerContext;
use crate::error::AlertrResult;
use crate::rules::RuleChain;
use crate::sensor::RawSensorAlert;
use crate::snapshot::StateChange;
use crate::storage::StorageError;

use super::dispatcher::{dispatch_sensor_alert, SensorAlertMessage};

/// Wakes the sensor alert executer.
#[derive(Debug, Clone)]
pub struct SensorAlertHandle {
    wake_tx: Sender<()>,
}

impl SensorAlertHandle {
    pub(crate) fn new() -> (Self, Receiver<()>) {
        let (wake_tx, wake_rx) = bounded(1);
        (Self { wake_tx }, wake_rx)
    }

    /// Signals that new raw sensor alerts were stored.
    pub fn wake(&self) {
        super::wake(&self.wake_tx);
    }
}

/// Outcome of one executer cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Raw alerts taken out of storage.
    pub drained: usize,
    /// Sensor alerts sent for alert levels without rules.
    pub sensor_alerts: Vec<SensorAlertMessage>,
    /// Alert levels whose rule chain fired.
    pub fired_levels: Vec<u32>,
    /// Dispatcher threads started by this cycle.
    pub dispatched: Vec<JoinHandle<()>>,
}

#[derive(Debug)]
struct RuleLevelState {
    name: String,
    chain: RuleChain,
    pending: Vec<RawSensorAlert>,
    active: bool,
}

#[derive(Debug)]
struct DelayedAlert {
    alert: RawSensorAlert,
    levels: Vec<u32>,
}

/// The sensor alert executer.
#[derive(Debug)]
pub struct SensorAlertExecuter {
    ctx: Arc<ServerContext>,
    wake_rx: Receiver<()>,
    rule_levels: BTreeMap<u32, RuleLevelState>,
    delayed: Vec<DelayedAlert>,
}

impl SensorAlertExecuter {
    #[must_use]
    pub fn new(ctx: Arc<ServerContext>, wake_rx: Receiver<()>) -> Self {
        Self {
            ctx,
            wake_rx,
            rule_levels: BTreeMap::new(),
            delayed: Vec::new(),
        }
    }

    /// Number of alert levels whose chain is currently being tracked.
    #[must_use]
    pub fn active_rule_levels(&self) -> usize {
        self.rule_levels.values().filter(|s| s.active).count()
    }

    /// Number of raw alerts waiting for their delay to elapse.
    #[must_use]
    pub fn delayed_alerts(&self) -> usize {
        self.delayed.len()
    }

    /// Runs one cycle.
    pub fn run_cycle(&mut self) -> AlertrResult<CycleReport> {
        let now = self.ctx.clock.now();
        let system_active = self.ctx.storage.is_system_active()?;
        let levels: BTreeMap<u32, AlertLevel> = self
            .ctx
            .storage
            .alert_levels()?
            .into_iter()
            .map(|l| (l.level, l))
            .collect();

        let mut report = CycleReport::default();
        for alert in self.ctx.storage.pending_alerts()? {
            if let Err(e) = self.ctx.storage.delete_pending_alert(alert.id) {
                warn!(alert_id = %alert.id, error = %e, "could not take pending sensor alert, leaving it for the next cycle");
                continue;
            }
            report.drained += 1;
            let (alert_id, sensor_id) = (alert.id, alert.sensor_id);
            if let Err(e) = self.ingest(alert, system_active) {
                error!(alert_id = %alert_id, sensor_id = %sensor_id, error = %e, "dropping sensor alert that could not be processed");
            }
        }

        self.fire_delayed(&levels, system_active, now, &mut report);
        self.evaluate_chains(now, &mut report);
        Ok(report)
    }

    fn ingest(&mut self, alert: RawSensorAlert, system_active: bool) -> AlertrResult<()> {
        if alert.change_state {
            self.ctx.manager_updates.queue_state_change(StateChange {
                sensor_id: alert.sensor_id,
                state: alert.state,
                data: alert.data.clone(),
                changed_at: alert.time_received,
            });
        }

        let sensor_levels = match self.ctx.storage.alert_levels_for_sensor(alert.sensor_id) {
            Ok(levels) => levels,
            Err(StorageError::SensorNotFound(id)) => {
                warn!(sensor_id = %id, "dropping sensor alert of a sensor that no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut direct = Vec::new();
        for level in sensor_levels.iter().filter(|l| l.accepts(alert.state, system_active)) {
            if level.rules_activated() {
                let state = self.rule_levels.entry(level.level).or_insert_with(|| RuleLevelState {
                    name: level.name.clone(),
                    chain: level.chain(),
                    pending: Vec::new(),
                    active: false,
                });
                state.active = true;
                state.pending.push(alert.clone());
            } else {
                direct.push(level.level);
            }
        }

        if !direct.is_empty() {
            self.delayed.push(DelayedAlert { alert, levels: direct });
        }
        Ok(())
    }

    fn fire_delayed(
        &mut self,
        levels: &BTreeMap<u32, AlertLevel>,
        system_active: bool,
        now: chrono::DateTime<chrono::Utc>,
        report: &mut CycleReport,
    ) {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|d| d.alert.delay_elapsed(now));
        self.delayed = waiting;

        for DelayedAlert { alert, levels: candidates } in due {
            // The policy may have changed while the alert was delayed.
            let accepted: Vec<u32> = candidates
                .into_iter()
                .filter(|l| levels.get(l).is_some_and(|level| level.accepts(alert.state, system_active)))
                .collect();
            if accepted.is_empty() {
                debug!(sensor_id = %alert.sensor_id, "delayed sensor alert no longer accepted by any alert level");
                continue;
            }

            let message = SensorAlertMessage::from_raw(&alert, accepted);
            info!(sensor_id = %alert.sensor_id, levels = ?message.alert_levels, "sensor alert triggered alert levels");
            report.dispatched.extend(dispatch_sensor_alert(&self.ctx.sessions, &message));
            report.sensor_alerts.push(message);
        }
    }

    fn evaluate_chains(&mut self, now: chrono::DateTime<chrono::Utc>, report: &mut CycleReport) {
        for (level, state) in &mut self.rule_levels {
            if !state.active {
                continue;
            }

            match state.chain.process(&mut state.pending, now) {
                Ok(true) => {
                    info!(alert_level = *level, name = %state.name, "rule chain fired");
                    let message = SensorAlertMessage::for_rule(*level, &state.name);
                    report.dispatched.extend(dispatch_sensor_alert(&self.ctx.sessions, &message));
                    report.fired_levels.push(*level);
                    state.pending.clear();
                    state.active = false;
                }
                Ok(false) => {
                    if !state.chain.can_still_trigger(&state.pending) {
                        debug!(alert_level = *level, "rule chain can no longer fire, dropping its bucket");
                        state.pending.clear();
                        state.active = false;
                    }
                }
                Err(e) => {
                    warn!(alert_level = *level, error = %e, "skipping alert level with invalid rule configuration this cycle");
                }
            }
        }
    }

    /// Starts the executer loop on its own thread.
    #[must_use]
    pub fn spawn(mut self, poll: Duration) -> JoinHandle<()> {
        thread::Builder::new()
            .name("alertr-sensor-alerts".to_string())
            .spawn(move || self.run(poll))
            .expect("failed to spawn sensor alert executer")
    }

    fn run(&mut self, poll: Duration) {
        info!("sensor alert executer started");
        while !self.ctx.is_shutting_down() {
            if let Err(e) = self.run_cycle() {
                error!(error = %e, "sensor alert cycle failed");
            }
            match self.wake_rx.recv_timeout(poll) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("sensor alert executer stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::{DateTime, Duration as TimeDelta, Utc};

    use super::*;
    use crate::context::SessionSettings;
    use crate::executer::test_support::{accept_one, connect, context};
    use crate::node::{Node, NodeId, NodeRegistration, NodeType, SensorRegistration};
    use crate::rules::{RuleElement, RuleStart};
    use crate::sensor::{RawAlertId, Sensor, SensorData, SensorId, SensorState};
    use crate::snapshot::{OptionRecord, SystemSnapshot};
    use crate::storage::{InMemoryStorage, NodeStore, PendingAlertStore, PolicyStore, SensorStore, SensorUpdate, Storage};
    use crate::time::{from_unix, Clock, ManualClock};

    /// Storage whose `delete_pending_alert` fails for selected alerts.
    #[derive(Debug)]
    struct StuckDeletes {
        inner: InMemoryStorage,
        stuck: Mutex<Vec<RawAlertId>>,
    }

    impl NodeStore for StuckDeletes {
        fn register_node(&self, registration: &NodeRegistration, now: DateTime<Utc>) -> Result<NodeId, StorageError> {
            self.inner.register_node(registration, now)
        }
        fn node(&self, id: NodeId) -> Result<Option<Node>, StorageError> {
            self.inner.node(id)
        }
        fn nodes(&self) -> Result<Vec<Node>, StorageError> {
            self.inner.nodes()
        }
        fn mark_node_connected(&self, id: NodeId, connected: bool) -> Result<(), StorageError> {
            self.inner.mark_node_connected(id, connected)
        }
    }

    impl SensorStore for StuckDeletes {
        fn sensor(&self, id: SensorId) -> Result<Option<Sensor>, StorageError> {
            self.inner.sensor(id)
        }
        fn sensor_by_client_id(&self, node_id: NodeId, client_sensor_id: i64) -> Result<Option<Sensor>, StorageError> {
            self.inner.sensor_by_client_id(node_id, client_sensor_id)
        }
        fn sensors_updated_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Sensor>, StorageError> {
            self.inner.sensors_updated_before(cutoff)
        }
        fn update_sensor(&self, id: SensorId, update: &SensorUpdate) -> Result<bool, StorageError> {
            self.inner.update_sensor(id, update)
        }
    }

    impl PendingAlertStore for StuckDeletes {
        fn add_pending_alert(&self, alert: RawSensorAlert) -> Result<(), StorageError> {
            self.inner.add_pending_alert(alert)
        }
        fn pending_alerts(&self) -> Result<Vec<RawSensorAlert>, StorageError> {
            self.inner.pending_alerts()
        }
        fn delete_pending_alert(&self, id: RawAlertId) -> Result<(), StorageError> {
            if self.stuck.lock().unwrap().contains(&id) {
                return Err(StorageError::BackendError("disk full".to_string()));
            }
            self.inner.delete_pending_alert(id)
        }
    }

    impl PolicyStore for StuckDeletes {
        fn alert_levels(&self) -> Result<Vec<AlertLevel>, StorageError> {
            self.inner.alert_levels()
        }
        fn alert_levels_for_sensor(&self, id: SensorId) -> Result<Vec<AlertLevel>, StorageError> {
            self.inner.alert_levels_for_sensor(id)
        }
        fn is_system_active(&self) -> Result<bool, StorageError> {
            self.inner.is_system_active()
        }
        fn set_option(&self, option_type: &str, value: f64) -> Result<(), StorageError> {
            self.inner.set_option(option_type, value)
        }
        fn options(&self) -> Result<Vec<OptionRecord>, StorageError> {
            self.inner.options()
        }
    }

    impl Storage for StuckDeletes {
        fn snapshot(&self) -> Result<SystemSnapshot, StorageError> {
            self.inner.snapshot()
        }
    }

    fn storage_with(levels: Vec<AlertLevel>, system_active: bool, delay: u64) -> (InMemoryStorage, SensorId) {
        let storage = InMemoryStorage::with_policy(levels, system_active).unwrap();
        let mut reg = NodeRegistration::new("pi", NodeType::Sensor);
        reg.sensors.push(SensorRegistration {
            client_sensor_id: 0,
            description: "front door".to_string(),
            alert_delay: delay,
            alert_levels: vec![1],
            state: SensorState::Normal,
            data: SensorData::None,
        });
        let node = storage.register_node(&reg, from_unix(0)).unwrap();
        let sensor = storage.sensor_by_client_id(node, 0).unwrap().unwrap();
        (storage, sensor.sensor_id)
    }

    fn store_alert(ctx: &ServerContext, sensor_id: SensorId, clock: &ManualClock, delay: u64) {
        let sensor = ctx.storage.sensor(sensor_id).unwrap().unwrap();
        ctx.storage
            .add_pending_alert(RawSensorAlert {
                id: RawAlertId::new(),
                sensor_id,
                node_id: sensor.node_id,
                username: "pi".to_string(),
                client_sensor_id: sensor.client_sensor_id,
                time_received: clock.now(),
                alert_delay: delay,
                state: SensorState::Triggered,
                description: sensor.description,
                optional_data: None,
                change_state: true,
                has_latest_data: false,
                data: SensorData::None,
            })
            .unwrap();
    }

    #[test]
    fn test_trigger_always_fires_while_system_inactive() {
        let mut level = AlertLevel::new(1, "panic");
        level.trigger_always = true;
        let (storage, sensor_id) = storage_with(vec![level], false, 0);
        let (ctx, clock, rx) = context(storage, 100);
        let (_alert, mut alert_client) = connect(&ctx, NodeType::Alert, vec![1]);
        let (_manager, mut manager_client) = connect(&ctx, NodeType::Manager, Vec::new());

        store_alert(&ctx, sensor_id, &clock, 0);
        let mut executer = SensorAlertExecuter::new(Arc::clone(&ctx), rx.sensor_alerts);
        let report = executer.run_cycle().unwrap();

        assert_eq!(report.drained, 1);
        assert_eq!(report.sensor_alerts.len(), 1);
        assert_eq!(report.dispatched.len(), 2);
        assert!(ctx.storage.pending_alerts().unwrap().is_empty());

        let to_alert: SensorAlertMessage = accept_one(&mut alert_client).request_body().unwrap();
        assert_eq!(to_alert.sensor_id, Some(sensor_id));
        assert_eq!(to_alert.description, "front door");
        accept_one(&mut manager_client);
        for handle in report.dispatched {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_inactive_system_suppresses_regular_levels() {
        let (storage, sensor_id) = storage_with(vec![AlertLevel::new(1, "home")], false, 0);
        let (ctx, clock, rx) = context(storage, 100);
        store_alert(&ctx, sensor_id, &clock, 0);

        let mut executer = SensorAlertExecuter::new(Arc::clone(&ctx), rx.sensor_alerts);
        let report = executer.run_cycle().unwrap();
        assert_eq!(report.drained, 1);
        assert!(report.sensor_alerts.is_empty());
        assert_eq!(executer.delayed_alerts(), 0);
    }

    #[test]
    fn test_delayed_alert_waits_for_its_delay() {
        let (storage, sensor_id) = storage_with(vec![AlertLevel::new(1, "home")], true, 10);
        let (ctx, clock, rx) = context(storage, 100);
        store_alert(&ctx, sensor_id, &clock, 10);

        let mut executer = SensorAlertExecuter::new(Arc::clone(&ctx), rx.sensor_alerts);
        assert!(executer.run_cycle().unwrap().sensor_alerts.is_empty());
        assert_eq!(executer.delayed_alerts(), 1);

        clock.advance(TimeDelta::seconds(9));
        assert!(executer.run_cycle().unwrap().sensor_alerts.is_empty());

        clock.advance(TimeDelta::seconds(1));
        let report = executer.run_cycle().unwrap();
        assert_eq!(report.sensor_alerts.len(), 1);
        assert_eq!(executer.delayed_alerts(), 0);
    }

    #[test]
    fn test_rule_chain_fires_and_rearms() {
        let mut level = AlertLevel::new(1, "door at night");
        level.rules = vec![RuleStart::new(0, RuleElement::sensor("pi", 0, 30))];
        let (storage, sensor_id) = storage_with(vec![level], true, 0);
        let (ctx, clock, rx) = context(storage, 100);
        let mut executer = SensorAlertExecuter::new(Arc::clone(&ctx), rx.sensor_alerts);

        store_alert(&ctx, sensor_id, &clock, 0);
        let report = executer.run_cycle().unwrap();
        assert_eq!(report.fired_levels, vec![1]);
        assert!(report.sensor_alerts.is_empty());
        assert_eq!(executer.active_rule_levels(), 0);

        clock.advance(TimeDelta::seconds(1));
        assert!(executer.run_cycle().unwrap().fired_levels.is_empty());

        store_alert(&ctx, sensor_id, &clock, 0);
        assert_eq!(executer.run_cycle().unwrap().fired_levels, vec![1]);
    }

    #[test]
    fn test_state_change_queued_for_managers() {
        let (storage, sensor_id) = storage_with(vec![AlertLevel::new(1, "home")], true, 0);
        let (ctx, clock, rx) = context(storage, 100);
        store_alert(&ctx, sensor_id, &clock, 0);

        SensorAlertExecuter::new(Arc::clone(&ctx), rx.sensor_alerts).run_cycle().unwrap();
        let deltas = ctx.manager_updates.take_state_changes();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].sensor_id, sensor_id);
        assert_eq!(deltas[0].state, SensorState::Triggered);
    }

    #[test]
    fn test_storage_error_on_one_alert_keeps_the_cycle_going() {
        let (inner, sensor_id) = storage_with(vec![AlertLevel::new(1, "home")], true, 0);
        let storage = Arc::new(StuckDeletes {
            inner,
            stuck: Mutex::new(Vec::new()),
        });
        let clock = Arc::new(ManualClock::new(from_unix(100)));
        let (ctx, rx) = ServerContext::new(Arc::clone(&storage) as _, Arc::clone(&clock) as _, SessionSettings::default());

        store_alert(&ctx, sensor_id, &clock, 0);
        let stuck_id = ctx.storage.pending_alerts().unwrap()[0].id;
        storage.stuck.lock().unwrap().push(stuck_id);
        store_alert(&ctx, sensor_id, &clock, 0);

        let mut executer = SensorAlertExecuter::new(Arc::clone(&ctx), rx.sensor_alerts);
        let report = executer.run_cycle().unwrap();
        assert_eq!(report.drained, 1);
        assert_eq!(report.sensor_alerts.len(), 1);

        let left: Vec<RawAlertId> = ctx.storage.pending_alerts().unwrap().iter().map(|a| a.id).collect();
        assert_eq!(left, vec![stuck_id]);
    }
}
