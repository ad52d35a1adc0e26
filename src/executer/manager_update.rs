//! Manager update executer.
//!
//! Managers are kept current two ways: cheap state deltas pushed as they
//! happen, and a full status snapshot every update interval or on demand.
//! A snapshot subsumes every queued delta, so queued deltas are discarded
//! whenever one is sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info};

use crate::context::ServerContext;
use crate::error::AlertrResult;
use crate::node::NodeType;
use crate::snapshot::StateChange;
use crate::time::secs;

use super::dispatcher::{dispatch_to_role, Dispatch};

#[derive(Debug, Default)]
struct Shared {
    deltas: Mutex<VecDeque<StateChange>>,
    force_snapshot: AtomicBool,
}

/// Feeds the manager update executer.
#[derive(Debug, Clone)]
pub struct ManagerUpdateHandle {
    shared: Arc<Shared>,
    wake_tx: Sender<()>,
}

impl ManagerUpdateHandle {
    pub(crate) fn new() -> (Self, Receiver<()>) {
        let (wake_tx, wake_rx) = bounded(1);
        let handle = Self {
            shared: Arc::new(Shared::default()),
            wake_tx,
        };
        (handle, wake_rx)
    }

    /// Queues a delta for every manager.
    pub fn queue_state_change(&self, change: StateChange) {
        self.shared
            .deltas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(change);
        self.wake();
    }

    /// Requests a full snapshot to every manager as soon as possible.
    pub fn force_status_update(&self) {
        self.shared.force_snapshot.store(true, Ordering::Release);
        self.wake();
    }

    pub fn wake(&self) {
        super::wake(&self.wake_tx);
    }

    /// Takes all queued deltas, oldest first.
    pub fn take_state_changes(&self) -> Vec<StateChange> {
        self.shared
            .deltas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    fn take_force(&self) -> bool {
        self.shared.force_snapshot.swap(false, Ordering::AcqRel)
    }

    fn restore_force(&self) {
        self.shared.force_snapshot.store(true, Ordering::Release);
    }
}

/// What one cycle sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// A full snapshot went to every manager.
    Snapshot,
    /// This many deltas went to every manager.
    Deltas(usize),
    /// Nothing to send.
    Idle,
}

/// Outcome of one manager update cycle.
#[derive(Debug)]
pub struct UpdateReport {
    pub kind: UpdateKind,
    pub dispatched: Vec<JoinHandle<()>>,
}

/// The manager update executer.
#[derive(Debug)]
pub struct ManagerUpdateExecuter {
    ctx: Arc<ServerContext>,
    wake_rx: Receiver<()>,
    interval_secs: u64,
    last_snapshot: Option<DateTime<Utc>>,
}

impl ManagerUpdateExecuter {
    #[must_use]
    pub fn new(ctx: Arc<ServerContext>, wake_rx: Receiver<()>, interval_secs: u64) -> Self {
        Self {
            ctx,
            wake_rx,
            interval_secs,
            last_snapshot: None,
        }
    }

    fn snapshot_due(&self, now: DateTime<Utc>) -> bool {
        self.last_snapshot.map_or(true, |at| now - at >= secs(self.interval_secs))
    }

    /// Runs one cycle.
    pub fn run_cycle(&mut self) -> AlertrResult<UpdateReport> {
        let handle = &self.ctx.manager_updates;
        let now = self.ctx.clock.now();
        let forced = handle.take_force();

        if forced || self.snapshot_due(now) {
            let snapshot = match self.ctx.storage.snapshot() {
                Ok(snapshot) => Arc::new(snapshot),
                Err(e) => {
                    if forced {
                        handle.restore_force();
                    }
                    return Err(e.into());
                }
            };
            let discarded = handle.take_state_changes().len();
            self.last_snapshot = Some(now);

            let dispatched = dispatch_to_role(&self.ctx.sessions, NodeType::Manager, || {
                Dispatch::Status(Arc::clone(&snapshot))
            });
            debug!(forced, discarded, managers = dispatched.len(), "sent status snapshot");
            return Ok(UpdateReport {
                kind: UpdateKind::Snapshot,
                dispatched,
            });
        }

        let deltas = handle.take_state_changes();
        if deltas.is_empty() {
            return Ok(UpdateReport {
                kind: UpdateKind::Idle,
                dispatched: Vec::new(),
            });
        }

        let mut dispatched = Vec::new();
        for delta in &deltas {
            dispatched.extend(dispatch_to_role(&self.ctx.sessions, NodeType::Manager, || {
                Dispatch::StateChange(delta.clone())
            }));
        }
        Ok(UpdateReport {
            kind: UpdateKind::Deltas(deltas.len()),
            dispatched,
        })
    }

    /// Starts the executer loop on its own thread.
    #[must_use]
    pub fn spawn(mut self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("alertr-manager-updates".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn manager update executer")
    }

    fn run(&mut self) {
        info!(interval_secs = self.interval_secs, "manager update executer started");
        let wait = Duration::from_secs(self.interval_secs.max(1));
        while !self.ctx.is_shutting_down() {
            if let Err(e) = self.run_cycle() {
                error!(error = %e, "manager update cycle failed");
            }
            match self.wake_rx.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("manager update executer stopped");
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as TimeDelta;

    use super::*;
    use crate::executer::test_support::{accept_one, connect, context};
    use crate::protocol::MessageType;
    use crate::sensor::{SensorData, SensorId, SensorState};
    use crate::snapshot::SystemSnapshot;
    use crate::storage::InMemoryStorage;
    use crate::time::from_unix;

    fn delta(sensor: i64, at: i64) -> StateChange {
        StateChange {
            sensor_id: SensorId(sensor),
            state: SensorState::Triggered,
            data: SensorData::None,
            changed_at: from_unix(at),
        }
    }

    #[test]
    fn test_first_cycle_sends_snapshot_and_drops_deltas() {
        let (ctx, _clock, rx) = context(InMemoryStorage::new(), 1000);
        let (_manager, mut client) = connect(&ctx, NodeType::Manager, Vec::new());
        ctx.manager_updates.queue_state_change(delta(1, 999));

        let mut executer = ManagerUpdateExecuter::new(Arc::clone(&ctx), rx.manager_updates, 60);
        let report = executer.run_cycle().unwrap();
        assert_eq!(report.kind, UpdateKind::Snapshot);
        assert!(ctx.manager_updates.take_state_changes().is_empty());

        let request = accept_one(&mut client);
        assert_eq!(request.message, MessageType::Status);
        let snapshot: SystemSnapshot = request.request_body().unwrap();
        assert_eq!(snapshot.options.len(), 1);
        for handle in report.dispatched {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_deltas_between_snapshots() {
        let (ctx, clock, rx) = context(InMemoryStorage::new(), 1000);
        let mut executer = ManagerUpdateExecuter::new(Arc::clone(&ctx), rx.manager_updates, 60);
        assert_eq!(executer.run_cycle().unwrap().kind, UpdateKind::Snapshot);

        let (_manager, mut client) = connect(&ctx, NodeType::Manager, Vec::new());
        ctx.manager_updates.queue_state_change(delta(1, 1001));
        ctx.manager_updates.queue_state_change(delta(2, 1002));
        clock.advance(TimeDelta::seconds(5));
        let report = executer.run_cycle().unwrap();
        assert_eq!(report.kind, UpdateKind::Deltas(2));
        assert_eq!(report.dispatched.len(), 2);

        for _ in 0..2 {
            assert_eq!(accept_one(&mut client).message, MessageType::StateChange);
        }
        for handle in report.dispatched {
            handle.join().unwrap();
        }
        assert_eq!(executer.run_cycle().unwrap().kind, UpdateKind::Idle);
    }

    #[test]
    fn test_interval_and_force_trigger_snapshots() {
        let (ctx, clock, rx) = context(InMemoryStorage::new(), 1000);
        let mut executer = ManagerUpdateExecuter::new(Arc::clone(&ctx), rx.manager_updates, 60);
        executer.run_cycle().unwrap();

        clock.advance(TimeDelta::seconds(59));
        assert_eq!(executer.run_cycle().unwrap().kind, UpdateKind::Idle);
        clock.advance(TimeDelta::seconds(1));
        assert_eq!(executer.run_cycle().unwrap().kind, UpdateKind::Snapshot);

        ctx.manager_updates.force_status_update();
        assert_eq!(executer.run_cycle().unwrap().kind, UpdateKind::Snapshot);
        assert_eq!(executer.run_cycle().unwrap().kind, UpdateKind::Idle);
    }
}
