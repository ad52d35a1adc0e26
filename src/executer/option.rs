//! Delayed option changes.
//!
//! Managers change options such as `alertSystemActive` with an optional
//! delay. A scheduled change replaces an earlier pending change of the same
//! option. Applying a change forces a status snapshot to every manager;
//! switching the alert system off also tells every alert node to stop.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::context::ServerContext;
use crate::error::{AlertrError, AlertrResult};
use crate::node::NodeType;
use crate::snapshot::ALERT_SYSTEM_ACTIVE;
use crate::time::secs;

use super::dispatcher::{dispatch_to_role, Dispatch};

/// Payload of an `option` request.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionChange {
    pub option_type: String,
    pub value: f64,
    /// Seconds to wait before applying the change.
    #[serde(default)]
    pub time_delay: u64,
}

/// An option change with the instant it becomes due.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledOption {
    pub change: OptionChange,
    pub due: DateTime<Utc>,
}

/// Schedules option changes.
#[derive(Debug, Clone)]
pub struct OptionHandle {
    tx: Sender<ScheduledOption>,
}

impl OptionHandle {
    pub(crate) fn new() -> (Self, Receiver<ScheduledOption>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    /// Schedules `change` for `now + time_delay`.
    pub fn schedule(&self, change: OptionChange, now: DateTime<Utc>) -> AlertrResult<()> {
        let due = now + secs(change.time_delay);
        self.tx
            .send(ScheduledOption { change, due })
            .map_err(|_| AlertrError::internal("option executer is gone"))
    }
}

/// The option executer.
#[derive(Debug)]
pub struct OptionExecuter {
    ctx: Arc<ServerContext>,
    rx: Receiver<ScheduledOption>,
    pending: Vec<ScheduledOption>,
}

impl OptionExecuter {
    #[must_use]
    pub fn new(ctx: Arc<ServerContext>, rx: Receiver<ScheduledOption>) -> Self {
        Self {
            ctx,
            rx,
            pending: Vec::new(),
        }
    }

    /// Option changes waiting for their delay.
    #[must_use]
    pub fn pending(&self) -> &[ScheduledOption] {
        &self.pending
    }

    fn accept(&mut self, scheduled: ScheduledOption) {
        self.pending.retain(|p| p.change.option_type != scheduled.change.option_type);
        self.pending.push(scheduled);
    }

    /// Collects newly scheduled changes and applies the due ones.
    pub fn run_cycle(&mut self) -> AlertrResult<Vec<JoinHandle<()>>> {
        while let Ok(scheduled) = self.rx.try_recv() {
            self.accept(scheduled);
        }

        let now = self.ctx.clock.now();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending).into_iter().partition(|p| p.due <= now);
        self.pending = waiting;
        if due.is_empty() {
            return Ok(Vec::new());
        }

        let mut dispatched = Vec::new();
        let mut result = Ok(());
        for ScheduledOption { change, .. } in due {
            if let Err(e) = self.apply(&change, &mut dispatched) {
                error!(option = %change.option_type, error = %e, "failed to apply option change");
                result = Err(e);
            }
        }
        self.ctx.manager_updates.force_status_update();
        result.map(|()| dispatched)
    }

    fn apply(&self, change: &OptionChange, dispatched: &mut Vec<JoinHandle<()>>) -> AlertrResult<()> {
        let storage = &self.ctx.storage;
        let was_active = storage.is_system_active()?;
        storage.set_option(&change.option_type, change.value)?;
        info!(option = %change.option_type, value = change.value, "option changed");

        if change.option_type == ALERT_SYSTEM_ACTIVE && was_active && change.value <= 0.0 {
            info!("alert system deactivated, switching off alert nodes");
            dispatched.extend(dispatch_to_role(&self.ctx.sessions, NodeType::Alert, || Dispatch::AlertsOff));
        }
        Ok(())
    }

    /// Starts the executer loop on its own thread.
    #[must_use]
    pub fn spawn(mut self, poll: Duration) -> JoinHandle<()> {
        thread::Builder::new()
            .name("alertr-options".to_string())
            .spawn(move || self.run(poll))
            .expect("failed to spawn option executer")
    }

    fn run(&mut self, poll: Duration) {
        info!("option executer started");
        while !self.ctx.is_shutting_down() {
            if let Err(e) = self.run_cycle() {
                error!(error = %e, "option cycle failed");
            }
            match self.rx.recv_timeout(poll) {
                Ok(scheduled) => self.accept(scheduled),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("option executer stopped");
    }
}
