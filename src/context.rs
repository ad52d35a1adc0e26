//! Shared server state handed to session threads and executers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::executer::manager_update::ManagerUpdateHandle;
use crate::executer::option::{OptionHandle, ScheduledOption};
use crate::executer::sensor_alert::SensorAlertHandle;
use crate::protocol::ChannelConfig;
use crate::session::SessionRegistry;
use crate::storage::Storage;
use crate::time::Clock;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub channel: ChannelConfig,
    /// How long a new connection may take to send its `initialization` request.
    pub registration_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            registration_timeout: Duration::from_secs(50),
        }
    }
}

/// Receiving ends of the executer wake-up channels.
#[allow(missing_docs)]
#[derive(Debug)]
pub struct ExecuterReceivers {
    pub sensor_alerts: Receiver<()>,
    pub manager_updates: Receiver<()>,
    pub options: Receiver<ScheduledOption>,
}

/// Everything a session or executer needs, shared behind one `Arc`.
#[allow(missing_docs)]
#[derive(Debug)]
pub struct ServerContext {
    pub storage: Arc<dyn Storage>,
    pub sessions: SessionRegistry,
    pub clock: Arc<dyn Clock>,
    pub sensor_alerts: SensorAlertHandle,
    pub manager_updates: ManagerUpdateHandle,
    pub options: OptionHandle,
    pub settings: SessionSettings,
    shutdown: AtomicBool,
}

impl ServerContext {
    /// Creates the context and the receivers its executers consume.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, settings: SessionSettings) -> (Arc<Self>, ExecuterReceivers) {
        let (sensor_alerts, sensor_rx) = SensorAlertHandle::new();
        let (manager_updates, manager_rx) = ManagerUpdateHandle::new();
        let (options, options_rx) = OptionHandle::new();

        let ctx = Arc::new(Self {
            storage,
            sessions: SessionRegistry::new(),
            clock,
            sensor_alerts,
            manager_updates,
            options,
            settings,
            shutdown: AtomicBool::new(false),
        });
        let receivers = ExecuterReceivers {
            sensor_alerts: sensor_rx,
            manager_updates: manager_rx,
            options: options_rx,
        };
        (ctx, receivers)
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Asks every loop to stop at its next boundary and closes all sessions.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.sensor_alerts.wake();
        self.manager_updates.wake();
        self.sessions.close_all();
    }
}
