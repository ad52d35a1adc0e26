//! The listening server.
//!
//! `Server::bind` wires storage, the shared context, the executers and the
//! watchdog together; `Server::run` accepts connections until shutdown and
//! serves each on its own thread.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::context::{ExecuterReceivers, ServerContext};
use crate::error::{AlertrError, AlertrResult, TransportError};
use crate::executer::{ManagerUpdateExecuter, OptionExecuter, SensorAlertExecuter};
use crate::internal_sensor::InternalSensors;
use crate::protocol::{accept_tls, load_server_config, TransactionChannel};
use crate::session::{run_session, Session};
use crate::storage::Storage;
use crate::time::{Clock, SystemClock};
use crate::watchdog::{ConnectionWatchdog, FailureNotifier, LoggingObserver, NodeTimeoutObserver, ReconnectPolicy};

/// Sleep of the accept loop when no connection is pending.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Stops a running server from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    ctx: Arc<ServerContext>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.ctx.request_shutdown();
    }
}

/// A bound, not yet running server.
pub struct Server {
    config: ServerConfig,
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    tls: Option<Arc<rustls::ServerConfig>>,
    receivers: ExecuterReceivers,
    internal: InternalSensors,
    timeout_observer: Arc<dyn NodeTimeoutObserver>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind_address", &self.config.bind_address)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Binds the listener using the system clock.
    pub fn bind(config: ServerConfig, storage: Arc<dyn Storage>) -> AlertrResult<Self> {
        Self::bind_with(config, storage, Arc::new(SystemClock), Arc::new(LoggingObserver))
    }

    /// Binds the listener with an explicit clock and persistent node observer.
    pub fn bind_with(
        config: ServerConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        timeout_observer: Arc<dyn NodeTimeoutObserver>,
    ) -> AlertrResult<Self> {
        config.validate()?;

        let tls = match &config.tls {
            Some(tls) => Some(load_server_config(&tls.cert_file, &tls.key_file)?),
            None => {
                warn!("no TLS certificate configured, accepting plaintext connections");
                None
            }
        };

        let listener = TcpListener::bind(&config.bind_address).map_err(|e| TransportError::io("bind", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| TransportError::io("set listener nonblocking", e))?;

        let (ctx, receivers) = ServerContext::new(storage, clock, config.session_settings());
        let internal = InternalSensors::register(
            ctx.storage.as_ref(),
            &config.internal_sensors,
            &config.bind_address,
            ctx.clock.now(),
        )?;
        Ok(Self {
            config,
            ctx,
            listener,
            tls,
            receivers,
            internal,
            timeout_observer,
        })
    }

    pub fn local_addr(&self) -> AlertrResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| TransportError::io("local address", e).into())
    }

    #[must_use]
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            ctx: Arc::clone(&self.ctx),
        }
    }

    fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        let executers = self.config.executer_config();
        let receivers = &self.receivers;
        vec![
            SensorAlertExecuter::new(Arc::clone(&self.ctx), receivers.sensor_alerts.clone())
                .spawn(executers.sensor_alert_poll),
            ManagerUpdateExecuter::new(
                Arc::clone(&self.ctx),
                receivers.manager_updates.clone(),
                executers.manager_update_interval_secs,
            )
            .spawn(),
            OptionExecuter::new(Arc::clone(&self.ctx), receivers.options.clone()).spawn(executers.option_poll),
            ConnectionWatchdog::new(
                Arc::clone(&self.ctx),
                Arc::clone(&self.timeout_observer),
                self.config.watchdog_config(),
            )
            .with_internal_sensors(self.internal.clone())
            .spawn(),
        ]
    }

    /// Accepts connections until shutdown, then waits for every worker.
    pub fn run(self) -> AlertrResult<()> {
        let workers = self.spawn_workers();
        info!(addr = %self.local_addr()?, tls = self.tls.is_some(), "server listening");

        let mut policy = ReconnectPolicy::default();
        let mut sessions: Vec<JoinHandle<()>> = Vec::new();
        while !self.ctx.is_shutting_down() {
            match self.listener.accept() {
                Ok((socket, addr)) => {
                    policy.on_success();
                    sessions.retain(|handle| !handle.is_finished());
                    match self.spawn_session(socket, addr) {
                        Ok(handle) => sessions.push(handle),
                        Err(e) => error!(peer = %addr, error = %e, "could not start session"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    let decision = policy.on_failure();
                    let err: AlertrError = TransportError::io("accept", e).into();
                    warn!(error = %err, "accept failed");
                    if decision.notify {
                        LoggingObserver.notify(policy.consecutive_failures(), &err);
                    }
                    thread::sleep(decision.delay);
                }
            }
        }

        info!("server stopping");
        self.ctx.request_shutdown();
        for handle in sessions.into_iter().chain(workers) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        info!("server stopped");
        Ok(())
    }

    fn spawn_session(&self, socket: TcpStream, addr: SocketAddr) -> io::Result<JoinHandle<()>> {
        socket.set_nonblocking(false)?;
        let ctx = Arc::clone(&self.ctx);
        let tls = self.tls.clone();
        thread::Builder::new().name(format!("alertr-session-{addr}")).spawn(move || {
            let channel_cfg = ctx.settings.channel.clone();
            let channel = match tls {
                Some(tls) => match accept_tls(&tls, socket, channel_cfg.handshake_timeout) {
                    Ok(stream) => TransactionChannel::new(stream, channel_cfg),
                    Err(e) => {
                        warn!(peer = %addr, error = %e, "tls handshake failed");
                        return;
                    }
                },
                None => TransactionChannel::new(socket, channel_cfg),
            };
            let session = Arc::new(Session::new(channel, ctx.clock.now()));
            ctx.sessions.insert(Arc::clone(&session));
            run_session(&ctx, &session);
        })
    }
}
