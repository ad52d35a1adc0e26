//! # AlertR - server core of a sensor/alert mesh
//!
//! Sensor nodes report state changes and alerts, alert nodes act on them and
//! manager nodes watch and control the system. The server sits in the middle:
//! it keeps the registry of connected nodes, evaluates alert levels and their
//! rule chains, and pushes results to clients over a transactional channel.
//!
//! ## Core Concepts
//!
//! - **Transaction channel**: RTS/CTS handshake, request, response; one
//!   transaction per connection at a time, initiated by either side
//! - **Alert level**: policy deciding which sensor alerts are acted upon,
//!   optionally guarded by a rule chain
//! - **Rule chain**: ordered rule trees that must become true within
//!   time windows of each other
//! - **Executers**: long-running workers for sensor alerts, manager updates
//!   and delayed option changes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use alertr::{load_config, InMemoryStorage, Server};
//!
//! let config = load_config(Some("alertr.toml".as_ref()))?;
//! let storage = InMemoryStorage::with_policy(config.alert_levels.clone(), config.alert_system_active)?;
//! Server::bind(config, Arc::new(storage))?.run()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod alert_level;
pub mod error;
pub mod node;
pub mod sensor;
pub mod snapshot;
pub mod time;

// Rules and storage
pub mod rules;
pub mod storage;

// Wire protocol and connections
pub mod protocol;
pub mod session;

// Server runtime
pub mod config;
pub mod context;
pub mod executer;
pub mod internal_sensor;
pub mod logging;
pub mod server;
pub mod watchdog;

pub use alert_level::AlertLevel;
pub use config::{load_config, ConfigError, ServerConfig};
pub use context::ServerContext;
pub use internal_sensor::InternalSensors;
pub use error::{AlertrError, AlertrResult, ProtocolError, RuleError, TransportError};
pub use node::{Node, NodeId, NodeRegistration, NodeType};
pub use protocol::{ChannelConfig, MessageType, TransactionChannel};
pub use rules::{RuleChain, RuleElement, RuleStart};
pub use sensor::{RawSensorAlert, Sensor, SensorData, SensorId, SensorState};
pub use server::{Server, ShutdownHandle};
pub use session::{Session, SessionId, SessionRegistry};
pub use snapshot::{SnapshotMirror, StateChange, SystemSnapshot};
pub use storage::{InMemoryStorage, Storage, StorageError};
pub use time::{Clock, ManualClock, SystemClock};
pub use watchdog::{ConnectionWatchdog, ReconnectPolicy};
