//! Client sessions.
//!
//! A session is one connected client: its transaction channel, the node it
//! registered as, and when it was last heard from. Sessions live in the
//! [`SessionRegistry`] from accept until their connection thread exits.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::{NodeId, NodeType};
use crate::protocol::TransactionChannel;

/// Connection handling for one session.
pub mod handler;

/// Concurrency-safe registry of live sessions.
pub mod registry;

pub use handler::run_session;
pub use registry::SessionRegistry;

/// Unique identifier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random session ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a session registered as.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub username: String,
    /// Alert levels served by the node's alerts. Empty for other node types.
    pub alert_levels: Vec<u32>,
}

/// One connected client.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    channel: TransactionChannel,
    info: RwLock<Option<SessionInfo>>,
    initialized: AtomicBool,
    last_recv: Mutex<DateTime<Utc>>,
}

impl Session {
    #[must_use]
    pub fn new(channel: TransactionChannel, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            channel,
            info: RwLock::new(None),
            initialized: AtomicBool::new(false),
            last_recv: Mutex::new(now),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn channel(&self) -> &TransactionChannel {
        &self.channel
    }

    /// Registration data, once the node registered.
    #[must_use]
    pub fn info(&self) -> Option<SessionInfo> {
        self.info.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_info(&self, info: SessionInfo) {
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = Some(info);
    }

    #[must_use]
    pub fn node_id(&self) -> Option<NodeId> {
        self.info.read().unwrap_or_else(PoisonError::into_inner).as_ref().map(|i| i.node_id)
    }

    #[must_use]
    pub fn node_type(&self) -> Option<NodeType> {
        self.info.read().unwrap_or_else(PoisonError::into_inner).as_ref().map(|i| i.node_type)
    }

    /// Whether the session finished its initial synchronization and may
    /// receive pushed messages.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Initialized and registered as `node_type`.
    #[must_use]
    pub fn serves(&self, node_type: NodeType) -> bool {
        self.is_initialized() && !self.channel.is_closed() && self.node_type() == Some(node_type)
    }

    /// Records that a message was received from the client.
    pub fn touch(&self, now: DateTime<Utc>) {
        *self.last_recv.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    #[must_use]
    pub fn last_recv(&self) -> DateTime<Utc> {
        *self.last_recv.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Closes the connection; the session thread notices and cleans up.
    pub fn close(&self) {
        self.channel.close();
    }
}
