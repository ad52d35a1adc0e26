//! Error types for AlertR.
//!
//! Every failure is strongly typed using thiserror and grouped by how the
//! caller is expected to react: protocol violations end a connection,
//! transport failures are retried by reconnecting, consistency failures
//! reject a resync, rule failures skip one alert level for one cycle.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::StorageError;

/// Violations of the transaction protocol. Always fatal to the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {reason}")]
    MalformedEnvelope {
        reason: String,
    },

    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        expected: String,
        actual: String,
    },

    #[error("Handshake not accepted after {attempts} attempts")]
    HandshakeExhausted {
        attempts: u32,
    },

    #[error("Frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        size: usize,
        max: usize,
    },

    #[error("Peer reported error: {message}")]
    PeerError {
        message: String,
    },

    #[error("Message '{message}' not permitted for {role} nodes")]
    NotPermitted {
        message: String,
        role: String,
    },

    #[error("Registration rejected: {reason}")]
    RegistrationRejected {
        reason: String,
    },

    #[error("Connection closed")]
    Closed,
}

/// Socket and TLS level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Timed out after {duration_ms}ms waiting for {context}")]
    Timeout {
        context: &'static str,
        duration_ms: u64,
    },

    #[error("TLS error: {message}")]
    Tls {
        message: String,
    },

    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
    },
}

impl TransportError {
    /// Wraps an I/O error with the operation that produced it.
    #[must_use]
    pub fn io(context: &'static str, source: io::Error) -> Self {
        Self::Io { context, source }
    }
}

/// A resync snapshot contradicts itself. The snapshot is rejected as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("{kind} id {id} is not unique")]
    DuplicateKey {
        kind: &'static str,
        id: String,
    },

    #[error("{kind} {id} references unknown node {node_id}")]
    DanglingReference {
        kind: &'static str,
        id: String,
        node_id: i64,
    },
}

/// Rule configuration that cannot be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("Unknown rule element type")]
    UnknownElement,

    #[error("NOT element must have exactly one child, found {children}")]
    InvalidNotArity {
        children: usize,
    },

    #[error("{op} element has no children")]
    EmptyBoolean {
        op: String,
    },

    #[error("Value {value} out of range for {field}")]
    OutOfRange {
        field: &'static str,
        value: u32,
    },

    #[error("Rule {order}: minimum time after previous ({min_secs}s) exceeds maximum ({max_secs}s)")]
    InvalidWindow {
        order: u32,
        min_secs: u64,
        max_secs: u64,
    },

    #[error("Alert level {level} is defined more than once")]
    DuplicateAlertLevel {
        level: u32,
    },

    #[error("Alert level {level} has rules activated but no rule chain")]
    EmptyChain {
        level: u32,
    },
}

/// Top-level error type for AlertR.
#[derive(Debug, Error)]
pub enum AlertrError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl AlertrError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a protocol error.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if this is a rule configuration error.
    #[must_use]
    pub const fn is_rule(&self) -> bool {
        matches!(self, Self::Rule(_))
    }

    /// Returns true if the connection that produced this error must be closed.
    #[must_use]
    pub const fn is_fatal_to_connection(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Transport(_))
    }

    /// Returns true if reconnecting may succeed where this attempt failed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => !matches!(e, TransportError::Tls { .. }),
            Self::Protocol(e) => matches!(e, ProtocolError::HandshakeExhausted { .. } | ProtocolError::Closed),
            Self::Consistency(_) | Self::Rule(_) | Self::Storage(_) | Self::Config(_) | Self::Internal { .. } => false,
        }
    }
}

impl From<serde_json::Error> for AlertrError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(ProtocolError::MalformedEnvelope { reason: e.to_string() })
    }
}

/// Result type alias for AlertR operations.
pub type AlertrResult<T> = Result<T, AlertrError>;
