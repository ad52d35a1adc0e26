//! Wire envelope.
//!
//! Every message is one JSON object:
//! `{"msgTime": <unix secs>, "message": <type>, "size"?: n, "payload"?: {...}, "error"?: "..."}`.
//! Handshake and response payloads carry a `type` of `rts`, `cts` or
//! `response`; request payloads carry `type: "request"` next to their fields.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AlertrError, AlertrResult, ProtocolError};

/// Message types carried in the `message` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Initialization,
    Ping,
    SensorAlert,
    StateChange,
    Status,
    Option,
    SensorAlertsOff,
}

impl MessageType {
    /// Wire name of the message type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::Ping => "ping",
            Self::SensorAlert => "sensoralert",
            Self::StateChange => "statechange",
            Self::Status => "status",
            Self::Option => "option",
            Self::SensorAlertsOff => "sensoralertsoff",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result reported by the receiver of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseResult {
    Ok,
    /// The receiver accepted the message but considers it outdated.
    Expired,
}

/// Payloads of the handshake and the final response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlPayload {
    Rts { id: u32 },
    Cts { id: u32 },
    Response { result: ResponseResult },
}

const REQUEST_TYPE: &str = "request";

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(alias = "time", default = "Utc::now", with = "chrono::serde::ts_seconds")]
    pub msg_time: DateTime<Utc>,
    pub message: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    fn with_control(message: MessageType, control: ControlPayload, size: Option<usize>) -> AlertrResult<Self> {
        Ok(Self {
            msg_time: Utc::now(),
            message,
            size,
            payload: Some(serde_json::to_value(control)?),
            error: None,
        })
    }

    /// Request-to-send announcing a payload of `size` bytes.
    pub fn rts(message: MessageType, id: u32, size: usize) -> AlertrResult<Self> {
        Self::with_control(message, ControlPayload::Rts { id }, Some(size))
    }

    /// Clear-to-send echoing the RTS.
    pub fn cts(message: MessageType, id: u32) -> AlertrResult<Self> {
        Self::with_control(message, ControlPayload::Cts { id }, None)
    }

    /// Final response to a request.
    pub fn response(message: MessageType, result: ResponseResult) -> AlertrResult<Self> {
        Self::with_control(message, ControlPayload::Response { result }, None)
    }

    /// Error reply; the sender closes the connection afterwards.
    #[must_use]
    pub fn error(message: MessageType, reason: impl Into<String>) -> Self {
        Self {
            msg_time: Utc::now(),
            message,
            size: None,
            payload: None,
            error: Some(reason.into()),
        }
    }

    /// Request carrying `body`'s fields plus `type: "request"`.
    pub fn request<T: Serialize>(message: MessageType, body: &T) -> AlertrResult<Self> {
        let mut fields = match serde_json::to_value(body)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(AlertrError::internal(format!(
                    "request body for {message} must be an object, got {other}"
                )))
            }
        };
        fields.insert("type".to_string(), Value::String(REQUEST_TYPE.to_string()));
        Ok(Self {
            msg_time: Utc::now(),
            message,
            size: None,
            payload: Some(Value::Object(fields)),
            error: None,
        })
    }

    /// Fails with `PeerError` if the envelope carries an error.
    pub fn ensure_no_error(&self) -> AlertrResult<()> {
        match &self.error {
            Some(message) => Err(ProtocolError::PeerError {
                message: message.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Decodes the handshake or response payload.
    pub fn control(&self) -> AlertrResult<ControlPayload> {
        let payload = self.payload.as_ref().ok_or_else(|| ProtocolError::MalformedEnvelope {
            reason: format!("{} message without payload", self.message),
        })?;
        ControlPayload::deserialize(payload).map_err(|e| {
            ProtocolError::MalformedEnvelope {
                reason: format!("invalid control payload: {e}"),
            }
            .into()
        })
    }

    /// Decodes a request payload into `T`.
    pub fn request_body<T: DeserializeOwned>(&self) -> AlertrResult<T> {
        self.ensure_no_error()?;
        let payload = self.payload.as_ref().ok_or_else(|| ProtocolError::MalformedEnvelope {
            reason: format!("{} request without payload", self.message),
        })?;
        let kind = payload.get("type").and_then(Value::as_str).unwrap_or_default();
        if kind != REQUEST_TYPE {
            return Err(ProtocolError::UnexpectedMessage {
                expected: REQUEST_TYPE.to_string(),
                actual: kind.to_string(),
            }
            .into());
        }
        T::deserialize(payload).map_err(|e| {
            ProtocolError::MalformedEnvelope {
                reason: format!("invalid {} payload: {e}", self.message),
            }
            .into()
        })
    }
}
