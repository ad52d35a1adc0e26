//! Rule tree elements.
//!
//! A rule is a small AST: time and sensor leaves combined by AND/OR/NOT
//! nodes. Every element carries its own mutable [`TriggerState`]; the
//! configuration part ([`RuleKind`]) is what gets (de)serialized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RuleError;
use crate::time::{epoch, TimeZoneSpec};

/// Boolean combinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BooleanOp {
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
    #[serde(alias = "NOT")]
    Not,
}

impl BooleanOp {
    /// Upper-case name used in logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::Not => "NOT",
        }
    }
}

/// Configuration of one rule element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Triggered while a raw alert of the addressed sensor is active.
    Sensor {
        /// Username of the sensor node.
        username: String,
        /// Sensor id as known to its node.
        client_sensor_id: i64,
        /// Seconds a sensor alert keeps this leaf triggered.
        time_triggered_for: u64,
    },
    /// Triggered on one day of the week (0 = Monday).
    Weekday {
        #[serde(default)]
        time: TimeZoneSpec,
        weekday: u32,
    },
    /// Triggered on one day of the month.
    Monthday {
        #[serde(default)]
        time: TimeZoneSpec,
        monthday: u32,
    },
    /// Triggered while the hour lies within `start..=end`.
    Hour {
        #[serde(default)]
        time: TimeZoneSpec,
        start: u32,
        end: u32,
    },
    /// Triggered while the local minute lies within `start..=end`.
    Minute { start: u32, end: u32 },
    /// Triggered while the local second lies within `start..=end`.
    Second { start: u32, end: u32 },
    /// Combines child elements.
    Boolean { op: BooleanOp, children: Vec<RuleElement> },
    /// Any element type this build does not know.
    #[serde(other)]
    Unknown,
}

/// Mutable evaluation state of a rule element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerState {
    pub triggered: bool,
    pub time_when_triggered: DateTime<Utc>,
}

impl Default for TriggerState {
    fn default() -> Self {
        Self {
            triggered: false,
            time_when_triggered: epoch(),
        }
    }
}

impl TriggerState {
    /// Back to "never triggered".
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A rule element: configuration plus evaluation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RuleKind", into = "RuleKind")]
pub struct RuleElement {
    pub kind: RuleKind,
    pub state: TriggerState,
}

impl From<RuleKind> for RuleElement {
    fn from(kind: RuleKind) -> Self {
        Self {
            kind,
            state: TriggerState::default(),
        }
    }
}

impl From<RuleElement> for RuleKind {
    fn from(element: RuleElement) -> Self {
        element.kind
    }
}

impl RuleElement {
    /// Creates a sensor leaf.
    #[must_use]
    pub fn sensor(username: impl Into<String>, client_sensor_id: i64, time_triggered_for: u64) -> Self {
        RuleKind::Sensor {
            username: username.into(),
            client_sensor_id,
            time_triggered_for,
        }
        .into()
    }

    /// Creates a boolean node.
    #[must_use]
    pub fn boolean(op: BooleanOp, children: Vec<RuleElement>) -> Self {
        RuleKind::Boolean { op, children }.into()
    }

    #[must_use]
    pub const fn triggered(&self) -> bool {
        self.state.triggered
    }

    #[must_use]
    pub const fn time_when_triggered(&self) -> DateTime<Utc> {
        self.state.time_when_triggered
    }

    /// Whether this element is a leaf (anything but a boolean node).
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        !matches!(self.kind, RuleKind::Boolean { .. })
    }

    /// True if any leaf below (or at) this element is currently triggered.
    #[must_use]
    pub fn any_leaf_triggered(&self) -> bool {
        match &self.kind {
            RuleKind::Boolean { children, .. } => children.iter().any(Self::any_leaf_triggered),
            _ => self.state.triggered,
        }
    }

    /// Checks the element and its children for values that cannot be evaluated.
    pub fn validate(&self) -> Result<(), RuleError> {
        match &self.kind {
            RuleKind::Sensor { .. } => Ok(()),
            RuleKind::Weekday { weekday, .. } => in_range("weekday", *weekday, 0, 6),
            RuleKind::Monthday { monthday, .. } => in_range("monthday", *monthday, 1, 31),
            RuleKind::Hour { start, end, .. } => {
                in_range("hour start", *start, 0, 23)?;
                in_range("hour end", *end, *start, 23)
            }
            RuleKind::Minute { start, end } => {
                in_range("minute start", *start, 0, 59)?;
                in_range("minute end", *end, *start, 59)
            }
            RuleKind::Second { start, end } => {
                in_range("second start", *start, 0, 59)?;
                in_range("second end", *end, *start, 59)
            }
            RuleKind::Boolean { op, children } => {
                if *op == BooleanOp::Not && children.len() != 1 {
                    return Err(RuleError::InvalidNotArity {
                        children: children.len(),
                    });
                }
                if children.is_empty() {
                    return Err(RuleError::EmptyBoolean {
                        op: op.as_str().to_string(),
                    });
                }
                children.iter().try_for_each(Self::validate)
            }
            RuleKind::Unknown => Err(RuleError::UnknownElement),
        }
    }
}

fn in_range(field: &'static str, value: u32, min: u32, max: u32) -> Result<(), RuleError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(RuleError::OutOfRange { field, value })
    }
}
