//! Rule tree evaluation.
//!
//! Evaluation runs in two passes over a tree. [`update_leaves`] refreshes
//! every sensor and time leaf from the raw alerts and the wall clock;
//! [`evaluate`] then recomputes the boolean nodes from their children.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::RuleError;
use crate::sensor::RawSensorAlert;
use crate::time::{secs, TimeZoneSpec, WallFields};

use super::element::{BooleanOp, RuleElement, RuleKind, TriggerState};

/// Inputs of one evaluation pass.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub now: DateTime<Utc>,
    /// Raw alerts that have not expired yet.
    pub pending: &'a [RawSensorAlert],
}

/// Refreshes every leaf of the tree rooted at `element`.
pub fn update_leaves(element: &mut RuleElement, ctx: &EvalContext<'_>) -> Result<(), RuleError> {
    let RuleElement { kind, state } = element;
    match kind {
        RuleKind::Sensor {
            username,
            client_sensor_id,
            time_triggered_for,
        } => {
            update_sensor_leaf(state, username, *client_sensor_id, *time_triggered_for, ctx);
            Ok(())
        }
        RuleKind::Weekday { time, weekday } => {
            let matches = WallFields::at(ctx.now, *time).weekday == *weekday;
            apply_window(state, matches, ctx.now);
            Ok(())
        }
        RuleKind::Monthday { time, monthday } => {
            let matches = WallFields::at(ctx.now, *time).monthday == *monthday;
            apply_window(state, matches, ctx.now);
            Ok(())
        }
        RuleKind::Hour { time, start, end } => {
            let hour = WallFields::at(ctx.now, *time).hour;
            apply_window(state, (*start..=*end).contains(&hour), ctx.now);
            Ok(())
        }
        RuleKind::Minute { start, end } => {
            let minute = WallFields::at(ctx.now, TimeZoneSpec::Local).minute;
            apply_window(state, (*start..=*end).contains(&minute), ctx.now);
            Ok(())
        }
        RuleKind::Second { start, end } => {
            let second = WallFields::at(ctx.now, TimeZoneSpec::Local).second;
            apply_window(state, (*start..=*end).contains(&second), ctx.now);
            Ok(())
        }
        RuleKind::Boolean { children, .. } => children.iter_mut().try_for_each(|child| update_leaves(child, ctx)),
        RuleKind::Unknown => Err(RuleError::UnknownElement),
    }
}

fn update_sensor_leaf(
    state: &mut TriggerState,
    username: &str,
    client_sensor_id: i64,
    time_triggered_for: u64,
    ctx: &EvalContext<'_>,
) {
    let hold = secs(time_triggered_for);

    if state.triggered && state.time_when_triggered + hold < ctx.now {
        debug!(username, client_sensor_id, "sensor no longer counts as triggered");
        state.triggered = false;
    }

    let matching = ctx
        .pending
        .iter()
        .filter(|alert| alert.username == username && alert.client_sensor_id == client_sensor_id);

    for alert in matching {
        let activation = alert.activation_time();
        if activation <= state.time_when_triggered {
            continue;
        }
        if !alert.delay_elapsed(ctx.now) {
            debug!(username, client_sensor_id, "sensor alert still delayed");
            continue;
        }

        state.time_when_triggered = activation;
        state.triggered = activation + hold > ctx.now;
    }
}

/// Time leaves restamp on every transition in either direction.
fn apply_window(state: &mut TriggerState, matches: bool, now: DateTime<Utc>) {
    if matches != state.triggered {
        state.triggered = matches;
        state.time_when_triggered = now;
    }
}

/// Recomputes the boolean nodes of the tree rooted at `element`.
///
/// Leaves are left untouched; call [`update_leaves`] first.
pub fn evaluate(element: &mut RuleElement, now: DateTime<Utc>) -> Result<(), RuleError> {
    let RuleElement { kind, state } = element;
    let RuleKind::Boolean { op, children } = kind else {
        return Ok(());
    };

    let triggered = match op {
        BooleanOp::And => evaluate_and(children, now)?,
        BooleanOp::Or => evaluate_or(children, now)?,
        BooleanOp::Not => {
            if children.len() != 1 {
                return Err(RuleError::InvalidNotArity {
                    children: children.len(),
                });
            }
            let child = &mut children[0];
            evaluate(child, now)?;
            !child.triggered()
        }
    };

    if triggered && !state.triggered {
        state.time_when_triggered = now;
    }
    state.triggered = triggered;
    Ok(())
}

fn evaluate_and(children: &mut [RuleElement], now: DateTime<Utc>) -> Result<bool, RuleError> {
    if children.is_empty() {
        return Err(RuleError::EmptyBoolean {
            op: BooleanOp::And.as_str().to_string(),
        });
    }
    for child in children.iter_mut() {
        evaluate(child, now)?;
        if !child.triggered() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Already-triggered leaves win before any nested boolean is descended into.
fn evaluate_or(children: &mut [RuleElement], now: DateTime<Utc>) -> Result<bool, RuleError> {
    if children.is_empty() {
        return Err(RuleError::EmptyBoolean {
            op: BooleanOp::Or.as_str().to_string(),
        });
    }
    if children.iter().any(|c| c.is_leaf() && c.triggered()) {
        return Ok(true);
    }
    for child in children.iter_mut().filter(|c| !c.is_leaf()) {
        evaluate(child, now)?;
        if child.triggered() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Runs both passes over one tree.
pub fn refresh(element: &mut RuleElement, ctx: &EvalContext<'_>) -> Result<(), RuleError> {
    update_leaves(element, ctx)?;
    evaluate(element, ctx.now)
}
