//! Rule chains.
//!
//! An alert level with rules owns an ordered chain of [`RuleStart`] links.
//! Link `i` only counts as triggered when it activated within
//! `[minTimeAfterPrev, maxTimeAfterPrev]` of link `i - 1`. The last link
//! gates the alert level; when it fires, every link is reset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RuleError;
use crate::sensor::RawSensorAlert;
use crate::time::secs;

use super::element::RuleElement;
use super::evaluator::{refresh, EvalContext};

/// Seconds a delayed raw alert is kept past its activation time.
const PENDING_GRACE_SECS: u64 = 5;

/// One link of a rule chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleStart {
    /// Position in the chain.
    pub order: u32,
    /// Seconds after the previous link before this one may count.
    #[serde(default)]
    pub min_time_after_prev: u64,
    /// Seconds after the previous link after which this one no longer counts.
    #[serde(default)]
    pub max_time_after_prev: u64,
    #[serde(default)]
    pub counter_activated: bool,
    /// Triggers allowed within `counter_wait_time`.
    #[serde(default)]
    pub counter_limit: usize,
    #[serde(default)]
    pub counter_wait_time: u64,
    /// Root of this link's rule tree.
    pub element: RuleElement,
    #[serde(skip)]
    counter_list: Vec<DateTime<Utc>>,
}

impl RuleStart {
    /// Creates a link without timing window or counter.
    #[must_use]
    pub fn new(order: u32, element: RuleElement) -> Self {
        Self {
            order,
            min_time_after_prev: 0,
            max_time_after_prev: 0,
            counter_activated: false,
            counter_limit: 0,
            counter_wait_time: 0,
            element,
            counter_list: Vec::new(),
        }
    }

    /// Sets the window relative to the previous link, in seconds.
    #[must_use]
    pub fn with_window(mut self, min_secs: u64, max_secs: u64) -> Self {
        self.min_time_after_prev = min_secs;
        self.max_time_after_prev = max_secs;
        self
    }

    /// Allows at most `limit` triggers within `wait_secs`.
    #[must_use]
    pub fn with_counter(mut self, limit: usize, wait_secs: u64) -> Self {
        self.counter_activated = true;
        self.counter_limit = limit;
        self.counter_wait_time = wait_secs;
        self
    }

    #[must_use]
    pub const fn triggered(&self) -> bool {
        self.element.triggered()
    }

    #[must_use]
    pub const fn time_when_triggered(&self) -> DateTime<Utc> {
        self.element.time_when_triggered()
    }

    /// Trigger times currently counted against the limit.
    #[must_use]
    pub fn counter_list(&self) -> &[DateTime<Utc>] {
        &self.counter_list
    }

    /// Validates the window and the rule tree.
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.min_time_after_prev > self.max_time_after_prev {
            return Err(RuleError::InvalidWindow {
                order: self.order,
                min_secs: self.min_time_after_prev,
                max_secs: self.max_time_after_prev,
            });
        }
        self.element.validate()
    }

    fn reset(&mut self) {
        self.element.state.reset();
    }

    fn within_window_of(&self, prev: &Self) -> bool {
        let anchor = prev.time_when_triggered();
        let at = self.time_when_triggered();
        anchor + secs(self.min_time_after_prev) <= at && at <= anchor + secs(self.max_time_after_prev)
    }

    fn apply_counter(&mut self, now: DateTime<Utc>) {
        if !self.counter_activated {
            return;
        }
        let wait = secs(self.counter_wait_time);
        self.counter_list.retain(|t| *t + wait >= now);

        if !self.triggered() {
            return;
        }
        let at = self.time_when_triggered();
        if self.counter_list.contains(&at) {
            return;
        }
        if self.counter_list.len() < self.counter_limit {
            self.counter_list.push(at);
        } else {
            debug!(order = self.order, limit = self.counter_limit, "rule reached its counter limit, resetting");
            self.reset();
        }
    }
}

/// The ordered rule chain of one alert level.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleChain {
    level: u32,
    links: Vec<RuleStart>,
}

impl RuleChain {
    /// Builds a chain, ordering links by `order`.
    #[must_use]
    pub fn new(level: u32, mut links: Vec<RuleStart>) -> Self {
        links.sort_by_key(|l| l.order);
        Self { level, links }
    }

    #[must_use]
    pub const fn level(&self) -> u32 {
        self.level
    }

    #[must_use]
    pub fn links(&self) -> &[RuleStart] {
        &self.links
    }

    /// Runs one full evaluation cycle and reports whether the chain fired.
    ///
    /// Expired raw alerts are removed from `pending`.
    pub fn process(&mut self, pending: &mut Vec<RawSensorAlert>, now: DateTime<Utc>) -> Result<bool, RuleError> {
        self.update(pending, now)?;
        prune_pending(pending, now);
        for link in &mut self.links {
            link.apply_counter(now);
        }
        Ok(self.take_fired())
    }

    /// Evaluates every link and enforces the timing windows between them.
    pub fn update(&mut self, pending: &[RawSensorAlert], now: DateTime<Utc>) -> Result<(), RuleError> {
        let ctx = EvalContext { now, pending };
        for link in &mut self.links {
            refresh(&mut link.element, &ctx)?;
        }

        for idx in 1..self.links.len() {
            let (before, rest) = self.links.split_at_mut(idx);
            let prev = &before[idx - 1];
            let cur = &mut rest[0];
            if cur.triggered() && !cur.within_window_of(prev) {
                debug!(
                    level = self.level,
                    order = cur.order,
                    "rule triggered outside its window after the previous rule, resetting"
                );
                cur.reset();
            }
        }
        Ok(())
    }

    /// Resets the chain and returns true if its last link is triggered.
    pub fn take_fired(&mut self) -> bool {
        let fired = self.links.last().is_some_and(RuleStart::triggered);
        if fired {
            self.reset();
        }
        fired
    }

    /// Marks every link as not triggered.
    pub fn reset(&mut self) {
        for link in &mut self.links {
            link.reset();
        }
    }

    /// Whether further cycles could still make this chain fire.
    #[must_use]
    pub fn can_still_trigger(&self, pending: &[RawSensorAlert]) -> bool {
        !pending.is_empty() || self.links.iter().any(|l| l.element.any_leaf_triggered())
    }
}

/// Drops raw alerts without delay and delayed ones past their grace period.
pub fn prune_pending(pending: &mut Vec<RawSensorAlert>, now: DateTime<Utc>) {
    pending.retain(|alert| {
        let grace = secs(alert.alert_delay.saturating_add(PENDING_GRACE_SECS));
        alert.alert_delay != 0 && now - alert.time_received <= grace
    });
}
