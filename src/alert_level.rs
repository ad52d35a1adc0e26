//! Alert levels: the policy deciding which sensor alerts are acted upon.

use serde::{Deserialize, Serialize};

use crate::error::RuleError;
use crate::rules::{RuleChain, RuleStart};
use crate::sensor::SensorState;

fn default_true() -> bool {
    true
}

/// A configured alert level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertLevel {
    /// Unique level number.
    pub level: u32,
    pub name: String,
    /// Fire even while the alert system is deactivated.
    #[serde(default)]
    pub trigger_always: bool,
    /// Act on alerts reporting the triggered state.
    #[serde(default = "default_true")]
    pub trigger_for_triggered: bool,
    /// Act on alerts reporting the normal state.
    #[serde(default)]
    pub trigger_for_normal: bool,
    /// Rule chain; empty means the level fires directly on sensor alerts.
    #[serde(default)]
    pub rules: Vec<RuleStart>,
}

impl AlertLevel {
    /// Creates a rule-free level that acts on triggered alerts.
    #[must_use]
    pub fn new(level: u32, name: impl Into<String>) -> Self {
        Self {
            level,
            name: name.into(),
            trigger_always: false,
            trigger_for_triggered: true,
            trigger_for_normal: false,
            rules: Vec::new(),
        }
    }

    #[must_use]
    pub fn rules_activated(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Whether an alert in `state` passes this level's policy.
    #[must_use]
    pub const fn accepts(&self, state: SensorState, system_active: bool) -> bool {
        if !system_active && !self.trigger_always {
            return false;
        }
        match state {
            SensorState::Triggered => self.trigger_for_triggered,
            SensorState::Normal => self.trigger_for_normal,
        }
    }

    /// A fresh chain for this level's rules.
    #[must_use]
    pub fn chain(&self) -> RuleChain {
        RuleChain::new(self.level, self.rules.clone())
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        self.rules.iter().try_for_each(RuleStart::validate)
    }
}

/// Validates a full set of levels, including uniqueness of level numbers.
pub fn validate_levels(levels: &[AlertLevel]) -> Result<(), RuleError> {
    let mut seen = std::collections::HashSet::new();
    for level in levels {
        if !seen.insert(level.level) {
            return Err(RuleError::DuplicateAlertLevel { level: level.level });
        }
        level.validate()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleElement;

    #[test]
    fn test_accepts_respects_system_flag() {
        let mut level = AlertLevel::new(1, "home");
        assert!(level.accepts(SensorState::Triggered, true));
        assert!(!level.accepts(SensorState::Triggered, false));

        level.trigger_always = true;
        assert!(level.accepts(SensorState::Triggered, false));
    }

    #[test]
    fn test_accepts_respects_state_flags() {
        let mut level = AlertLevel::new(1, "home");
        assert!(!level.accepts(SensorState::Normal, true));
        level.trigger_for_normal = true;
        level.trigger_for_triggered = false;
        assert!(level.accepts(SensorState::Normal, true));
        assert!(!level.accepts(SensorState::Triggered, true));
    }

    #[test]
    fn test_duplicate_levels_rejected() {
        let levels = vec![AlertLevel::new(3, "a"), AlertLevel::new(3, "b")];
        assert_eq!(validate_levels(&levels), Err(RuleError::DuplicateAlertLevel { level: 3 }));
    }

    #[test]
    fn test_defaults_from_json() {
        let level: AlertLevel = serde_json::from_str(r#"{"level": 2, "name": "night"}"#).unwrap();
        assert!(level.trigger_for_triggered);
        assert!(!level.trigger_for_normal);
        assert!(!level.rules_activated());
    }

    #[test]
    fn test_chain_is_a_copy() {
        let mut level = AlertLevel::new(4, "chain");
        level.rules.push(RuleStart::new(0, RuleElement::sensor("pi", 1, 10)));
        let chain = level.chain();
        assert_eq!(chain.level(), 4);
        assert_eq!(chain.links().len(), 1);
        assert!(level.rules_activated());
    }
}
