use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Free-form key/value data attached to signals and configs
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Confidence strictly above this is actionable
pub const EXECUTION_THRESHOLD: f64 = 0.5;

/// What a function wants done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    None,
    EnterLong,
    EnterShort,
    Exit,
    ModifyStop,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::None => "none",
            SignalAction::EnterLong => "enter_long",
            SignalAction::EnterShort => "enter_short",
            SignalAction::Exit => "exit",
            SignalAction::ModifyStop => "modify_stop",
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One function's decision for one context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSignal {
    pub action: SignalAction,
    /// Always within [0, 1]
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ExecutionSignal {
    pub fn new(action: SignalAction, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            action,
            confidence: clamp_confidence(confidence),
            reasoning: reasoning.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn no_action(reasoning: impl Into<String>) -> Self {
        Self::new(SignalAction::None, 0.0, reasoning)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Scale confidence, keeping it clamped
    pub fn scaled(mut self, multiplier: f64) -> Self {
        self.confidence = clamp_confidence(self.confidence * multiplier);
        self
    }

    /// Actionable iff there is an action and confidence is above 0.5 (0.5 itself is not)
    pub fn should_execute(&self) -> bool {
        self.action != SignalAction::None && self.confidence > EXECUTION_THRESHOLD
    }
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_execute_threshold() {
        let at_threshold = ExecutionSignal::new(SignalAction::EnterLong, 0.5, "edge");
        assert!(!at_threshold.should_execute());

        let above = ExecutionSignal::new(SignalAction::EnterLong, 0.51, "above");
        assert!(above.should_execute());

        let no_action = ExecutionSignal::new(SignalAction::None, 0.9, "nothing");
        assert!(!no_action.should_execute());
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(ExecutionSignal::new(SignalAction::Exit, 1.7, "x").confidence, 1.0);
        assert_eq!(ExecutionSignal::new(SignalAction::Exit, -0.3, "x").confidence, 0.0);
        assert_eq!(ExecutionSignal::new(SignalAction::Exit, f64::NAN, "x").confidence, 0.0);

        let boosted = ExecutionSignal::new(SignalAction::Exit, 0.9, "x").scaled(1.2);
        assert_eq!(boosted.confidence, 1.0);
    }

    #[test]
    fn test_action_serde_names() {
        let json = serde_json::to_string(&SignalAction::EnterShort).unwrap();
        assert_eq!(json, "\"enter_short\"");
        let action: SignalAction = serde_json::from_str("\"modify_stop\"").unwrap();
        assert_eq!(action, SignalAction::ModifyStop);
    }
}
