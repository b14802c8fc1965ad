//! Error types for the decision engine.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Reasons a bar is rejected before it reaches history.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Invalid {field} price: {value}")]
    InvalidPrice { field: &'static str, value: f64 },

    #[error("Invalid volume: {0}")]
    InvalidVolume(f64),

    #[error("High ({high}) is less than {field} ({value})")]
    HighBelow {
        field: &'static str,
        high: f64,
        value: f64,
    },

    #[error("Low ({low}) is greater than {field} ({value})")]
    LowAbove {
        field: &'static str,
        low: f64,
        value: f64,
    },

    #[error("Bar timestamp is in the future: {timestamp} (now: {now})")]
    FutureTimestamp {
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("Non-monotonic timestamp for {key}: {timestamp} is before last stored {last}")]
    NonMonotonic {
        key: String,
        timestamp: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error("Empty symbol")]
    EmptySymbol,

    #[error("Unknown timeframe: {0}")]
    UnknownTimeframe(String),
}

/// Configuration and registry failures. Raised at construction, never at evaluation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FunctionError {
    #[error("unknown function type: {0}")]
    UnknownType(String),

    #[error("function type already registered: {0}")]
    DuplicateType(String),

    #[error("function name already in use: {0}")]
    DuplicateName(String),

    #[error("function {function}: missing required parameter '{parameter}'")]
    MissingParameter { function: String, parameter: String },

    #[error("function {function}: invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        function: String,
        parameter: String,
        reason: String,
    },

    #[error("invalid function config: {0}")]
    InvalidConfig(String),
}

/// A function failed while evaluating a context.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("function panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Signal distribution failures.
#[derive(Debug, Error)]
pub enum SignalError {
    /// Downstream order placement is refusing work
    #[error("circuit open: {0}")]
    CircuitOpen(String),

    #[error("signal callback failed: {0}")]
    Callback(#[from] anyhow::Error),

    #[error("signal callback panicked: {0}")]
    Panicked(String),
}

impl SignalError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, SignalError::CircuitOpen(_))
    }
}

/// Durable audit storage failures. Never propagated out of the logger.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Render a caught panic payload as text
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
