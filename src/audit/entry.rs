use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::{ContextSnapshot, ExecutionContext};
use crate::models::Timeframe;
use crate::strategy::{ExecutionSignal, SignalAction};

/// Immutable record of one evaluation attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub function_name: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Absent when the evaluation failed
    pub signal: Option<ExecutionSignal>,
    pub duration_ms: f64,
    pub context: ContextSnapshot,
    pub error: Option<String>,
}

impl ExecutionLogEntry {
    pub fn success(
        function_name: &str,
        context: &ExecutionContext,
        signal: ExecutionSignal,
        duration_ms: f64,
    ) -> Self {
        Self::build(function_name, context, Some(signal), duration_ms, None)
    }

    pub fn failure(
        function_name: &str,
        context: &ExecutionContext,
        error: impl ToString,
        duration_ms: f64,
    ) -> Self {
        Self::build(function_name, context, None, duration_ms, Some(error.to_string()))
    }

    fn build(
        function_name: &str,
        context: &ExecutionContext,
        signal: Option<ExecutionSignal>,
        duration_ms: f64,
        error: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            function_name: function_name.to_string(),
            symbol: context.symbol.clone(),
            timeframe: context.timeframe,
            signal,
            duration_ms,
            context: context.snapshot(),
            error,
        }
    }

    /// Action taken, `None` for failures
    pub fn action(&self) -> SignalAction {
        self.signal
            .as_ref()
            .map(|s| s.action)
            .unwrap_or(SignalAction::None)
    }

    pub fn confidence(&self) -> f64 {
        self.signal.as_ref().map(|s| s.confidence).unwrap_or(0.0)
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// The signal cleared the execution threshold
    pub fn triggered(&self) -> bool {
        self.signal.as_ref().is_some_and(|s| s.should_execute())
    }
}

pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Filters for audit queries. Unset fields match everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub function_name: Option<String>,
    pub action: Option<SignalAction>,
    pub has_error: Option<bool>,
    pub min_confidence: Option<f64>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            symbol: None,
            timeframe: None,
            function_name: None,
            action: None,
            has_error: None,
            min_confidence: None,
            since: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl LogQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = Some(timeframe);
        self
    }

    pub fn function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = Some(name.into());
        self
    }

    pub fn action(mut self, action: SignalAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn has_error(mut self, has_error: bool) -> Self {
        self.has_error = Some(has_error);
        self
    }

    pub fn min_confidence(mut self, confidence: f64) -> Self {
        self.min_confidence = Some(confidence);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, entry: &ExecutionLogEntry) -> bool {
        if self.symbol.as_ref().is_some_and(|s| *s != entry.symbol) {
            return false;
        }
        if self.timeframe.is_some_and(|tf| tf != entry.timeframe) {
            return false;
        }
        if self
            .function_name
            .as_ref()
            .is_some_and(|name| *name != entry.function_name)
        {
            return false;
        }
        if self.action.is_some_and(|action| action != entry.action()) {
            return false;
        }
        if self.has_error.is_some_and(|wanted| wanted != entry.has_error()) {
            return false;
        }
        if self.min_confidence.is_some_and(|min| entry.confidence() < min) {
            return false;
        }
        if self.since.is_some_and(|since| entry.timestamp < since) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Bar;
    use crate::strategy::Metadata;
    use chrono::Duration;

    fn context(symbol: &str) -> ExecutionContext {
        let now = Utc::now();
        ExecutionContext {
            symbol: symbol.to_string(),
            timeframe: Timeframe::Min5,
            current_bar: Bar {
                symbol: symbol.to_string(),
                timeframe: Timeframe::Min5,
                timestamp: now,
                open: 10.0,
                high: 11.0,
                low: 9.0,
                close: 10.5,
                volume: 500.0,
            },
            historical_bars: Vec::new(),
            plan_parameters: Metadata::new(),
            position: None,
            account_balance: 1_000.0,
            timestamp: now,
            edge_cases: Vec::new(),
        }
    }

    #[test]
    fn test_entry_accessors() {
        let ok = ExecutionLogEntry::success(
            "f",
            &context("AAPL"),
            ExecutionSignal::new(SignalAction::EnterLong, 0.7, "up"),
            1.5,
        );
        assert_eq!(ok.action(), SignalAction::EnterLong);
        assert!(ok.triggered());
        assert!(!ok.has_error());
        assert_eq!(ok.context.close, 10.5);

        let failed = ExecutionLogEntry::failure("f", &context("AAPL"), "boom", 0.2);
        assert_eq!(failed.action(), SignalAction::None);
        assert_eq!(failed.confidence(), 0.0);
        assert!(failed.has_error());
        assert!(!failed.triggered());
    }

    #[test]
    fn test_query_filters() {
        let entry = ExecutionLogEntry::success(
            "close_above_181",
            &context("AAPL"),
            ExecutionSignal::new(SignalAction::EnterLong, 0.7, "up"),
            1.0,
        );

        assert!(LogQuery::new().matches(&entry));
        assert!(LogQuery::new().symbol("AAPL").timeframe(Timeframe::Min5).matches(&entry));
        assert!(!LogQuery::new().symbol("MSFT").matches(&entry));
        assert!(!LogQuery::new().timeframe(Timeframe::Min1).matches(&entry));
        assert!(LogQuery::new().function_name("close_above_181").matches(&entry));
        assert!(!LogQuery::new().action(SignalAction::Exit).matches(&entry));
        assert!(!LogQuery::new().has_error(true).matches(&entry));
        assert!(LogQuery::new().min_confidence(0.7).matches(&entry));
        assert!(!LogQuery::new().min_confidence(0.71).matches(&entry));
        assert!(!LogQuery::new()
            .since(entry.timestamp + Duration::seconds(1))
            .matches(&entry));
    }

    #[test]
    fn test_entry_serializes_as_one_line() {
        let entry = ExecutionLogEntry::failure("f", &context("AAPL"), "boom", 0.2);
        let line = serde_json::to_string(&entry).unwrap();
        assert!(!line.contains('\n'));

        let back: ExecutionLogEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back, entry);
    }
}
